//! `/proc/<pid>/maps`, saved from the tracked process, so that call sites can
//! be printed relative to the object they belong to.

use std::{fs, path::Path};

use crate::{arch::caller::CallSite, census::CensusError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub offset: usize,
    /// File, `[heap]`-style pseudo path, or empty for anonymous memory
    pub path: String,
}

impl Mapping {
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Offset of `addr` within the mapped object
    pub fn object_offset(&self, addr: usize) -> usize {
        addr - self.start + self.offset
    }
}

/// Mappings sorted by start address
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryMap {
    mappings: Vec<Mapping>,
}

fn hex(field: &str) -> Option<usize> {
    usize::from_str_radix(field, 16).ok()
}

/// Split the next whitespace-separated field off the front of `rest`
fn field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();
    if s.is_empty() {
        return None;
    }
    let (field, tail) = s.split_at(s.find(char::is_whitespace).unwrap_or(s.len()));
    *rest = tail;
    Some(field)
}

fn parse_line(mut line: &str) -> Option<Mapping> {
    // start-end perms offset dev inode [path]
    let (start, end) = field(&mut line)?.split_once('-')?;
    let _perms = field(&mut line).filter(|p| p.len() == 4)?;
    let offset = hex(field(&mut line)?)?;
    let _dev = field(&mut line)?;
    let _inode = field(&mut line)?.parse::<u64>().ok()?;
    Some(Mapping {
        start: hex(start)?,
        end: hex(end)?,
        offset,
        path: line.trim().to_owned(),
    })
}

impl MemoryMap {
    pub fn parse(text: &str) -> Result<Self, CensusError> {
        let mut mappings = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                parse_line(line).ok_or_else(|| CensusError::BadMapsLine {
                    line_no: i + 1,
                    line: line.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        mappings.sort_unstable_by_key(|m| m.start);
        Ok(Self { mappings })
    }

    pub fn from_file(path: &Path) -> Result<Self, CensusError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn find(&self, addr: usize) -> Option<&Mapping> {
        let i = self.mappings.partition_point(|m| m.start <= addr);
        let candidate = self.mappings.get(i.checked_sub(1)?)?;
        candidate.contains(addr).then_some(candidate)
    }

    /// `path+0xoffset` for a mapped address, the bare address otherwise
    pub fn symbolize(&self, site: CallSite) -> String {
        if site.is_unknown() {
            return "[unknown]".to_owned();
        }
        let addr = site.addr();
        match self.find(addr) {
            Some(mapping) if mapping.path.is_empty() => {
                format!("[anon]+{:#x}", mapping.object_offset(addr))
            }
            Some(mapping) => format!("{}+{:#x}", mapping.path, mapping.object_offset(addr)),
            None => format!("{addr:#x}"),
        }
    }
}
