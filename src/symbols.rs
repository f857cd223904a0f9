//! Function symbols of the objects a tracked process had mapped, so that call
//! sites print as `path:symbol()` rather than as an offset into a file.

use std::{fs, path::Path};

use goblin::elf::{program_header::PT_LOAD, Elf};
use hashbrown::HashMap;
use log::debug;

use crate::{arch::caller::CallSite, census::CensusError, maps::MemoryMap};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Symbol {
    start: u64,
    size: u64,
    name: String,
}

/// A loadable segment: where a range of the file ends up in memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Segment {
    offset: u64,
    vaddr: u64,
    len: u64,
}

/// The function an address falls in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolHit<'a> {
    pub name: &'a str,
    /// Bytes past the start of the function
    pub offset: u64,
}

/// Function symbols of one ELF object, from `.symtab` and `.dynsym`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolTable {
    // sorted by start, one name per start
    symbols: Vec<Symbol>,
    segments: Vec<Segment>,
}

impl SymbolTable {
    pub fn parse(bytes: &[u8]) -> Result<Self, CensusError> {
        let elf = Elf::parse(bytes)?;
        let segments = elf
            .program_headers
            .iter()
            .filter(|header| header.p_type == PT_LOAD)
            .map(|header| Segment {
                offset: header.p_offset,
                vaddr: header.p_vaddr,
                len: header.p_filesz,
            })
            .collect();
        let named = elf
            .syms
            .iter()
            .filter_map(|sym| Some((sym, elf.strtab.get_at(sym.st_name)?)))
            .chain(
                elf.dynsyms
                    .iter()
                    .filter_map(|sym| Some((sym, elf.dynstrtab.get_at(sym.st_name)?))),
            );
        let mut symbols: Vec<Symbol> = named
            .filter(|(sym, name)| sym.is_function() && sym.st_value != 0 && !name.is_empty())
            .map(|(sym, name)| Symbol {
                start: sym.st_value,
                size: sym.st_size,
                name: name.to_owned(),
            })
            .collect();
        // Stable, so an alias keeps its `.symtab` name
        symbols.sort_by_key(|symbol| symbol.start);
        symbols.dedup_by_key(|symbol| symbol.start);
        Ok(Self { symbols, segments })
    }

    pub fn from_file(path: &Path) -> Result<Self, CensusError> {
        Self::parse(&fs::read(path)?)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Where a byte at `file_offset` of the object is loaded, relative to the
    /// object's load address
    pub fn vaddr(&self, file_offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|segment| (segment.offset..segment.offset + segment.len).contains(&file_offset))
            .map(|segment| file_offset - segment.offset + segment.vaddr)
    }

    /// The function containing `vaddr`. A symbol without a size only matches
    /// its own start.
    pub fn lookup(&self, vaddr: u64) -> Option<SymbolHit<'_>> {
        let i = self.symbols.partition_point(|symbol| symbol.start <= vaddr);
        let symbol = self.symbols.get(i.checked_sub(1)?)?;
        let offset = vaddr - symbol.start;
        (offset == 0 || offset < symbol.size).then_some(SymbolHit {
            name: &symbol.name,
            offset,
        })
    }
}

/// Renders call sites against a memory map, reading an object's symbols the
/// first time one of its addresses comes up.
#[derive(Debug)]
pub struct Symbolizer<'a> {
    map: &'a MemoryMap,
    // `None` for objects that could not be read
    tables: HashMap<String, Option<SymbolTable>, ahash::RandomState>,
}

impl<'a> Symbolizer<'a> {
    pub fn new(map: &'a MemoryMap) -> Self {
        Self {
            map,
            tables: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// `path:symbol()` for the start of a function, `path:symbol()+0x…`
    /// inside one, and [`MemoryMap::symbolize`] when no symbol is known.
    pub fn symbolize(&mut self, site: CallSite) -> String {
        let map = self.map;
        let mapping = match map.find(site.addr()) {
            Some(mapping) if !site.is_unknown() && mapping.path.starts_with('/') => mapping,
            _ => return map.symbolize(site),
        };
        let table = self
            .tables
            .entry(mapping.path.clone())
            .or_insert_with(|| load(&mapping.path));
        let offset = mapping.object_offset(site.addr()) as u64;
        let hit = table
            .as_ref()
            .and_then(|table| table.lookup(table.vaddr(offset)?));
        match hit {
            Some(SymbolHit { name, offset: 0 }) => format!("{}:{name}()", mapping.path),
            Some(SymbolHit { name, offset }) => format!("{}:{name}()+{offset:#x}", mapping.path),
            None => map.symbolize(site),
        }
    }
}

fn load(path: &str) -> Option<SymbolTable> {
    match SymbolTable::from_file(Path::new(path)) {
        Ok(table) => {
            debug!("{} function symbols in {path}", table.len());
            Some(table)
        }
        Err(err) => {
            debug!("no symbols for {path}: {err}");
            None
        }
    }
}
