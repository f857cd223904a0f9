//! Reading a backing file from outside the tracked process, and summarising
//! what is still allocated by call site.
//!
//! The file may be mapped by a live process while we read it. Records are
//! copied out one at a time, so a snapshot can be torn: a slot may be seen
//! claimed with its size and call site still zero.

use std::{
    fs::File,
    io::{self, Read, Write},
    ops::Range,
    os::fd::AsRawFd,
    path::Path,
};

use hashbrown::HashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    alloc::table::{SlotRecord, RECORD_SIZE},
    arch::caller::CallSite,
    os::mem::SharedRegion,
    util::num::{round_down, round_up},
};

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CensusError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("file is {len} bytes, not a whole number of records")]
    Truncated { len: usize },
    #[error("line {line_no} of the memory map is malformed: {line:?}")]
    BadMapsLine { line_no: usize, line: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("cannot read symbols: {0}")]
    Elf(#[from] goblin::error::Error),
}

/// How to walk the records of a backing file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMethod {
    /// Look at every record
    Sequential,
    /// Ask the filesystem where the data is (`SEEK_DATA`/`SEEK_HOLE`) and
    /// only look there. The backing file is mostly one big hole, so this is
    /// usually much faster.
    SkipHoles,
}

/// A backing file, mapped read-only.
#[derive(Debug)]
pub struct CensusFile {
    // `None` for an empty file
    region: Option<SharedRegion>,
    method: ScanMethod,
}

impl CensusFile {
    /// Map the file at `path`. If `SkipHoles` is asked for but the filesystem
    /// cannot answer `SEEK_DATA`, this quietly falls back to `Sequential`.
    pub fn open(path: &Path, method: ScanMethod) -> Result<Self, CensusError> {
        let region = SharedRegion::open_read_only(path)?;
        if let Some(region) = &region {
            if region.len() % RECORD_SIZE != 0 {
                return Err(CensusError::Truncated { len: region.len() });
            }
        }
        let method = match (method, &region) {
            (ScanMethod::SkipHoles, Some(region)) if !seek_data_supported(region) => {
                info!("{} does not support SEEK_DATA, reading every record", path.display());
                ScanMethod::Sequential
            }
            (method, _) => method,
        };
        debug!("reading {} with {:?}", path.display(), method);
        Ok(Self { region, method })
    }

    pub fn method(&self) -> ScanMethod {
        self.method
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.region {
            // SAFETY: the mapping is `len` readable bytes that live as long as
            // the region. Another process may write to it concurrently; we
            // only ever copy bytes out.
            Some(region) => unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) },
            None => &[],
        }
    }

    /// Number of slots in the table
    pub fn capacity(&self) -> usize {
        self.bytes().len() / RECORD_SIZE
    }

    /// Every occupied record in the file
    pub fn records(&self) -> Result<Vec<SlotRecord>, CensusError> {
        let bytes = self.bytes();
        let ranges = match (&self.method, &self.region) {
            (ScanMethod::SkipHoles, Some(region)) => data_ranges(region)?,
            _ => vec![0..bytes.len()],
        };
        Ok(ranges
            .into_iter()
            .flat_map(|range| records_from_bytes(&bytes[range]))
            .collect())
    }
}

/// Occupied records in `bytes`, which must start on a record boundary. A
/// trailing partial record is ignored.
pub fn records_from_bytes(bytes: &[u8]) -> impl Iterator<Item = SlotRecord> + '_ {
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(bytemuck::pod_read_unaligned::<SlotRecord>)
        .filter(|record| !record.is_empty())
}

fn seek(file: &File, offset: usize, whence: i32) -> io::Result<Option<usize>> {
    // SAFETY: plain syscall on an open descriptor
    let pos = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
    if pos >= 0 {
        return Ok(Some(pos as usize));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // No more data (or hole) past `offset`
        Some(libc::ENXIO) => Ok(None),
        _ => Err(err),
    }
}

fn seek_data_supported(region: &SharedRegion) -> bool {
    region
        .file()
        .is_some_and(|file| seek(file, 0, libc::SEEK_DATA).is_ok())
}

/// Byte ranges of `region` that may hold data, widened to record boundaries
fn data_ranges(region: &SharedRegion) -> Result<Vec<Range<usize>>, CensusError> {
    let len = region.len();
    let Some(file) = region.file() else {
        return Ok(vec![0..len]);
    };
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos < len {
        // The file may have grown since it was mapped
        let Some(data) = seek(file, pos, libc::SEEK_DATA)?.filter(|&data| data < len) else {
            break;
        };
        let hole = seek(file, data, libc::SEEK_HOLE)?.unwrap_or(len).min(len);
        let start = round_down(data, RECORD_SIZE);
        let end = round_up(hole, RECORD_SIZE).min(len);
        ranges.push(start..end);
        pos = end;
    }
    Ok(ranges)
}

/// Live allocations attributed to one call site
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerSummary {
    pub caller: CallSite,
    pub entries: usize,
    pub total_bytes: u64,
}

/// Live allocations grouped by call site, in address order of the call site
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Census {
    pub callers: Vec<CallerSummary>,
}

impl Census {
    pub fn from_records(records: impl IntoIterator<Item = SlotRecord>) -> Self {
        let mut by_caller: HashMap<CallSite, (usize, u64), ahash::RandomState> =
            HashMap::with_hasher(ahash::RandomState::new());
        for record in records.into_iter().filter(|record| !record.is_empty()) {
            let (entries, bytes) = by_caller
                .entry(CallSite::from_addr(record.caller))
                .or_default();
            *entries += 1;
            *bytes += record.size as u64;
        }
        let mut callers: Vec<CallerSummary> = by_caller
            .into_iter()
            .map(|(caller, (entries, total_bytes))| CallerSummary {
                caller,
                entries,
                total_bytes,
            })
            .collect();
        callers.sort_unstable_by_key(|summary| summary.caller);
        Self { callers }
    }

    pub fn from_file(file: &CensusFile) -> Result<Self, CensusError> {
        Ok(Self::from_records(file.records()?))
    }

    pub fn get(&self, caller: CallSite) -> Option<&CallerSummary> {
        self.callers
            .binary_search_by_key(&caller, |summary| summary.caller)
            .ok()
            .map(|i| &self.callers[i])
    }

    pub fn total_entries(&self) -> usize {
        self.callers.iter().map(|summary| summary.entries).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.callers.iter().map(|summary| summary.total_bytes).sum()
    }

    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), CensusError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_json<R: Read>(reader: R) -> Result<Self, CensusError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::alloc::table::TrackingTable;

    fn record(ptr: usize, size: usize, caller: usize) -> SlotRecord {
        SlotRecord { ptr, size, caller }
    }

    #[test]
    fn records_are_grouped_by_caller() {
        let census = Census::from_records([
            record(0x10, 8, 0xb000),
            record(0x20, 16, 0xa000),
            record(0x30, 24, 0xb000),
            record(0, 99, 0xc000),
        ]);
        assert_eq!(census.callers.len(), 2);
        assert_eq!(census.callers[0].caller, CallSite::from_addr(0xa000));
        assert_eq!(
            census.get(CallSite::from_addr(0xb000)),
            Some(&CallerSummary {
                caller: CallSite::from_addr(0xb000),
                entries: 2,
                total_bytes: 32,
            })
        );
        assert!(census.get(CallSite::from_addr(0xc000)).is_none());
        assert_eq!(census.total_entries(), 3);
        assert_eq!(census.total_bytes(), 48);
    }

    #[test]
    fn raw_bytes_skip_empty_and_partial_records() {
        let mut bytes = Vec::new();
        for r in [record(0, 0, 0), record(0x40, 5, 0x9), record(0x50, 6, 0x9)] {
            bytes.extend_from_slice(bytemuck::bytes_of(&r));
        }
        bytes.extend_from_slice(&[1, 2, 3]);
        let records: Vec<_> = records_from_bytes(&bytes).collect();
        assert_eq!(records, [record(0x40, 5, 0x9), record(0x50, 6, 0x9)]);
    }

    fn populated_table(path: &Path, capacity: usize, addrs: &[usize]) -> TrackingTable {
        let table = TrackingTable::create(path, capacity).unwrap();
        for (i, &addr) in addrs.iter().enumerate() {
            let index = table.insert(NonZeroUsize::new(addr).unwrap()).unwrap();
            table.record(index, 10 * (i + 1), 0x7000 + (i % 2));
        }
        table
    }

    #[test]
    fn both_scan_methods_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.track.1");
        // Spread over a few pages so that there are holes to skip
        let capacity = 100_003;
        let addrs = [0x10, 0x5_0000, 0x9_9990, 0xfff_fff0];
        let _table = populated_table(&path, capacity, &addrs);

        let mut results = Vec::new();
        for method in [ScanMethod::Sequential, ScanMethod::SkipHoles] {
            let file = CensusFile::open(&path, method).unwrap();
            assert_eq!(file.capacity(), capacity);
            let mut records = file.records().unwrap();
            records.sort_by_key(|r| r.ptr);
            results.push(records);
        }
        assert_eq!(results[0].len(), addrs.len());
        assert_eq!(results[0], results[1]);

        let census = Census::from_records(results.remove(0));
        assert_eq!(census.callers.len(), 2);
        assert_eq!(census.total_bytes(), 10 + 20 + 30 + 40);
    }

    #[test]
    fn data_written_past_the_mapping_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.track.grown");
        let capacity = 1021;
        let _table = populated_table(&path, capacity, &[0x10, 0x20]);
        let file = CensusFile::open(&path, ScanMethod::SkipHoles).unwrap();

        // Someone extends the file after we mapped it
        let mut grown = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let old_len = (capacity * RECORD_SIZE) as u64;
        grown.set_len(old_len * 4).unwrap();
        std::io::Seek::seek(&mut grown, io::SeekFrom::Start(old_len * 3)).unwrap();
        grown.write_all(bytemuck::bytes_of(&record(0x30, 1, 0x7000))).unwrap();
        grown.sync_all().unwrap();

        let mut records = file.records().unwrap();
        records.sort_by_key(|r| r.ptr);
        assert_eq!(records.iter().map(|r| r.ptr).collect::<Vec<_>>(), [0x10, 0x20]);
        assert_eq!(file.capacity(), capacity);
    }

    #[test]
    fn empty_and_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, []).unwrap();
        let file = CensusFile::open(&empty, ScanMethod::SkipHoles).unwrap();
        assert!(file.records().unwrap().is_empty());
        assert_eq!(Census::from_file(&file).unwrap(), Census::default());

        let short = dir.path().join("short");
        std::fs::write(&short, [0u8; RECORD_SIZE + 1]).unwrap();
        assert!(matches!(
            CensusFile::open(&short, ScanMethod::Sequential),
            Err(CensusError::Truncated { len }) if len == RECORD_SIZE + 1
        ));

        assert!(matches!(
            CensusFile::open(&dir.path().join("missing"), ScanMethod::Sequential),
            Err(CensusError::Io(_))
        ));
    }

    #[test]
    fn census_json_uses_hex_call_sites() {
        let census = Census::from_records([record(0x10, 8, 0x401000)]);
        let mut json = Vec::new();
        census.write_json(&mut json).unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains(r#""caller": "0x401000""#));
        assert_eq!(Census::read_json(json.as_slice()).unwrap(), census);
    }
}
