//! The tracking table: a fixed-capacity, open-addressed map from live
//! allocation address to `{requested size, call site}`, laid out so that the
//! memory it lives in can be handed to another process as-is.
//!
//! Ownership of a slot is decided by a compare-and-exchange on its `ptr` word
//! and nothing else:
//!
//! ```plaintext
//!            insert: CAS 0 -> addr
//!   +-------+ -------------------> +----------+
//!   | empty |                      | occupied |
//!   +-------+ <------------------- +----------+
//!            remove: CAS addr -> 0
//! ```
//!
//! Only the thread that won the first exchange writes the metadata words, and
//! it clears them again before giving the slot back. External readers get no
//! such guarantee; they may see an occupied slot whose metadata is still zero.

use std::{
    mem,
    num::NonZeroUsize,
    path::Path,
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use bytemuck::{Pod, Zeroable};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Corruption, TrackError},
    os::mem::SharedRegion,
    serialize::serde_hex,
    util::hint::cold,
};

/// One record of the table, as it sits in shared memory.
#[derive(Debug, Zeroable)]
#[repr(C)]
pub struct TrackingSlot {
    /// Payload address handed to the application, `0` when free
    ptr: AtomicUsize,
    /// The size the application asked for
    size: AtomicUsize,
    /// Start of the function that made the allocation
    caller: AtomicUsize,
}

/// A plain copy of a [`TrackingSlot`], also the on-disk record format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct SlotRecord {
    #[serde(with = "serde_hex")]
    pub ptr: usize,
    pub size: usize,
    #[serde(with = "serde_hex")]
    pub caller: usize,
}

/// Size of one record in the backing file: three native words
pub const RECORD_SIZE: usize = mem::size_of::<SlotRecord>();

const _: () = assert!(mem::size_of::<TrackingSlot>() == RECORD_SIZE);
const _: () = assert!(RECORD_SIZE == 3 * mem::size_of::<usize>());

impl SlotRecord {
    pub fn is_empty(&self) -> bool {
        self.ptr == 0
    }
}

impl TrackingSlot {
    /// Snapshot all three words. The words are read individually, so a
    /// snapshot taken while another thread owns the slot can mix states.
    pub fn load(&self) -> SlotRecord {
        SlotRecord {
            ptr: self.ptr.load(Ordering::Acquire),
            size: self.size.load(Ordering::Relaxed),
            caller: self.caller.load(Ordering::Relaxed),
        }
    }

    pub fn pointer(&self) -> usize {
        self.ptr.load(Ordering::Acquire)
    }

    pub fn is_free(&self) -> bool {
        self.pointer() == 0
    }

    fn try_claim(&self, addr: usize) -> bool {
        self.ptr
            .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// View `region` as a slice of slots, ignoring any trailing partial record.
pub(crate) fn slots_in(region: &SharedRegion) -> &[TrackingSlot] {
    debug_assert!(crate::util::assert::aligned_to(
        region.as_ptr(),
        mem::align_of::<TrackingSlot>()
    ));
    // SAFETY:
    // - The region is page-aligned, so it is aligned for `TrackingSlot`
    // - `TrackingSlot` is all atomics, for which every bit pattern (in
    //   particular all-zeroes) is valid, and which may be shared between
    //   threads (and processes) freely
    // - `len / RECORD_SIZE` records fit in `len` bytes
    // - The slice borrows `region`, which keeps the mapping alive
    unsafe {
        slice::from_raw_parts(
            region.as_ptr() as *const TrackingSlot,
            region.len() / RECORD_SIZE,
        )
    }
}

/// Lock-free, fixed-capacity table of live allocations. See the module docs.
#[derive(Debug)]
pub struct TrackingTable {
    region: SharedRegion,
    capacity: usize,
}

impl TrackingTable {
    /// Create the backing file at `path` (truncating any old one), size it to
    /// `capacity` records and map it shared.
    pub fn create(path: &Path, capacity: usize) -> Result<Self, TrackError> {
        let len = Self::region_len(capacity)?;
        let region = SharedRegion::create_file(path, len)?;
        info!(
            "tracking table at {} ({} slots, {} bytes)",
            path.display(),
            capacity,
            len
        );
        Ok(Self { region, capacity })
    }

    /// A table that only this process (and its forked children) can see
    pub fn anonymous(capacity: usize) -> Result<Self, TrackError> {
        let len = Self::region_len(capacity)?;
        Ok(Self {
            region: SharedRegion::anonymous(len)?,
            capacity,
        })
    }

    fn region_len(capacity: usize) -> Result<usize, TrackError> {
        if capacity == 0 {
            return Err(TrackError::InvalidCapacity(0));
        }
        capacity
            .checked_mul(RECORD_SIZE)
            .ok_or(TrackError::InvalidCapacity(capacity as u64))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slots(&self) -> &[TrackingSlot] {
        slots_in(&self.region)
    }

    pub fn slot(&self, index: usize) -> Option<&TrackingSlot> {
        self.slots().get(index)
    }

    /// Where probing for `addr` starts
    pub fn start_index(&self, addr: usize) -> usize {
        addr % self.capacity
    }

    /// Claim a free slot for `addr` and return its index. The slot's metadata
    /// is still zero; fill it in with [`TrackingTable::record`].
    ///
    /// Fails with [`TrackError::TableExhausted`] once probing wraps around to
    /// where it started without finding a free slot. The table never drops an
    /// allocation silently.
    pub fn insert(&self, addr: NonZeroUsize) -> Result<usize, TrackError> {
        let addr = addr.get();
        let slots = self.slots();
        let start = self.start_index(addr);
        let mut index = start;
        loop {
            if slots[index].try_claim(addr) {
                return Ok(index);
            }
            index += 1;
            if index == self.capacity {
                index = 0;
            }
            if index == start {
                return cold(|| {
                    Err(TrackError::TableExhausted {
                        capacity: self.capacity,
                    })
                });
            }
        }
    }

    /// Fill in the metadata of a slot the caller claimed with `insert()`.
    pub fn record(&self, index: usize, size: usize, caller: usize) {
        let slot = &self.slots()[index];
        slot.size.store(size, Ordering::Relaxed);
        slot.caller.store(caller, Ordering::Release);
    }

    /// Give slot `index`, which must currently hold `addr`, back to the table.
    /// Metadata is cleared before the slot is released, and the release is a
    /// single exchange, so a concurrent `insert()` can never see a free slot
    /// whose old metadata is still being cleared.
    pub fn remove(&self, index: usize, addr: usize) -> Result<(), TrackError> {
        let Some(slot) = self.slot(index) else {
            return Err(TrackError::corruption(
                addr,
                Corruption::SlotOutOfRange {
                    index: index as u64,
                },
            ));
        };
        let found = slot.pointer();
        if found != addr {
            return Err(TrackError::corruption(
                addr,
                Corruption::SlotMismatch { index, found },
            ));
        }
        slot.caller.store(0, Ordering::Relaxed);
        slot.size.store(0, Ordering::Relaxed);
        slot.ptr
            .compare_exchange(addr, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|found| TrackError::corruption(addr, Corruption::SlotMismatch { index, found }))
    }

    /// Number of occupied slots. This walks the whole table.
    pub fn occupied(&self) -> usize {
        self.slots().iter().filter(|slot| !slot.is_free()).count()
    }

    /// Every occupied slot, with its index
    pub fn live(&self) -> impl Iterator<Item = (usize, SlotRecord)> + '_ {
        self.slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, slot.load()))
            .filter(|(_, record)| !record.is_empty())
    }

    /// Index of the slot tracking `addr`, if any. Removal leaves holes in
    /// the linear search runs, so this has to be prepared to look at every slot.
    pub fn find(&self, addr: usize) -> Option<usize> {
        if addr == 0 {
            return None;
        }
        let start = self.start_index(addr);
        let slots = self.slots();
        (start..self.capacity)
            .chain(0..start)
            .find(|&index| slots[index].pointer() == addr)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, num::NonZeroUsize};

    use super::*;

    fn nz(addr: usize) -> NonZeroUsize {
        NonZeroUsize::new(addr).unwrap()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TrackingTable::anonymous(0),
            Err(TrackError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn insert_starts_at_address_mod_capacity() {
        let table = TrackingTable::anonymous(101).unwrap();
        let index = table.insert(nz(0x1000)).unwrap();
        assert_eq!(index, 0x1000 % 101);
        table.record(index, 32, 0xdead);
        assert_eq!(
            table.slot(index).unwrap().load(),
            SlotRecord {
                ptr: 0x1000,
                size: 32,
                caller: 0xdead
            }
        );
        assert_eq!(table.find(0x1000), Some(index));
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn collisions_move_forward_and_wrap() {
        let table = TrackingTable::anonymous(7).unwrap();
        // 6, 13 and 20 all hash to slot 6
        assert_eq!(table.insert(nz(6)).unwrap(), 6);
        assert_eq!(table.insert(nz(13)).unwrap(), 0);
        assert_eq!(table.insert(nz(20)).unwrap(), 1);
        assert_eq!(table.find(20), Some(1));
    }

    #[test]
    fn full_table_is_exhausted_not_overwritten() {
        let table = TrackingTable::anonymous(3).unwrap();
        for addr in [0x10, 0x20, 0x30] {
            table.insert(nz(addr)).unwrap();
        }
        assert!(matches!(
            table.insert(nz(0x40)),
            Err(TrackError::TableExhausted { capacity: 3 })
        ));
        let live: HashSet<usize> = table.live().map(|(_, r)| r.ptr).collect();
        assert_eq!(live, HashSet::from([0x10, 0x20, 0x30]));
    }

    #[test]
    fn remove_clears_everything() {
        let table = TrackingTable::anonymous(11).unwrap();
        let index = table.insert(nz(0x88)).unwrap();
        table.record(index, 7, 0x4000);
        table.remove(index, 0x88).unwrap();
        assert_eq!(table.slot(index).unwrap().load(), SlotRecord::default());
        assert_eq!(table.occupied(), 0);
        assert_eq!(table.find(0x88), None);
        // and the slot can be claimed again
        assert_eq!(table.insert(nz(0x88)).unwrap(), index);
    }

    #[test]
    fn removing_the_wrong_address_is_corruption() {
        let table = TrackingTable::anonymous(11).unwrap();
        let index = table.insert(nz(0x88)).unwrap();
        let err = table.remove(index, 0x99).unwrap_err();
        assert!(matches!(
            err,
            TrackError::CorruptionDetected {
                address: 0x99,
                kind: Corruption::SlotMismatch { found: 0x88, .. }
            }
        ));
        // double remove
        table.remove(index, 0x88).unwrap();
        assert!(table.remove(index, 0x88).is_err());
        assert!(matches!(
            table.remove(11, 0x88),
            Err(TrackError::CorruptionDetected {
                kind: Corruption::SlotOutOfRange { index: 11 },
                ..
            })
        ));
    }

    #[test]
    fn concurrent_inserts_never_share_a_slot() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 64;
        // Every address collides, so all threads race over the same run of
        // slots.
        let table = TrackingTable::anonymous(THREADS * PER_THREAD).unwrap();
        let capacity = table.capacity();
        let indices: Vec<Vec<usize>> = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let table = &table;
                    s.spawn(move |_| {
                        (0..PER_THREAD)
                            .map(|i| table.insert(nz(capacity * (t * PER_THREAD + i + 1))).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        let all: HashSet<usize> = indices.iter().flatten().copied().collect();
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(table.occupied(), THREADS * PER_THREAD);
    }

    #[test]
    fn file_backed_table_writes_native_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.track.1");
        let table = TrackingTable::create(&path, 13).unwrap();
        let index = table.insert(nz(0xabc0)).unwrap();
        table.record(index, 99, 0x1234);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 13 * RECORD_SIZE);
        let record: SlotRecord =
            bytemuck::pod_read_unaligned(&bytes[index * RECORD_SIZE..(index + 1) * RECORD_SIZE]);
        assert_eq!(
            record,
            SlotRecord {
                ptr: 0xabc0,
                size: 99,
                caller: 0x1234
            }
        );
    }
}
