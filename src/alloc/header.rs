//! The hidden header in front of every payload we hand out. A block from the
//! underlying allocator looks like this:
//!
//! ```plaintext
//! +-------------------+  <- block (what the underlying allocator returned)
//! | signature         |  u64, always SIGNATURE while the block is live
//! | slot              |  u64, index into the tracking table
//! +-------------------+  <- payload = block + HEADER_SIZE
//! | requested bytes   |
//! .                   .
//! ```
//!
//! A block from `memalign()` has its payload `align` bytes in, and the two
//! words before the header say where the block starts and how much was asked
//! for:
//!
//! ```plaintext
//! +-------------------+  <- block, aligned to `align`
//! .                   .
//! | requested size    |  u64
//! | offset            |  u64, payload - block (== align)
//! | signature         |  u64, ALIGNED_SIGNATURE
//! | slot              |  u64
//! +-------------------+  <- payload = block + offset
//! ```
//!
//! [`TrackedBlock`] is the only thing that does arithmetic between the two
//! addresses.

use std::{mem, ptr::NonNull};

use crate::{
    error::{Corruption, TrackError},
    util::assert::in_null_page,
};

/// Magic value in every live header
pub const SIGNATURE: u64 = 0xACED_1234_5678;

/// Magic value in the header of a block from `memalign()`
pub const ALIGNED_SIGNATURE: u64 = 0xACED_1234_A119;

/// Slot value for blocks handed out while the table did not exist yet
const UNTRACKED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct AllocationHeader {
    pub signature: u64,
    pub slot: u64,
}

/// Bytes in front of every payload. Two words keeps the payload as aligned
/// as the block itself on 64-bit targets.
pub const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

const _: () = assert!(HEADER_SIZE == 16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct AlignedPrefix {
    size: u64,
    offset: u64,
}

/// Smallest payload offset of an aligned block: header plus prefix
pub const MIN_ALIGNED_OFFSET: usize = HEADER_SIZE + mem::size_of::<AlignedPrefix>();

/// Which table slot (if any) owns a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRef {
    Tracked(usize),
    /// Allocated by the thread that was building the table, before the table
    /// existed. These blocks never appear in the census.
    Untracked,
}

impl SlotRef {
    fn encode(self) -> u64 {
        match self {
            SlotRef::Tracked(index) => index as u64,
            SlotRef::Untracked => UNTRACKED,
        }
    }

    fn decode(raw: u64) -> Self {
        if raw == UNTRACKED {
            SlotRef::Untracked
        } else {
            SlotRef::Tracked(raw as usize)
        }
    }
}

/// A block from the underlying allocator, large enough for a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedBlock {
    block: NonNull<u8>,
    /// payload - block
    offset: usize,
}

impl TrackedBlock {
    /// # Safety
    ///
    /// `block` must be the start of an allocation of at least `HEADER_SIZE`
    /// bytes that stays valid for as long as this value is used.
    pub unsafe fn from_block(block: NonNull<u8>) -> Self {
        Self {
            block,
            offset: HEADER_SIZE,
        }
    }

    /// Lay out an aligned block and write its prefix. The header itself is
    /// written by [`TrackedBlock::attach`].
    ///
    /// # Safety
    ///
    /// `offset` must be a power of two of at least [`MIN_ALIGNED_OFFSET`], and
    /// `block` the start of an allocation of at least `offset + size` bytes
    /// that stays valid for as long as this value is used.
    pub unsafe fn from_aligned_block(block: NonNull<u8>, offset: usize, size: usize) -> Self {
        debug_assert!(offset.is_power_of_two() && offset >= MIN_ALIGNED_OFFSET);
        let tracked = Self { block, offset };
        let prefix = AlignedPrefix {
            size: size as u64,
            offset: offset as u64,
        };
        // SAFETY: the prefix lies between `block` and the header
        unsafe { tracked.prefix_ptr().write_unaligned(prefix) };
        tracked
    }

    /// Step back from a payload address to its block.
    ///
    /// # Safety
    ///
    /// The `HEADER_SIZE` bytes in front of `payload` must be readable, and so
    /// must the prefix in front of them if the header carries
    /// [`ALIGNED_SIGNATURE`]. That holds for every payload this crate hands
    /// out; for anything else the caller is asserting it.
    /// [`TrackedBlock::slot_ref`] then tells a real header from garbage.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Result<Self, TrackError> {
        let addr = payload.as_ptr() as usize;
        // A header would have to live below address 0 (or in the null page),
        // which no allocator hands out.
        if addr < HEADER_SIZE || in_null_page(addr - HEADER_SIZE) {
            return Err(TrackError::corruption(
                addr,
                Corruption::BadSignature { found: 0 },
            ));
        }
        let header = payload.as_ptr().wrapping_sub(HEADER_SIZE);
        // SAFETY: caller guarantees the header bytes in front are ours to read
        let signature = unsafe { header.cast::<u64>().read_unaligned() };
        let offset = if signature == ALIGNED_SIGNATURE {
            // SAFETY: caller contract, an aligned header has a prefix
            let prefix = unsafe {
                header
                    .wrapping_sub(mem::size_of::<AlignedPrefix>())
                    .cast::<AlignedPrefix>()
                    .read_unaligned()
            };
            let offset = prefix.offset as usize;
            if !offset.is_power_of_two()
                || offset < MIN_ALIGNED_OFFSET
                || offset > addr
                || in_null_page(addr - offset)
            {
                return Err(TrackError::corruption(
                    addr,
                    Corruption::BadOffset {
                        offset: prefix.offset,
                    },
                ));
            }
            offset
        } else {
            HEADER_SIZE
        };
        // SAFETY: checked above to not wrap below zero
        let block = unsafe { NonNull::new_unchecked(payload.as_ptr().sub(offset)) };
        Ok(Self { block, offset })
    }

    pub fn block(&self) -> NonNull<u8> {
        self.block
    }

    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: the block is at least `offset` bytes (constructor contract),
        // so this is in bounds or one past the end.
        unsafe { NonNull::new_unchecked(self.block.as_ptr().add(self.offset)) }
    }

    pub fn payload_addr(&self) -> usize {
        self.payload().as_ptr() as usize
    }

    /// Whether this came from `memalign()` rather than `malloc()`
    pub fn is_aligned(&self) -> bool {
        self.offset != HEADER_SIZE
    }

    /// The size asked for when an aligned block was created
    pub fn aligned_size(&self) -> Option<usize> {
        // SAFETY: aligned blocks have a prefix (constructor contract)
        self.is_aligned()
            .then(|| unsafe { self.prefix_ptr().read_unaligned() }.size as usize)
    }

    fn signature(&self) -> u64 {
        if self.is_aligned() {
            ALIGNED_SIGNATURE
        } else {
            SIGNATURE
        }
    }

    fn header_ptr(&self) -> *mut AllocationHeader {
        self.payload()
            .as_ptr()
            .wrapping_sub(HEADER_SIZE)
            .cast()
    }

    fn prefix_ptr(&self) -> *mut AlignedPrefix {
        self.header_ptr()
            .cast::<u8>()
            .wrapping_sub(mem::size_of::<AlignedPrefix>())
            .cast()
    }

    /// Read the header as it is. The underlying allocator only promises
    /// `malloc()` alignment, so reads and writes are unaligned.
    pub fn read(&self) -> AllocationHeader {
        // SAFETY: constructor contract, the header bytes are ours
        unsafe { self.header_ptr().read_unaligned() }
    }

    /// Stamp a fresh header onto the block.
    pub fn attach(&self, slot: SlotRef) {
        let header = AllocationHeader {
            signature: self.signature(),
            slot: slot.encode(),
        };
        // SAFETY: constructor contract
        unsafe { self.header_ptr().write_unaligned(header) }
    }

    /// Validate the signature and decode the owning slot. This says nothing
    /// about whether the slot agrees; the table checks that.
    pub fn slot_ref(&self) -> Result<SlotRef, TrackError> {
        let header = self.read();
        if header.signature != self.signature() {
            return Err(TrackError::corruption(
                self.payload_addr(),
                Corruption::BadSignature {
                    found: header.signature,
                },
            ));
        }
        Ok(SlotRef::decode(header.slot))
    }

    /// Scrub the signature, so that a second release of the same payload is
    /// caught as long as the memory has not been reused.
    pub fn detach(&self) {
        // SAFETY: constructor contract
        unsafe {
            self.header_ptr().write_unaligned(AllocationHeader {
                signature: 0,
                slot: 0,
            });
            if self.is_aligned() {
                self.prefix_ptr()
                    .write_unaligned(AlignedPrefix { size: 0, offset: 0 });
            }
        }
    }
}
