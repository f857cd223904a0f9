//! The interception logic behind `malloc()`, `calloc()`, `memalign()`,
//! `realloc()` and `free()`: forward the real work to a [`RawAllocator`], hide a header in
//! front of every block, and keep the [`TrackingTable`] in step.
//!
//! Every payload we hand out has exactly one occupied slot with
//! `ptr == payload` for as long as the application holds it, and none once
//! it has been released.

use std::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::{
    alloc::{
        header::{SlotRef, TrackedBlock, HEADER_SIZE, MIN_ALIGNED_OFFSET},
        raw::RawAllocator,
        table::TrackingTable,
    },
    arch::caller::CallSite,
    error::{Corruption, TrackError},
    util::hint::cold,
};

/// A tracking table together with the allocator it keeps a census of.
#[derive(Debug)]
pub struct Tracker<A> {
    table: TrackingTable,
    allocator: A,
}

/// Bytes to request from the underlying allocator for a payload of `size`
fn block_size(size: usize) -> Result<usize, TrackError> {
    size.checked_add(HEADER_SIZE)
        .ok_or(TrackError::OutOfMemory { requested: size })
}

/// A fresh, headerless block whose payload will be aligned to `align`.
/// Anything `malloc()` already aligns for gets a plain block.
fn aligned_block<A: RawAllocator>(
    allocator: &A,
    align: usize,
    size: usize,
) -> Result<TrackedBlock, TrackError> {
    if !align.is_power_of_two() {
        return Err(TrackError::InvalidAlignment { align });
    }
    if align <= HEADER_SIZE {
        let block = allocator
            .malloc(block_size(size)?)
            .ok_or(TrackError::OutOfMemory { requested: size })?;
        // SAFETY: fresh allocation of `size + HEADER_SIZE` bytes
        return Ok(unsafe { TrackedBlock::from_block(block) });
    }
    let offset = align.max(MIN_ALIGNED_OFFSET);
    let total = size
        .checked_add(offset)
        .ok_or(TrackError::OutOfMemory { requested: size })?;
    let block = allocator
        .memalign(align, total)
        .ok_or(TrackError::OutOfMemory { requested: size })?;
    // SAFETY: fresh allocation of `offset + size` bytes; `offset` is a power
    // of two no smaller than the minimum
    Ok(unsafe { TrackedBlock::from_aligned_block(block, offset, size) })
}

impl<A> Tracker<A>
where
    A: RawAllocator,
{
    pub fn new(table: TrackingTable, allocator: A) -> Self {
        Self { table, allocator }
    }

    pub fn table(&self) -> &TrackingTable {
        &self.table
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// `malloc(size)`. On failure of the underlying allocator nothing is
    /// recorded and [`TrackError::OutOfMemory`] is returned.
    pub fn allocate(&self, size: usize, call_site: CallSite) -> Result<NonNull<u8>, TrackError> {
        let block = self
            .allocator
            .malloc(block_size(size)?)
            .ok_or(TrackError::OutOfMemory { requested: size })?;
        // SAFETY: `block` is a fresh allocation of `size + HEADER_SIZE` bytes
        unsafe { self.track(TrackedBlock::from_block(block), size, call_site) }
    }

    /// `calloc(count, size)`. The product is checked before anything is
    /// forwarded; an overflow is reported like any other allocation failure.
    pub fn zero_allocate(
        &self,
        count: usize,
        size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        let total = count.checked_mul(size).ok_or(TrackError::OutOfMemory {
            requested: usize::MAX,
        })?;
        let block = self
            .allocator
            .calloc(1, block_size(total)?)
            .ok_or(TrackError::OutOfMemory { requested: total })?;
        // SAFETY: `block` is a fresh allocation of `total + HEADER_SIZE` bytes
        unsafe { self.track(TrackedBlock::from_block(block), total, call_site) }
    }

    /// `memalign(align, size)`. `align` must be a power of two, otherwise
    /// [`TrackError::InvalidAlignment`] is returned and nothing is allocated.
    pub fn allocate_aligned(
        &self,
        align: usize,
        size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        let tracked = aligned_block(&self.allocator, align, size)?;
        // SAFETY: `tracked` is a fresh block with room for the payload
        unsafe { self.track(tracked, size, call_site) }
    }

    /// `realloc(existing, new_size)`.
    ///
    /// Blocks from [`Tracker::allocate_aligned`] move to a fresh tracked block
    /// from `malloc()`, as C's `realloc()` does not keep extra alignment either.
    ///
    /// If the underlying allocator fails, the original block is left exactly
    /// as it was (still allocated, still tracked, same size and call site) and
    /// [`TrackError::OutOfMemory`] is returned.
    ///
    /// # Safety
    ///
    /// `existing` must be null or a payload this tracker handed out and that
    /// has not been released. Anything else is caught by the header check if
    /// the bytes in front of it are readable, and is undefined behaviour if
    /// they are not.
    pub unsafe fn resize(
        &self,
        existing: *mut u8,
        new_size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        let Some(existing) = NonNull::new(existing) else {
            return self.allocate(new_size, call_site);
        };
        // SAFETY: caller contract
        let old = unsafe { TrackedBlock::from_payload(existing) }?;
        let slot = self.validate(&old)?;
        if old.is_aligned() {
            // SAFETY: validated as a live block of ours
            return unsafe { self.resize_by_copy(old, slot, new_size, call_site) };
        }
        let old_payload = old.payload_addr();

        // SAFETY: `validate()` proved the block is one of ours and live
        let Some(block) = (unsafe { self.allocator.realloc(old.block(), block_size(new_size)?) })
        else {
            return Err(TrackError::OutOfMemory {
                requested: new_size,
            });
        };
        // SAFETY: `block` holds at least `new_size + HEADER_SIZE` bytes
        let new = unsafe { TrackedBlock::from_block(block) };

        match slot {
            SlotRef::Untracked => Ok(new.payload()),
            SlotRef::Tracked(index) if new == old => {
                self.table.record(index, new_size, call_site.addr());
                Ok(new.payload())
            }
            SlotRef::Tracked(index) => {
                // The old address is already free as far as the allocator is
                // concerned, and may be handed out again concurrently. Slots are
                // released by index, so that cannot confuse us.
                self.table.remove(index, old_payload)?;
                self.track_existing(new, new_size, call_site)
            }
        }
    }

    /// `free(payload)`. Null is a no-op that touches neither the table nor
    /// the underlying allocator.
    ///
    /// # Safety
    ///
    /// Same as [`Tracker::resize`].
    pub unsafe fn release(&self, payload: *mut u8) -> Result<(), TrackError> {
        let Some(payload) = NonNull::new(payload) else {
            return Ok(());
        };
        // SAFETY: caller contract
        let tracked = unsafe { TrackedBlock::from_payload(payload) }?;
        let slot = self.validate(&tracked)?;
        // SAFETY: validated as a live block of ours
        unsafe { self.release_validated(tracked, slot) }
    }

    /// # Safety
    ///
    /// `tracked` must have passed [`Tracker::validate`] with `slot`.
    unsafe fn release_validated(&self, tracked: TrackedBlock, slot: SlotRef) -> Result<(), TrackError> {
        if let SlotRef::Tracked(index) = slot {
            self.table.remove(index, tracked.payload_addr())?;
        }
        tracked.detach();
        // SAFETY: caller contract
        unsafe { self.allocator.free(tracked.block()) };
        Ok(())
    }

    /// Move an aligned block's contents into a fresh `malloc()` block.
    ///
    /// # Safety
    ///
    /// As [`Tracker::release_validated`].
    unsafe fn resize_by_copy(
        &self,
        old: TrackedBlock,
        slot: SlotRef,
        new_size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        let new = self.allocate(new_size, call_site)?;
        let kept = old.aligned_size().unwrap_or(0).min(new_size);
        // SAFETY: both payloads hold at least `kept` bytes, and are distinct
        // live blocks
        unsafe { ptr::copy_nonoverlapping(old.payload().as_ptr(), new.as_ptr(), kept) };
        unsafe { self.release_validated(old, slot) }?;
        Ok(new)
    }

    /// Check that the header of `tracked` is intact and that its slot
    /// agrees it is tracking this payload.
    fn validate(&self, tracked: &TrackedBlock) -> Result<SlotRef, TrackError> {
        let slot = tracked.slot_ref()?;
        if let SlotRef::Tracked(index) = slot {
            let payload = tracked.payload_addr();
            let Some(found) = self.table.slot(index) else {
                return cold(|| {
                    Err(TrackError::corruption(
                        payload,
                        Corruption::SlotOutOfRange {
                            index: index as u64,
                        },
                    ))
                });
            };
            let found = found.pointer();
            if found != payload {
                return cold(|| {
                    Err(TrackError::corruption(
                        payload,
                        Corruption::SlotMismatch { index, found },
                    ))
                });
            }
        }
        Ok(slot)
    }

    /// Register a fresh block. If the table is full the block goes back to the
    /// allocator before the error is returned.
    ///
    /// # Safety
    ///
    /// `tracked` must be a live block of ours that nothing else references.
    unsafe fn track(
        &self,
        tracked: TrackedBlock,
        size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        self.track_existing(tracked, size, call_site).inspect_err(|_| {
            // SAFETY: the block was never handed out
            unsafe { self.allocator.free(tracked.block()) }
        })
    }

    fn track_existing(
        &self,
        tracked: TrackedBlock,
        size: usize,
        call_site: CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        let payload = tracked.payload();
        // SAFETY: a payload is never null, and neither is its address
        let addr = unsafe { NonZeroUsize::new_unchecked(payload.as_ptr() as usize) };
        let index = self.table.insert(addr)?;
        tracked.attach(SlotRef::Tracked(index));
        self.table.record(index, size, call_site.addr());
        Ok(payload)
    }
}

/// Allocation paths for the thread that is still building the table. The
/// blocks get a valid header marked untracked, so that they can be released
/// or resized by a [`Tracker`] later.
pub mod bootstrap {
    use super::*;

    pub fn allocate<A: RawAllocator>(allocator: &A, size: usize) -> Result<NonNull<u8>, TrackError> {
        let block = allocator
            .malloc(block_size(size)?)
            .ok_or(TrackError::OutOfMemory { requested: size })?;
        // SAFETY: fresh allocation of `size + HEADER_SIZE` bytes
        Ok(untracked(unsafe { TrackedBlock::from_block(block) }))
    }

    pub fn allocate_aligned<A: RawAllocator>(
        allocator: &A,
        align: usize,
        size: usize,
    ) -> Result<NonNull<u8>, TrackError> {
        Ok(untracked(aligned_block(allocator, align, size)?))
    }

    pub fn zero_allocate<A: RawAllocator>(
        allocator: &A,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, TrackError> {
        let total = count.checked_mul(size).ok_or(TrackError::OutOfMemory {
            requested: usize::MAX,
        })?;
        let block = allocator
            .calloc(1, block_size(total)?)
            .ok_or(TrackError::OutOfMemory { requested: total })?;
        // SAFETY: fresh allocation of `total + HEADER_SIZE` bytes
        Ok(untracked(unsafe { TrackedBlock::from_block(block) }))
    }

    /// # Safety
    ///
    /// As [`Tracker::resize`]
    pub unsafe fn resize<A: RawAllocator>(
        allocator: &A,
        existing: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, TrackError> {
        let Some(existing) = NonNull::new(existing) else {
            return allocate(allocator, new_size);
        };
        let old = unsafe { untracked_block(existing) }?;
        if let Some(old_size) = old.aligned_size() {
            let new = allocate(allocator, new_size)?;
            // SAFETY: both payloads hold at least this many bytes
            unsafe {
                ptr::copy_nonoverlapping(old.payload().as_ptr(), new.as_ptr(), old_size.min(new_size));
                release(allocator, existing.as_ptr())?;
            }
            return Ok(new);
        }
        let block = unsafe { allocator.realloc(old.block(), block_size(new_size)?) }.ok_or(
            TrackError::OutOfMemory {
                requested: new_size,
            },
        )?;
        Ok(unsafe { TrackedBlock::from_block(block) }.payload())
    }

    /// # Safety
    ///
    /// As [`Tracker::release`]
    pub unsafe fn release<A: RawAllocator>(allocator: &A, payload: *mut u8) -> Result<(), TrackError> {
        let Some(payload) = NonNull::new(payload) else {
            return Ok(());
        };
        let tracked = unsafe { untracked_block(payload) }?;
        tracked.detach();
        unsafe { allocator.free(tracked.block()) };
        Ok(())
    }

    fn untracked(tracked: TrackedBlock) -> NonNull<u8> {
        tracked.attach(SlotRef::Untracked);
        tracked.payload()
    }

    /// Before the table exists, every live block must be untracked.
    unsafe fn untracked_block(payload: NonNull<u8>) -> Result<TrackedBlock, TrackError> {
        let tracked = unsafe { TrackedBlock::from_payload(payload) }?;
        match tracked.slot_ref()? {
            SlotRef::Untracked => Ok(tracked),
            SlotRef::Tracked(_) => Err(TrackError::corruption(
                tracked.payload_addr(),
                Corruption::TrackedDuringBootstrap,
            )),
        }
    }
}
