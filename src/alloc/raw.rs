//! The allocator we wrap. Tracking logic only ever talks to a
//! [`RawAllocator`], so it can run against the system allocator, glibc's
//! internal entry points (when we *are* `malloc`), or a fake in tests.

use std::{ffi::c_void, ptr::NonNull};

use crate::util::hint::cold;

/// The C allocation functions, as a capability.
///
/// # Safety
///
/// Implementations must behave like their C counterparts: a returned block has
/// at least the requested size, is aligned for any fundamental type, and stays
/// valid until it is passed to `realloc()` or `free()`. `calloc()` must return
/// zeroed memory. `realloc()` must leave the original block untouched when it
/// fails. A block from `memalign()` must start on a multiple of `align` and
/// be releasable with `free()`.
pub unsafe trait RawAllocator: Send + Sync {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// `align` is a power of two, larger than `malloc()` alignment.
    fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>>;

    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `block` must have come from this allocator and not been freed yet.
    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `block` must have come from this allocator and not been freed yet.
    unsafe fn free(&self, block: NonNull<u8>);
}

fn non_null(data: *mut c_void) -> Option<NonNull<u8>> {
    match NonNull::new(data.cast::<u8>()) {
        Some(data) => Some(data),
        None => cold(|| None),
    }
}

/// Whatever `malloc()` resolves to for this binary. Do not use this from
/// inside an interposed `malloc()`: it would call straight back into us.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

// SAFETY: straight calls to the C library
unsafe impl RawAllocator for SystemAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { libc::malloc(size) })
    }

    fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let mut block = std::ptr::null_mut();
        // SAFETY: `block` is a valid out pointer
        match unsafe { libc::posix_memalign(&mut block, align, size) } {
            0 => non_null(block),
            _ => cold(|| None),
        }
    }

    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { libc::calloc(count, size) })
    }

    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: identical contract to `realloc(3)`
        non_null(unsafe { libc::realloc(block.as_ptr().cast(), size) })
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        // SAFETY: identical contract to `free(3)`
        unsafe { libc::free(block.as_ptr().cast()) }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) mod glibc {
    use core::ffi::c_void;

    extern "C" {
        pub fn __libc_malloc(size: usize) -> *mut c_void;
        pub fn __libc_calloc(count: usize, size: usize) -> *mut c_void;
        pub fn __libc_memalign(align: usize, size: usize) -> *mut c_void;
        pub fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
        pub fn __libc_free(ptr: *mut c_void);
    }
}

/// glibc's allocator, reached through its internal `__libc_*` names. These are
/// bound at link time and are not interposable, so this is what an exported
/// `malloc()` forwards to.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct GlibcAllocator;

// SAFETY: these are the implementations behind glibc's public allocator
// functions, with the same contracts.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe impl RawAllocator for GlibcAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { glibc::__libc_malloc(size) })
    }

    fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { glibc::__libc_memalign(align, size) })
    }

    fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { glibc::__libc_calloc(count, size) })
    }

    unsafe fn realloc(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        non_null(unsafe { glibc::__libc_realloc(block.as_ptr().cast(), size) })
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        unsafe { glibc::__libc_free(block.as_ptr().cast()) }
    }
}
