//! The exported C allocator. Only built with the `preload` feature: in any
//! other build these symbols would replace `malloc()` for the binary itself.
//!
//! ```bash
//! cargo build --release --features preload
//! LD_PRELOAD=target/release/libmemtrack.so MEM_TRACK_FILE=/tmp/app ./app
//! memtrack-report /tmp/app.<pid>
//! ```

use std::{
    ffi::{c_int, c_void},
    fmt::Write,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::size_t;

use crate::{
    alloc::raw::GlibcAllocator,
    arch::caller::CallSite,
    config::Config,
    error::TrackError,
    lifecycle::{ConfigLoader, Lifecycle},
    putln,
    util::print::{putbytes, Hex, StackBuf},
};

static LIFECYCLE: Lifecycle<GlibcAllocator> =
    Lifecycle::new(GlibcAllocator, Config::from_env as ConfigLoader);

/// Set once the first fatal error is being reported
static REPORTING: AtomicBool = AtomicBool::new(false);

/// Set up the table as soon as we are loaded, before `main()`. Anything the
/// dynamic loader allocated before this point went through the lazy path.
#[ctor::ctor]
fn attach() {
    if let Err(err) = LIFECYCLE.attach() {
        fatal(&err);
    }
}

/// One line on stderr, then `abort()`. Nothing here allocates, and whatever
/// else the process allocates from now on is served untracked. A fatal error
/// while reporting another aborts straight away.
#[cold]
fn fatal(err: &TrackError) -> ! {
    LIFECYCLE.abandon();
    if !REPORTING.swap(true, Ordering::SeqCst) {
        let mut message = StackBuf::<512>::new();
        // Truncation is fine
        let _ = message.write_str("memtrack: fatal: ");
        let _ = err.write_message(&mut message);
        putbytes(message.as_bytes());
        putbytes(b"\n");
    }
    // SAFETY: always safe to call
    unsafe { libc::abort() }
}

fn verbose() -> bool {
    LIFECYCLE
        .context()
        .is_some_and(|context| context.config().verbose)
}

fn external_caller() -> CallSite {
    let site = CallSite::external_caller();
    if verbose() {
        let name = site.symbol_name().and_then(|name| name.to_str().ok());
        putln!("memtrack: caller ", Hex(site.addr()), " ", name.unwrap_or("?"));
    }
    site
}

fn set_errno(code: c_int) {
    // SAFETY: the calling thread's errno
    unsafe { *libc::__errno_location() = code };
}

/// Turn a result into what C expects, setting `errno` on recoverable failure
fn c_result(result: Result<ptr::NonNull<u8>, TrackError>) -> *mut c_void {
    match result {
        Ok(payload) => payload.as_ptr().cast(),
        Err(err) => match err.errno() {
            Some(code) => {
                set_errno(code);
                ptr::null_mut()
            }
            None => fatal(&err),
        },
    }
}

fn page_size() -> usize {
    // SAFETY: always safe to call
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: malloc ", size);
    }
    c_result(LIFECYCLE.allocate(size, external_caller))
}

#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: calloc ", count, " x ", size);
    }
    c_result(LIFECYCLE.zero_allocate(count, size, external_caller))
}

#[no_mangle]
pub unsafe extern "C" fn realloc(existing: *mut c_void, size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: realloc ", Hex(existing as usize), " ", size);
    }
    // SAFETY: C's contract for `realloc()`
    c_result(unsafe { LIFECYCLE.resize(existing.cast(), size, external_caller) })
}

#[no_mangle]
pub unsafe extern "C" fn free(payload: *mut c_void) {
    if verbose() && !payload.is_null() {
        putln!("memtrack: free ", Hex(payload as usize));
    }
    // SAFETY: C's contract for `free()`
    if let Err(err) = unsafe { LIFECYCLE.release(payload.cast()) } {
        fatal(&err);
    }
}

/// Like glibc, a non power of two is rounded up to the next one.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: memalign ", align, " ", size);
    }
    let Some(align) = align.max(1).checked_next_power_of_two() else {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    };
    c_result(LIFECYCLE.allocate_aligned(align, size, external_caller))
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: aligned_alloc ", align, " ", size);
    }
    c_result(LIFECYCLE.allocate_aligned(align, size, external_caller))
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    if verbose() {
        putln!("memtrack: posix_memalign ", align, " ", size);
    }
    if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    match LIFECYCLE.allocate_aligned(align, size, external_caller) {
        Ok(payload) => {
            // SAFETY: C's contract for `posix_memalign()`
            unsafe { *out = payload.as_ptr().cast() };
            0
        }
        Err(err) => match err.errno() {
            Some(code) => code,
            None => fatal(&err),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: valloc ", size);
    }
    c_result(LIFECYCLE.allocate_aligned(page_size(), size, external_caller))
}

/// `valloc()` with the size rounded up to whole pages
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    if verbose() {
        putln!("memtrack: pvalloc ", size);
    }
    let page = page_size();
    let Some(rounded) = size.max(1).checked_next_multiple_of(page) else {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    };
    c_result(LIFECYCLE.allocate_aligned(page, rounded, external_caller))
}
