/// Mark a branch as #[cold]. Used for the paths that end in a fatal error or
/// in first-time initialization.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
