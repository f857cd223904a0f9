//! Who called the allocator. We record one address per allocation: the start
//! of the function that called `malloc()`, or the raw return address when the
//! dynamic linker cannot name the function.

use std::{
    cell::Cell,
    ffi::{c_void, CStr},
    mem::MaybeUninit,
};

use serde::{Deserialize, Serialize};

use crate::serialize::serde_hex;

/// An address identifying where an allocation was made. `0` means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallSite(#[serde(with = "serde_hex")] usize);

thread_local! {
    // Unwinding can allocate on some platforms. If it does, the nested
    // allocation gets an unknown call site instead of recursing forever.
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

impl CallSite {
    pub const UNKNOWN: CallSite = CallSite(0);

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Resolve a return address to the start of its enclosing symbol, keeping
    /// the return address itself if there is no symbol for it.
    pub fn resolve(return_addr: usize) -> Self {
        match dl_info(return_addr) {
            Some(info) if !info.dli_saddr.is_null() => Self(info.dli_saddr as usize),
            _ => Self(return_addr),
        }
    }

    /// Name of the dynamic symbol this address belongs to, if there is one.
    /// Does not allocate.
    pub fn symbol_name(self) -> Option<&'static CStr> {
        let info = dl_info(self.0)?;
        if info.dli_sname.is_null() {
            return None;
        }
        // SAFETY: `dli_sname` points into the string table of a loaded object.
        // Nothing we trace is ever unloaded.
        Some(unsafe { CStr::from_ptr(info.dli_sname) })
    }

    /// The first frame on the current stack that does not belong to the object
    /// this crate is linked into, resolved with [`CallSite::resolve`].
    ///
    /// Built as a preloaded `cdylib`, that is exactly the application code that
    /// called `malloc()`. Linked statically into an executable, every frame
    /// belongs to "us" and the result is [`CallSite::UNKNOWN`].
    pub fn external_caller() -> Self {
        if RESOLVING.with(Cell::get) {
            return Self::UNKNOWN;
        }
        RESOLVING.with(|r| r.set(true));

        let own_base = module_base(Self::external_caller as *const () as usize);
        let mut found = 0usize;
        // SAFETY: `trace_unsynchronized` is only unsafe because concurrent
        // calls are unsynchronized; the unwinder we use is thread safe, and
        // the closure neither panics nor allocates.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return true;
                }
                match module_base(ip) {
                    Some(base) if Some(base) == own_base => true,
                    _ => {
                        found = ip;
                        false
                    }
                }
            });
        }

        RESOLVING.with(|r| r.set(false));
        if found == 0 {
            Self::UNKNOWN
        } else {
            Self::resolve(found)
        }
    }
}

fn dl_info(addr: usize) -> Option<libc::Dl_info> {
    let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: `dladdr()` only inspects `addr`, it never dereferences it, and
    // writes a `Dl_info` on success.
    let found = unsafe { libc::dladdr(addr as *const c_void, info.as_mut_ptr()) };
    if found == 0 {
        None
    } else {
        // SAFETY: written by `dladdr()` (and zero-initialized before that)
        Some(unsafe { info.assume_init() })
    }
}

/// Load address of the shared object containing `addr`
fn module_base(addr: usize) -> Option<usize> {
    dl_info(addr).map(|info| info.dli_fbase as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_site_is_at_or_before_the_return_address() {
        let ip = resolved_site_is_at_or_before_the_return_address as *const () as usize + 8;
        let site = CallSite::resolve(ip);
        assert!(!site.is_unknown());
        assert!(site.addr() <= ip);
    }

    #[test]
    fn unmapped_addresses_resolve_to_themselves() {
        assert_eq!(CallSite::resolve(0x10).addr(), 0x10);
    }

    #[test]
    fn statically_linked_caller_is_unknown_or_foreign() {
        // The test binary is one object, so every frame of ours is skipped.
        // What is left (if anything) lives in libc's thread start code.
        let site = CallSite::external_caller();
        if !site.is_unknown() {
            assert_ne!(
                module_base(site.addr()),
                module_base(CallSite::external_caller as *const () as usize)
            );
        }
    }

    #[test]
    fn exported_functions_have_names() {
        let site = CallSite::resolve(libc::getpid as *const () as usize);
        assert_eq!(site.addr(), libc::getpid as *const () as usize);
        assert!(site.symbol_name().is_some());
        assert!(CallSite::from_addr(0x10).symbol_name().is_none());
    }

    #[test]
    fn call_sites_serialize_as_hex() {
        let json = serde_json::to_string(&CallSite::from_addr(0x401000)).unwrap();
        assert_eq!(json, r#""0x401000""#);
    }
}
