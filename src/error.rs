use std::{
    ffi::CStr,
    fmt::{self, Write},
    io,
};

use thiserror::Error;

/// What was wrong with a pointer handed back to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Corruption {
    /// The word in front of the payload is not our signature: either the heap
    /// was overwritten, the pointer was freed already, or it never came from
    /// this allocator.
    #[error("header signature {found:#x} does not match")]
    BadSignature { found: u64 },
    /// The header names a slot that cannot exist.
    #[error("header refers to slot {index}, beyond the end of the table")]
    SlotOutOfRange { index: u64 },
    /// The slot the header points at is tracking some other address (or
    /// nothing at all).
    #[error("slot {index} holds {found:#x}")]
    SlotMismatch { index: usize, found: usize },
    /// An aligned header says its block starts somewhere it cannot.
    #[error("aligned header has an impossible offset {offset:#x}")]
    BadOffset { offset: u64 },
    /// A tracked block was released before any table existed.
    #[error("tracked block seen before the table was established")]
    TrackedDuringBootstrap,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TrackError {
    /// The underlying allocator returned null, or the request overflowed
    /// before it could be forwarded.
    #[error("underlying allocator could not provide {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("tracking table exhausted: all {capacity} slots are occupied")]
    TableExhausted { capacity: usize },
    #[error("corruption detected at {address:#x}: {kind}")]
    CorruptionDetected { address: usize, kind: Corruption },
    /// An alignment that is not a power of two. Recoverable: the C entry
    /// points report it as `EINVAL`.
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    #[error("invalid table capacity {0}")]
    InvalidCapacity(u64),
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },
    #[error("cannot set up backing region: {0}")]
    Region(#[from] io::Error),
}

impl TrackError {
    /// Everything except allocator exhaustion and a bad alignment must stop
    /// the process once it reaches the C entry points.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TrackError::OutOfMemory { .. } | TrackError::InvalidAlignment { .. }
        )
    }

    /// What a C caller sees in `errno` for a recoverable error
    pub fn errno(&self) -> Option<i32> {
        match self {
            TrackError::OutOfMemory { .. } => Some(libc::ENOMEM),
            TrackError::InvalidAlignment { .. } => Some(libc::EINVAL),
            _ => None,
        }
    }

    pub(crate) fn corruption(address: usize, kind: Corruption) -> Self {
        TrackError::CorruptionDetected { address, kind }
    }

    /// The `Display` text, without allocating. `io::Error` renders an OS
    /// error through a `String`, so that case is spelled out here.
    pub fn write_message(&self, out: &mut impl Write) -> fmt::Result {
        match self {
            TrackError::Region(err) => match err.raw_os_error() {
                Some(code) => {
                    out.write_str("cannot set up backing region: ")?;
                    write_os_error(out, code)
                }
                None => write!(out, "{self}"),
            },
            _ => write!(out, "{self}"),
        }
    }
}

/// `strerror` text followed by `(os error N)`, as `io::Error` prints it
fn write_os_error(out: &mut impl Write, code: i32) -> fmt::Result {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: `buf` is writable for its whole length
    if unsafe { libc::strerror_r(code, buf.as_mut_ptr(), buf.len()) } == 0 {
        // SAFETY: NUL-terminated on success
        let text = unsafe { CStr::from_ptr(buf.as_ptr()) };
        if let Ok(text) = text.to_str() {
            write!(out, "{text} ")?;
        }
    }
    write!(out, "(os error {code})")
}
