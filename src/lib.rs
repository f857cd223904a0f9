//! A live census of every heap allocation a process has outstanding.
//!
//! Built with the `preload` feature, the `cdylib` exports `malloc()`,
//! `calloc()`, `realloc()`, `free()` and the aligned family (`memalign()`,
//! `posix_memalign()`, `aligned_alloc()`, `valloc()`, `pvalloc()`). Loaded
//! with `LD_PRELOAD`, it forwards each request to glibc, hides a small
//! header in front of every block, and records
//! `{address, requested size, call site}` in a table that lives in a shared
//! file mapping. Another process (see the `memtrack-report` binary and
//! [`census`]) can read that file at any time, while the program runs or after
//! it crashed.
//!
//! Without `preload` this is an ordinary library: [`Tracker`] does the same
//! bookkeeping against any [`RawAllocator`].

pub mod alloc;
pub mod arch;
pub mod census;
pub mod config;
pub mod error;
mod lazy_lock;
pub mod lifecycle;
pub mod maps;
pub mod os;
pub mod serialize;
pub mod symbols;
pub mod util;

#[cfg(all(feature = "preload", target_os = "linux", target_env = "gnu"))]
mod externc;

pub use crate::alloc::{
    raw::{RawAllocator, SystemAllocator},
    table::{SlotRecord, TrackingTable, RECORD_SIZE},
    tracking::Tracker,
};
pub use crate::arch::caller::CallSite;
pub use config::Config;
pub use error::{Corruption, TrackError};
pub use lazy_lock::LazyLockState;
pub use lifecycle::{Context, Lifecycle, Stage};
