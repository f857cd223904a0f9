//! Getting from "nothing exists yet" to a tracker, exactly once per process.
//!
//! Building the [`Context`] allocates (the config loader builds paths, the
//! logger may format), and when we are the process' `malloc()` those
//! allocations come straight back to us while initialization is still
//! running. The initializing thread therefore marks itself as bootstrapping;
//! anything it allocates in that window goes to the underlying allocator with
//! an untracked header. Every other thread waits for initialization to finish.
//!
//! A lifecycle can also be abandoned, on the way to aborting the process: from
//! then on every new block is untracked, so that reporting the failure may
//! allocate without coming back to the table that failed.

use std::{
    cell::Cell,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, info};

use crate::{
    alloc::{
        raw::RawAllocator,
        table::TrackingTable,
        tracking::{bootstrap, Tracker},
    },
    arch::caller::CallSite,
    config::Config,
    error::TrackError,
    lazy_lock::{LazyLock, LazyLockState},
};

thread_local! {
    static BOOTSTRAPPING: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread as running the initializer until dropped, which also
/// happens if the initializer unwinds.
struct Bootstrapping;

impl Bootstrapping {
    fn enter() -> Self {
        BOOTSTRAPPING.with(|b| b.set(true));
        Bootstrapping
    }
}

impl Drop for Bootstrapping {
    fn drop(&mut self) {
        BOOTSTRAPPING.with(|b| b.set(false));
    }
}

/// Everything that exists once initialization succeeded. Never torn down.
#[derive(Debug)]
pub struct Context<A> {
    config: Config,
    backing_path: PathBuf,
    tracker: Tracker<A>,
}

impl<A: RawAllocator> Context<A> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing_path
    }

    pub fn tracker(&self) -> &Tracker<A> {
        &self.tracker
    }
}

/// Where an allocation request should go right now
pub enum Stage<'a, A> {
    Ready(&'a Context<A>),
    /// We are inside our own initializer on this thread, or tracking was
    /// abandoned before a table existed
    Bootstrap(&'a A),
}

pub type ConfigLoader = fn() -> Result<Config, TrackError>;

pub struct Lifecycle<A, F = ConfigLoader> {
    allocator: A,
    load_config: F,
    context: LazyLock<Context<A>>,
    abandoned: AtomicBool,
}

impl<A, F> Lifecycle<A, F>
where
    A: RawAllocator + Clone,
    F: Fn() -> Result<Config, TrackError>,
{
    pub const fn new(allocator: A, load_config: F) -> Self {
        Self {
            allocator,
            load_config,
            context: LazyLock::new(),
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LazyLockState {
        self.context.state()
    }

    /// The context, if initialization already happened
    pub fn context(&self) -> Option<&Context<A>> {
        self.context.get()
    }

    /// Initialize now if that has not happened yet. Used eagerly at load time;
    /// [`Lifecycle::stage`] calls it lazily otherwise.
    pub fn attach(&self) -> Result<&Context<A>, TrackError> {
        self.context.get_or_try_init(|| {
            let _bootstrapping = Bootstrapping::enter();
            self.build()
        })
    }

    /// Stop tracking new blocks and never attempt initialization again.
    /// Blocks that are already tracked can still be resized and released.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Where a request about an existing block should go
    pub fn stage(&self) -> Result<Stage<'_, A>, TrackError> {
        if let Some(context) = self.context.get() {
            return Ok(Stage::Ready(context));
        }
        if BOOTSTRAPPING.with(Cell::get) || self.is_abandoned() {
            return Ok(Stage::Bootstrap(&self.allocator));
        }
        self.attach().map(Stage::Ready)
    }

    /// Where a request for a new block should go
    fn fresh_stage(&self) -> Result<Stage<'_, A>, TrackError> {
        if self.is_abandoned() {
            return Ok(Stage::Bootstrap(&self.allocator));
        }
        self.stage()
    }

    fn build(&self) -> Result<Context<A>, TrackError> {
        let config = (self.load_config)()?;
        let backing_path = config.backing_path(std::process::id());
        debug!("loaded config {config:?}");
        let table = TrackingTable::create(&backing_path, config.capacity)?;
        info!("tracking allocations in {}", backing_path.display());
        Ok(Context {
            config,
            backing_path,
            tracker: Tracker::new(table, self.allocator.clone()),
        })
    }

    /// `malloc()`. `call_site` is only evaluated once a table exists.
    pub fn allocate(
        &self,
        size: usize,
        call_site: impl FnOnce() -> CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        match self.fresh_stage()? {
            Stage::Ready(context) => context.tracker.allocate(size, call_site()),
            Stage::Bootstrap(allocator) => bootstrap::allocate(allocator, size),
        }
    }

    /// `calloc()`
    pub fn zero_allocate(
        &self,
        count: usize,
        size: usize,
        call_site: impl FnOnce() -> CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        match self.fresh_stage()? {
            Stage::Ready(context) => context.tracker.zero_allocate(count, size, call_site()),
            Stage::Bootstrap(allocator) => bootstrap::zero_allocate(allocator, count, size),
        }
    }

    /// `memalign()` and friends. `align` must be a power of two.
    pub fn allocate_aligned(
        &self,
        align: usize,
        size: usize,
        call_site: impl FnOnce() -> CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        match self.fresh_stage()? {
            Stage::Ready(context) => context.tracker.allocate_aligned(align, size, call_site()),
            Stage::Bootstrap(allocator) => bootstrap::allocate_aligned(allocator, align, size),
        }
    }

    /// `realloc()`
    ///
    /// # Safety
    ///
    /// See [`Tracker::resize`]
    pub unsafe fn resize(
        &self,
        existing: *mut u8,
        new_size: usize,
        call_site: impl FnOnce() -> CallSite,
    ) -> Result<NonNull<u8>, TrackError> {
        if existing.is_null() {
            return self.allocate(new_size, call_site);
        }
        match self.stage()? {
            Stage::Ready(context) => unsafe {
                context.tracker.resize(existing, new_size, call_site())
            },
            Stage::Bootstrap(allocator) => unsafe {
                bootstrap::resize(allocator, existing, new_size)
            },
        }
    }

    /// `free()`
    ///
    /// # Safety
    ///
    /// See [`Tracker::release`]
    pub unsafe fn release(&self, payload: *mut u8) -> Result<(), TrackError> {
        if payload.is_null() {
            return Ok(());
        }
        match self.stage()? {
            Stage::Ready(context) => unsafe { context.tracker.release(payload) },
            Stage::Bootstrap(allocator) => unsafe { bootstrap::release(allocator, payload) },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicPtr, AtomicUsize, Ordering},
            OnceLock,
        },
    };

    use super::*;
    use crate::alloc::raw::SystemAllocator;

    const SITE: CallSite = CallSite::from_addr(0x4242);

    fn config_in(dir: &Path) -> Config {
        Config::default()
            .with_path_base(dir.join("mem.track"))
            .with_capacity(101)
    }

    #[test]
    fn first_use_creates_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new(SystemAllocator, || Ok(config_in(dir.path())));
        assert_eq!(lifecycle.state(), LazyLockState::Uninit);
        assert!(lifecycle.context().is_none());

        let p = lifecycle.allocate(12, || SITE).unwrap();
        let context = lifecycle.context().unwrap();
        let expected = dir.path().join(format!("mem.track.{}", std::process::id()));
        assert_eq!(context.backing_path(), expected);
        assert_eq!(
            std::fs::metadata(&expected).unwrap().len(),
            101 * crate::RECORD_SIZE as u64
        );
        assert_eq!(context.tracker().table().occupied(), 1);

        unsafe { lifecycle.release(p.as_ptr()) }.unwrap();
        assert_eq!(context.tracker().table().occupied(), 0);
    }

    #[test]
    fn entry_points_record_their_call_site() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new(SystemAllocator, || Ok(config_in(dir.path())));
        let p = lifecycle.zero_allocate(3, 4, || SITE).unwrap();
        let p = unsafe { lifecycle.resize(p.as_ptr(), 100, || CallSite::from_addr(9)) }.unwrap();
        let table = lifecycle.context().unwrap().tracker().table();
        let (_, record) = table.live().next().unwrap();
        assert_eq!((record.size, record.caller), (100, 9));
        unsafe { lifecycle.release(p.as_ptr()) }.unwrap();

        let p = lifecycle.allocate_aligned(64, 10, || CallSite::from_addr(11)).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        let (_, record) = table.live().next().unwrap();
        assert_eq!((record.ptr, record.size, record.caller), (p.as_ptr() as usize, 10, 11));
        unsafe { lifecycle.release(p.as_ptr()) }.unwrap();
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn failed_initialization_is_reported_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = AtomicUsize::new(0);
        let lifecycle = Lifecycle::new(SystemAllocator, || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TrackError::InvalidCapacity(0))
            } else {
                Ok(config_in(dir.path()))
            }
        });
        assert!(matches!(
            lifecycle.allocate(1, || SITE),
            Err(TrackError::InvalidCapacity(0))
        ));
        assert_eq!(lifecycle.state(), LazyLockState::Uninit);

        let p = lifecycle.allocate(1, || SITE).unwrap();
        assert_eq!(lifecycle.state(), LazyLockState::Init);
        unsafe { lifecycle.release(p.as_ptr()) }.unwrap();
    }

    #[test]
    fn unusable_backing_path_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new(SystemAllocator, || {
            Ok(Config::default().with_path_base(dir.path().join("missing/mem.track")))
        });
        let err = lifecycle.attach().unwrap_err();
        assert!(matches!(err, TrackError::Region(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn panicking_config_loader_leaves_the_thread_able_to_track() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = AtomicUsize::new(0);
        let lifecycle = Lifecycle::new(SystemAllocator, || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("config loader gave up");
            }
            Ok(config_in(dir.path()))
        });
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| lifecycle.attach().map(|_| ())));
        assert!(unwound.is_err());
        assert_eq!(lifecycle.state(), LazyLockState::Uninit);

        // Same thread: must initialize and track, not fall back to bootstrap
        let p = lifecycle.allocate(5, || SITE).unwrap();
        let table = lifecycle.context().unwrap().tracker().table();
        assert_eq!(table.occupied(), 1);
        unsafe { lifecycle.release(p.as_ptr()) }.unwrap();
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn abandoned_before_initialization_serves_untracked_blocks() {
        let loads = AtomicUsize::new(0);
        let lifecycle = Lifecycle::new(SystemAllocator, || {
            loads.fetch_add(1, Ordering::SeqCst);
            Err(TrackError::InvalidCapacity(0))
        });
        lifecycle.abandon();
        assert!(lifecycle.is_abandoned());

        let p = lifecycle.allocate(32, || panic!("no call site once abandoned")).unwrap();
        let p = unsafe { lifecycle.resize(p.as_ptr(), 64, || panic!("no call site")) }.unwrap();
        let q = lifecycle.zero_allocate(2, 8, || panic!("no call site")).unwrap();
        let r = lifecycle.allocate_aligned(32, 8, || panic!("no call site")).unwrap();
        unsafe {
            lifecycle.release(p.as_ptr()).unwrap();
            lifecycle.release(q.as_ptr()).unwrap();
            lifecycle.release(r.as_ptr()).unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(lifecycle.context().is_none());
    }

    #[test]
    fn abandoned_after_initialization_still_releases_tracked_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = Lifecycle::new(SystemAllocator, || Ok(config_in(dir.path())));
        let kept = lifecycle.allocate(16, || SITE).unwrap();
        let table = lifecycle.context().unwrap().tracker().table();
        lifecycle.abandon();

        let fresh = lifecycle.allocate(16, || panic!("no call site once abandoned")).unwrap();
        assert_eq!(table.occupied(), 1);
        unsafe {
            lifecycle.release(kept.as_ptr()).unwrap();
            lifecycle.release(fresh.as_ptr()).unwrap();
        }
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn concurrent_first_use_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let loads = AtomicUsize::new(0);
        let lifecycle = Lifecycle::new(SystemAllocator, || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(config_in(dir.path()))
        });
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    let p = lifecycle.allocate(64, || SITE).unwrap();
                    unsafe { lifecycle.release(p.as_ptr()) }.unwrap();
                });
            }
        })
        .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.context().unwrap().tracker().table().occupied(), 0);
    }

    static REENTRANT: Lifecycle<SystemAllocator> =
        Lifecycle::new(SystemAllocator, reentrant_config as ConfigLoader);
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    static DURING_INIT: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());

    /// Allocates through the very lifecycle it is initializing, like a
    /// preloaded `malloc()` would see.
    fn reentrant_config() -> Result<Config, TrackError> {
        let p = REENTRANT.allocate(24, || panic!("no call site during bootstrap"))?;
        assert_eq!(REENTRANT.state(), LazyLockState::Initializing);
        DURING_INIT.store(p.as_ptr(), Ordering::SeqCst);
        let dir = DIR.get_or_init(|| tempfile::tempdir().unwrap());
        Ok(config_in(dir.path()))
    }

    #[test]
    fn allocations_from_the_initializer_are_untracked() {
        let context = REENTRANT.attach().unwrap();
        let p = DURING_INIT.load(Ordering::SeqCst);
        assert!(!p.is_null());
        assert_eq!(context.tracker().table().occupied(), 0);

        // Grown and released through the ready tracker, still untracked
        let p = unsafe { REENTRANT.resize(p, 4096, || SITE) }.unwrap();
        assert_eq!(context.tracker().table().occupied(), 0);
        unsafe { REENTRANT.release(p.as_ptr()) }.unwrap();
    }
}
