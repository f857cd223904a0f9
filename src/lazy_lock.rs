use std::{
    cell::UnsafeCell,
    mem::{self, MaybeUninit},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized (or that the last attempt failed)
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. Allocations made from
    /// inside the initializer see this.
    Initializing,
}

impl LazyLockState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LazyLockState::Init,
            2 => LazyLockState::Initializing,
            _ => LazyLockState::Uninit,
        }
    }
}

/// A once-cell whose initializer may fail, and whose state can be polled
/// (including mid-init) without blocking.
///
/// The fast path is a single acquire load. The first caller to find it
/// uninitialized takes the mutex, checks again, and runs the initializer;
/// everyone else who misses the fast path waits on the mutex and then sees the
/// result. A failed initializer leaves the lock `Uninit`, so the next caller
/// retries.
pub struct LazyLock<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    state: AtomicU8,
}

// SAFETY: the cell is only written while holding `lock` and before `state`
// is published as `Init`; after that it is only ever read.
unsafe impl<T: Send + Sync> Sync for LazyLock<T> {}
unsafe impl<T: Send> Send for LazyLock<T> {}

impl<T> LazyLock<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
        }
    }

    pub fn state(&self) -> LazyLockState {
        LazyLockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn get(&self) -> Option<&T> {
        if self.state() == LazyLockState::Init {
            // SAFETY: `Init` is only stored (with release ordering) after the
            // cell was written, and the cell is never written again.
            Some(unsafe { (*self.cell.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        cold(|| self.initialize(init))
    }

    fn initialize<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        // A panicking `init` poisons the mutex; the unit inside carries no
        // invariant, and `Unwinding` below puts the state back.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.get() {
            return Ok(value);
        }
        self.state
            .store(LazyLockState::Initializing as u8, Ordering::Release);
        let unwinding = Unwinding(&self.state);
        let result = init();
        mem::forget(unwinding);
        match result {
            Ok(value) => {
                // SAFETY: we hold the lock and the state is not `Init`, so no
                // one else reads or writes the cell.
                unsafe { (*self.cell.get()).write(value) };
                self.state.store(LazyLockState::Init as u8, Ordering::Release);
                // SAFETY: just written
                Ok(unsafe { (*self.cell.get()).assume_init_ref() })
            }
            Err(err) => {
                self.state.store(LazyLockState::Uninit as u8, Ordering::Release);
                Err(err)
            }
        }
    }
}

/// Resets the state to `Uninit` if the initializer unwinds
struct Unwinding<'a>(&'a AtomicU8);

impl Drop for Unwinding<'_> {
    fn drop(&mut self) {
        self.0.store(LazyLockState::Uninit as u8, Ordering::Release);
    }
}

impl<T> Default for LazyLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazyLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and we have exclusive access
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::*;

    #[test]
    fn starts_uninit() {
        let lock = LazyLock::<u32>::new();
        assert_eq!(lock.state(), LazyLockState::Uninit);
        assert!(lock.get().is_none());
    }

    #[test]
    fn failure_leaves_it_retryable() {
        let lock = LazyLock::<u32>::new();
        assert_eq!(lock.get_or_try_init(|| Err::<u32, _>("nope")), Err("nope"));
        assert_eq!(lock.state(), LazyLockState::Uninit);
        assert_eq!(lock.get_or_try_init(|| Ok::<_, ()>(7)), Ok(&7));
        assert_eq!(lock.state(), LazyLockState::Init);
        // a later initializer is never run
        assert_eq!(lock.get_or_try_init(|| Err::<u32, _>(())), Ok(&7));
    }

    #[test]
    fn state_is_initializing_inside_the_initializer() {
        let lock = LazyLock::<LazyLockState>::new();
        let seen = lock.get_or_try_init(|| Ok::<_, ()>(lock.state())).unwrap();
        assert_eq!(*seen, LazyLockState::Initializing);
    }

    #[test]
    fn initializer_runs_once_under_contention() {
        let runs = AtomicUsize::new(0);
        let lock = LazyLock::<usize>::new();
        crossbeam::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|_| {
                    let value = lock
                        .get_or_try_init(|| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::yield_now();
                            Ok::<_, ()>(42)
                        })
                        .unwrap();
                    assert_eq!(*value, 42);
                });
            }
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_initializer_leaves_it_retryable() {
        let lock = LazyLock::<u32>::new();
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            lock.get_or_try_init(|| -> Result<u32, ()> { panic!("initializer gave up") })
        }));
        assert!(unwound.is_err());
        assert_eq!(lock.state(), LazyLockState::Uninit);
        assert!(lock.get().is_none());
        assert_eq!(lock.get_or_try_init(|| Ok::<_, ()>(3)), Ok(&3));
    }

    #[test]
    fn value_is_dropped_with_the_lock() {
        let value = Arc::new(());
        let lock = LazyLock::new();
        lock.get_or_try_init(|| Ok::<_, ()>(Arc::clone(&value))).unwrap();
        assert_eq!(Arc::strong_count(&value), 2);
        drop(lock);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
