//! Run-once cleanup actions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Action = Box<dyn FnOnce() + Send>;

/// Wraps cleanup actions so they run at most once.
pub struct DisposeOnce;

impl DisposeOnce {
    pub fn wrap<F>(action: F) -> ReleaseHandle
    where
        F: FnOnce() + Send + 'static,
    {
        ReleaseHandle {
            inner: Arc::new(Inner {
                action: Mutex::new(Some(Box::new(action))),
                released: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    action: Mutex<Option<Action>>,
    released: AtomicBool,
}

/// A clonable handle to a wrapped action. Any clone may release it, from
/// any thread; only the first release runs the action.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<Inner>,
}

impl ReleaseHandle {
    /// Runs the action if nobody has yet. Returns `true` for the caller that
    /// ran it.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        // A panicking action must not leave later releases stuck on a
        // poisoned lock.
        let action = match self.inner.action.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Returns a guard that releases when dropped, including during unwind.
    pub fn scoped(&self) -> ScopedRelease {
        ScopedRelease {
            handle: self.clone(),
        }
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Debug)]
#[must_use = "the action is released as soon as the guard is dropped"]
pub struct ScopedRelease {
    handle: ReleaseHandle,
}

impl Drop for ScopedRelease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn concurrent_release_runs_action_once() {
        for _ in 0..50 {
            let counter = Arc::new(AtomicUsize::new(0));
            let c = counter.clone();
            let handle = DisposeOnce::wrap(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });

            let barrier = Arc::new(Barrier::new(2));
            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let handle = handle.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        handle.release()
                    })
                })
                .collect();
            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn scoped_release_runs_on_unwind() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = DisposeOnce::wrap(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let h = handle.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = h.scoped();
            panic!("teardown must still happen");
        }));

        assert!(result.is_err());
        assert!(handle.is_released());
        assert!(!handle.release());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
