// =============================================================================
// SimOS — Blocking Mutual-Exclusion Lock
// =============================================================================
//
// A lock is a binary semaphore that remembers who holds it. Only the holder
// may release it, and the condition variable uses the holder check to catch
// waits without the lock.
//
// Unlike `SpinLock`, a thread that finds the lock taken goes to sleep, so a
// `Lock` may be held across operations that themselves block.
//
// =============================================================================

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::semaphore::Semaphore;
use crate::task::thread::KThread;

/// Holder id meaning "free".
const NO_HOLDER: u64 = 0;

/// A sleeping mutual-exclusion lock with owner tracking.
pub struct Lock {
    name: String,
    sem: Semaphore,
    holder: AtomicU64,
}

impl Lock {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            sem: Semaphore::new(name, 1),
            holder: AtomicU64::new(NO_HOLDER),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the lock is free, then take it.
    ///
    /// Not re-entrant: a holder that acquires again sleeps forever.
    pub fn acquire(&self) {
        let current = KThread::current();
        self.sem.p();
        self.holder.store(current.id(), Ordering::Release);
    }

    /// Release the lock. Panics unless the caller holds it.
    pub fn release(&self) {
        let current = KThread::current();
        assert!(
            self.is_held_by(current.id()),
            "lock '{}' released by tid {}, which does not hold it",
            self.name,
            current.id()
        );
        self.holder.store(NO_HOLDER, Ordering::Release);
        self.sem.v();
    }

    /// Does the calling thread hold the lock?
    pub fn is_held_by_current_thread(&self) -> bool {
        self.is_held_by(KThread::current().id())
    }

    fn is_held_by(&self, tid: u64) -> bool {
        self.holder.load(Ordering::Acquire) == tid
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let result = f();
        self.release();
        result
    }
}

impl core::fmt::Debug for Lock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("holder", &self.holder.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn holder_is_tracked() {
        let lock = Lock::new("l");
        assert!(!lock.is_held_by_current_thread());
        lock.acquire();
        assert!(lock.is_held_by_current_thread());
        lock.release();
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn release_by_non_holder_panics() {
        let lock = Lock::new("l");
        lock.release();
    }

    #[test]
    fn release_from_another_thread_is_rejected() {
        let lock = Arc::new(Lock::new("l"));
        lock.acquire();
        let l = Arc::clone(&lock);
        let result = KThread::new("intruder").fork(move || l.release()).join();
        assert!(result.is_err());
        assert!(lock.is_held_by_current_thread());
        lock.release();
    }

    #[test]
    fn critical_sections_do_not_overlap() {
        let lock = Arc::new(Lock::new("l"));
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (l, inside, total) = (Arc::clone(&lock), Arc::clone(&inside), Arc::clone(&total));
                KThread::new(&format!("worker-{}", i)).fork(move || {
                    for _ in 0..50 {
                        l.with(|| {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            std::thread::yield_now();
                            total.fetch_add(1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 200);
    }
}
