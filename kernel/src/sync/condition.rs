// =============================================================================
// SimOS — Mesa-style Condition Variable
// =============================================================================
//
// Every waiter gets its own one-shot semaphore. `wait` queues it *before*
// releasing the lock, so a signal issued between the release and the P
// still finds the waiter and leaves a unit on its semaphore: no wakeup is
// ever lost.
//
// Signal only makes the waiter runnable. It neither hands over the lock nor
// the core, so waiters re-check their predicate after `wait` returns.
//
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use crate::sync::lock::Lock;
use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::SpinLock;

/// A condition variable used together with a [`Lock`].
pub struct Condition {
    name: String,
    waiters: SpinLock<VecDeque<Arc<Semaphore>>>,
}

impl Condition {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically release `lock` and sleep until signalled, then re-acquire
    /// `lock` before returning.
    pub fn wait(&self, lock: &Lock) {
        self.assert_held(lock, "wait");

        let waiter = Arc::new(Semaphore::new(&self.name, 0));
        self.waiters.lock().push_back(Arc::clone(&waiter));

        lock.release();
        waiter.p();
        lock.acquire();
    }

    /// Wake the oldest waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        self.assert_held(lock, "signal");

        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.v();
        }
    }

    /// Wake every thread queued at the time of the call.
    pub fn broadcast(&self, lock: &Lock) {
        while self.waiter_count() > 0 {
            self.signal(lock);
        }
    }

    /// Number of queued waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn assert_held(&self, lock: &Lock, op: &str) {
        assert!(
            lock.is_held_by_current_thread(),
            "condition '{}': {} without holding lock '{}'",
            self.name,
            op,
            lock.name()
        );
    }
}

impl core::fmt::Debug for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
