// =============================================================================
// SimOS — Counting Semaphore
// =============================================================================
//
// Classic Dijkstra semaphore: a non-negative counter with P (wait) and
// V (signal). P blocks while the counter is zero; V wakes the oldest waiter.
//
// Both operations run with the atomicity guard held. P re-checks the value
// after every wakeup, so a thread made ready by V may find the unit already
// taken by somebody else and go back to sleep.
//
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use crate::sync::spinlock::SpinLock;
use crate::task::scheduler;
use crate::task::thread::KThread;

struct SemState {
    value: u32,
    queue: VecDeque<Arc<KThread>>,
}

/// A counting semaphore.
pub struct Semaphore {
    name: String,
    state: SpinLock<SemState>,
}

impl Semaphore {
    pub fn new(name: &str, initial: u32) -> Self {
        Self {
            name: String::from(name),
            state: SpinLock::new(SemState {
                value: initial,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the value is positive, then decrement it.
    pub fn p(&self) {
        let current = KThread::current();
        let mut state = self.state.lock();

        while state.value == 0 {
            state.queue.push_back(Arc::clone(&current));
            state = current.sleep(state);
        }
        state.value -= 1;
    }

    /// Increment the value, waking the oldest waiter if there is one.
    pub fn v(&self) {
        let mut state = self.state.lock();

        if let Some(thread) = state.queue.pop_front() {
            scheduler::ready_to_run(&thread);
        }
        state.value += 1;
    }

    /// Current value. Advisory: may be stale as soon as it returns.
    pub fn value(&self) -> u32 {
        self.state.lock().value
    }

    /// Number of threads currently asleep in `p`.
    pub fn waiters(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let name = &self.name;
        let state = self.state.get_mut();
        assert!(
            state.queue.is_empty(),
            "semaphore '{}' destroyed with {} waiting thread(s)",
            name,
            state.queue.len()
        );
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("value", &self.value())
            .finish()
    }
}
