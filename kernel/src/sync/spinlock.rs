// =============================================================================
// SimOS — Ticket Spinlock (the atomicity primitive)
// =============================================================================
//
// A ticket spinlock provides mutual exclusion for short kernel critical
// sections. Threads acquire the lock in FIFO order, preventing starvation.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically increment `next_ticket`, get your ticket number.
//     Spin until `now_serving` equals your ticket.
//   - To unlock: increment `now_serving`, which lets the next waiter proceed.
//
// INTERRUPT LEVEL:
//   Holding the guard is what "interrupts off" means on the simulated
//   machine. The lock masks the simulated interrupt level of the calling
//   context before taking a ticket and restores the saved level when the
//   guard drops, so nested lock/unlock pairs work correctly.
//
//   Nothing ever blocks while holding a guard. A thread that has to sleep
//   hands its guard to `KThread::sleep`, which releases it first and takes
//   it again after the thread has been made ready.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::machine::interrupt::{self, IntStatus};

/// Spins before handing the host core to somebody else.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A ticket-based spinlock that masks the simulated interrupt level while
/// held.
///
/// # Type Parameter
/// - `T`: The data protected by the lock. Must be `Send` because ownership
///   effectively transfers between execution contexts when the lock is
///   acquired.
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data.
    data: UnsafeCell<T>,
}

// SAFETY: the lock ensures that only one context accesses T at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, masking interrupts for the current context.
    ///
    /// Interrupts are masked BEFORE taking a ticket. The previous level is
    /// saved in the guard and restored on unlock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let saved = interrupt::set_level(IntStatus::IntOff);

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut spins = 0;
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                core::hint::spin_loop();
            } else {
                // The holder may be descheduled by the host.
                spins = 0;
                std::thread::yield_now();
            }
        }

        SpinLockGuard {
            lock: self,
            saved,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `None` (with the interrupt level untouched) if the lock is
    /// currently held.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let saved = interrupt::set_level(IntStatus::IntOff);

        let current = self.now_serving.load(Ordering::Relaxed);
        let result = self.next_ticket.compare_exchange(
            current,
            current.wrapping_add(1),
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        match result {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                saved,
                _not_send: PhantomData,
            }),
            Err(_) => {
                interrupt::set_level(saved);
                None
            }
        }
    }

    /// Returns `true` if some context currently holds the lock.
    ///
    /// Advisory only: the answer may be stale by the time it is used.
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` guarantees exclusive access at compile time, so no lock
    /// is needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists the holder has exclusive access to the protected
/// data and runs with the simulated interrupt level masked. The guard is tied
/// to the context that took it (`!Send`): the saved level belongs to that
/// context.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    saved: IntStatus,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard holds. Used to re-acquire after a sleep.
    pub fn spinlock(this: &Self) -> &'a SpinLock<T> {
        this.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    /// Releases the lock and restores the previous interrupt level.
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        interrupt::set_level(self.saved);
    }
}
