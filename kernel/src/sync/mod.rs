// =============================================================================
// SimOS — Kernel Synchronization Primitives
// =============================================================================
//
// Two layers:
//   - `SpinLock` is the atomicity primitive. It masks the simulated interrupt
//     level for short critical sections and never sleeps.
//   - `Semaphore`, `Lock` and `Condition` block the calling kernel thread.
//     All of their bookkeeping happens under a `SpinLock`.
//
// Lock ordering rules:
//   Level 1 (innermost): frame allocator lock, main memory lock
//   Level 2: page table lock
//   Level 3: per-process status lock
//   Level 4: process table lock (the pid sweep reads status under it)
//   Level 5: thread address-space slot (held across an address-space fork)
//   Level 6 (outermost): per-pid `Lock` (join/exit rendezvous)
//
// Take locks from the outermost level inward, and never sleep while
// holding a `SpinLock` guard.
// =============================================================================

pub mod condition;
pub mod lock;
pub mod semaphore;
pub mod spinlock;

pub use condition::Condition;
pub use lock::Lock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
