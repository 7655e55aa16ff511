//! Scheduler entry points used by the blocking primitives.
//!
//! The host runs every kernel thread on its own host thread, so the only
//! decision left to the kernel is *when* a blocked thread may continue.

use crate::machine::interrupt;
use crate::task::thread::{KThread, ThreadStatus};

/// Mark `thread` runnable.
///
/// The caller must hold the atomicity guard under which `thread` was
/// found on a wait queue; that guard is what keeps the wakeup from racing
/// with the thread's own `sleep`.
pub fn ready_to_run(thread: &KThread) {
    assert!(
        !interrupt::interrupts_enabled(),
        "ready_to_run called with interrupts enabled"
    );
    log::trace!("ready_to_run: tid {} ('{}')", thread.id(), thread.name());
    thread.set_status(ThreadStatus::Ready);
    thread.wake();
}
