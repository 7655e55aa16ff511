// =============================================================================
// SimOS — Simulated Interrupt Level
// =============================================================================
//
// The simulated machine has a single logical core. While a kernel thread
// runs with interrupts masked, no other context can observe the data it is
// touching, which is the only atomicity the primitive layer relies on.
//
// Every kernel thread is hosted on its own host thread, so the mask level is
// tracked per context. `SpinLock` is the only code that flips it: it masks on
// lock and restores the saved level on unlock, so nested critical sections
// compose.
//
// =============================================================================

use core::cell::Cell;

/// Interrupt mask level of the current execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntStatus {
    IntOff,
    IntOn,
}

thread_local! {
    static LEVEL: Cell<IntStatus> = const { Cell::new(IntStatus::IntOn) };
}

/// Current interrupt level of the calling context.
#[inline]
pub fn level() -> IntStatus {
    LEVEL.with(|l| l.get())
}

/// Set the interrupt level, returning the previous one so the caller can
/// restore it exactly.
#[inline]
pub fn set_level(new: IntStatus) -> IntStatus {
    LEVEL.with(|l| l.replace(new))
}

/// Checks whether interrupts are currently enabled for this context.
#[inline]
pub fn interrupts_enabled() -> bool {
    level() == IntStatus::IntOn
}
