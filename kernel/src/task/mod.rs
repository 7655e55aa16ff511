//! Kernel threads, the scheduler primitive and the process table.

pub mod process;
pub mod scheduler;
pub mod thread;

pub use process::{Proc, ProcessManager};
pub use thread::KThread;
