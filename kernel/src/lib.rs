// =============================================================================
// SimOS — Kernel Core
// =============================================================================
//
// The part of a teaching operating system that sits between user programs
// and the simulated machine:
//
//   sync/       SpinLock (atomicity), Semaphore, Lock, Mesa Condition
//   memory/     frame allocator with two-phase reservation, page tables
//   userprog/   address spaces: load, translate, fork
//   task/       kernel threads, scheduler primitive, process table
//   syscall     Halt, Add, Fork, Exec, ExecV, Join, Exit
//
// The instruction interpreter and the file store are collaborators behind
// the `Processor` and `FileSystem` traits.
//
// =============================================================================

pub mod config;
pub mod fs;
pub mod kernel;
pub mod machine;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod userprog;

pub use config::KernelConfig;
pub use kernel::Kernel;
pub use machine::{Machine, Processor};
pub use syscall::{Flow, handle_syscall};
