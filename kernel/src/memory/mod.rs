//! Physical frame accounting and per-process page tables.

pub mod address;
pub mod bitmap;
pub mod pmm;
pub mod vmm;

pub use address::{PhysAddr, VirtAddr};
pub use pmm::MemoryManager;
pub use vmm::{EntryFlags, ExceptionType, PageTable, TranslationEntry};
