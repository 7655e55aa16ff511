//! Kernel configuration.
//!
//! Compile-time defaults for the simulated machine, plus the runtime
//! [`KernelConfig`] that every component reads its limits from.

/// Size of one page (and one physical frame), in bytes.
pub const PAGE_SIZE: usize = 128;

/// Number of physical frames in main memory.
pub const NUM_PHYS_PAGES: usize = 128;

/// Bytes reserved at the top of every address space for the user stack.
pub const USER_STACK_SIZE: usize = 1024;

/// Size of the process table (and of the pid space).
pub const MAX_NUM_PROCESSES: usize = 200;

/// Longest string (including the terminating NUL) copied in from user space.
pub const MAX_ARG_LEN: usize = 128;

/// Distance kept between the initial stack pointer and the end of the
/// address space, so the first push cannot run off the mapping.
pub const STACK_SAFETY_MARGIN: usize = 16;

/// Limits of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub num_phys_pages: usize,
    pub page_size: usize,
    pub user_stack_size: usize,
    pub max_processes: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: NUM_PHYS_PAGES,
            page_size: PAGE_SIZE,
            user_stack_size: USER_STACK_SIZE,
            max_processes: MAX_NUM_PROCESSES,
        }
    }
}

impl KernelConfig {
    pub fn with_phys_pages(mut self, pages: usize) -> Self {
        self.num_phys_pages = pages;
        self
    }

    pub fn with_page_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "page size must be non-zero");
        self.page_size = bytes;
        self
    }

    pub fn with_user_stack_size(mut self, bytes: usize) -> Self {
        self.user_stack_size = bytes;
        self
    }

    pub fn with_max_processes(mut self, count: usize) -> Self {
        self.max_processes = count;
        self
    }

    /// Total bytes of simulated main memory.
    pub fn memory_size(&self) -> usize {
        self.num_phys_pages * self.page_size
    }
}
