//! The kernel context.
//!
//! One [`Kernel`] owns the simulated machine and every kernel-wide table.
//! Nothing is global: components that need the kernel are handed an
//! `Arc<Kernel>`.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::KernelConfig;
use crate::fs::FileSystem;
use crate::machine::{Machine, Processor};
use crate::memory::pmm::MemoryManager;
use crate::task::process::ProcessManager;
use crate::task::thread::KThread;
use crate::userprog::{AddrSpace, LoadError};

pub struct Kernel {
    config: KernelConfig,
    machine: Machine,
    memory: MemoryManager,
    procs: ProcessManager,
    file_system: Box<dyn FileSystem>,
    processor: Arc<dyn Processor>,
}

impl Kernel {
    /// Boot a kernel over `file_system`, with `processor` interpreting user
    /// programs.
    pub fn new<F, P>(config: KernelConfig, file_system: F, processor: P) -> Arc<Self>
    where
        F: FileSystem + 'static,
        P: Processor + 'static,
    {
        log::info!(
            "booting: {} frames of {} bytes, {} processes max",
            config.num_phys_pages,
            config.page_size,
            config.max_processes
        );
        Arc::new(Self {
            machine: Machine::new(&config),
            memory: MemoryManager::new(config.num_phys_pages),
            procs: ProcessManager::new(config.max_processes),
            file_system: Box::new(file_system),
            processor: Arc::new(processor),
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn procs(&self) -> &ProcessManager {
        &self.procs
    }

    pub fn file_system(&self) -> &dyn FileSystem {
        self.file_system.as_ref()
    }

    /// Hand the calling context to the processor until the program on it
    /// stops.
    pub fn run_user(self: &Arc<Self>) {
        let processor = Arc::clone(&self.processor);
        processor.run(self);
    }

    /// Load `file_name` as a new process and start it on its own kernel
    /// thread.
    ///
    /// Load errors are reported here, before any thread exists; the pid the
    /// attempt took is released again.
    pub fn start_process(self: &Arc<Self>, file_name: &str) -> Result<(usize, JoinHandle<()>), LoadError> {
        let mut space = AddrSpace::new(self);
        let pid = space.pid();
        if let Err(e) = space.load(file_name) {
            log::warn!("cannot start '{}': {}", file_name, e);
            drop(space);
            self.procs.clear_pid(pid);
            return Err(e);
        }

        let thread = KThread::new(file_name);
        let handle = thread.fork(move || space.execute());
        log::info!("started '{}' as process {}", file_name, pid);
        Ok((pid, handle))
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("machine", &self.machine)
            .field("memory", &self.memory)
            .finish()
    }
}
