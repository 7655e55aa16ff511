// =============================================================================
// SimOS — Address Spaces
// =============================================================================
//
// An address space is one process's view of memory: a linear page table
// over frames it owns exclusively, plus the process record it registered
// when it was created.
//
// LAYOUT (after `load`):
//
//   0 ─────────────────────────────────────────────── size
//   │ code │ init data │ read-only data │ uninit data │ ... │ user stack │
//
//   Size is the sum of the segments plus the user stack, rounded up to whole
//   pages. Every frame is zeroed before the segments are copied in.
//
// FORK copies eagerly: the child gets its own frames holding the same bytes
// and the same entry flags. Nothing is shared afterwards.
//
// Frames return to the allocator when the address space is dropped.
//
// =============================================================================

use std::sync::Arc;

use crate::config::STACK_SAFETY_MARGIN;
use crate::fs::noff::{NOFF_HEADER_SIZE, NoffHeader, Segment};
use crate::fs::OpenFile;
use crate::kernel::Kernel;
use crate::machine::{NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::memory::address::{PhysAddr, VirtAddr, pages_for};
use crate::memory::vmm::{ExceptionType, PageTable, TranslationEntry};
use crate::sync::spinlock::SpinLock;
use crate::task::process::Proc;
use crate::task::thread::KThread;
use crate::userprog::LoadError;

/// One process's address space.
pub struct AddrSpace {
    kernel: Arc<Kernel>,
    page_table: Arc<SpinLock<PageTable>>,
    proc: Arc<Proc>,
}

impl AddrSpace {
    /// Create an empty address space and register a process for it.
    ///
    /// The new process runs on the current thread until somebody hands it
    /// to another one.
    pub fn new(kernel: &Arc<Kernel>) -> Self {
        let proc = kernel.procs().register(&KThread::current());
        Self {
            kernel: Arc::clone(kernel),
            page_table: Arc::new(SpinLock::new(PageTable::new(kernel.config().page_size))),
            proc,
        }
    }

    pub fn pid(&self) -> usize {
        self.proc.pid()
    }

    pub fn proc(&self) -> &Arc<Proc> {
        &self.proc
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn page_table(&self) -> &Arc<SpinLock<PageTable>> {
        &self.page_table
    }

    pub fn num_pages(&self) -> usize {
        self.page_table.lock().len()
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.page_table.lock().size()
    }

    // ── Loading ─────────────────────────────────────────────────

    /// Load the NOFF image `file_name`, replacing whatever was mapped.
    ///
    /// The image is validated before anything is released, so a missing or
    /// malformed file leaves the current contents intact.
    pub fn load(&mut self, file_name: &str) -> Result<(), LoadError> {
        let file = self
            .kernel
            .file_system()
            .open(file_name)
            .ok_or_else(|| LoadError::NotFound(String::from(file_name)))?;

        let mut raw = [0u8; NOFF_HEADER_SIZE];
        if file.read_at(&mut raw, 0) < NOFF_HEADER_SIZE {
            return Err(LoadError::BadHeader);
        }
        let header = NoffHeader::parse(&raw)?;

        let config = self.kernel.config();
        let page_size = config.page_size;
        let num_pages = pages_for(header.image_size() + config.user_stack_size, page_size);
        let size = num_pages * page_size;
        log::debug!("loading '{}': {} pages, {} bytes", file_name, num_pages, size);

        for (name, seg) in header.loadable_segments() {
            if seg.is_empty() {
                continue;
            }
            let in_file = seg.in_file_addr as usize + seg.size as usize;
            let in_space = seg.virtual_addr as usize + seg.size as usize;
            if in_file > file.length() || in_space > size {
                log::warn!("'{}': {} segment {:?} out of bounds", file_name, name, seg);
                return Err(LoadError::BadHeader);
            }
        }

        let capacity = self.kernel.memory().total_frames();
        if num_pages > capacity {
            log::warn!("'{}' needs {} pages, only {} exist", file_name, num_pages, capacity);
            return Err(LoadError::TooLarge { pages: num_pages, capacity });
        }

        self.release_frames();

        let memory = self.kernel.memory();
        if !memory.reserve_pages(num_pages) {
            return Err(LoadError::OutOfMemory { pages: num_pages });
        }

        {
            let machine = self.kernel.machine();
            let mut table = self.page_table.lock();
            for vpn in 0..num_pages {
                let frame = memory.get_page();
                machine.zero_frame(frame);
                log::trace!("[page table] vpn {} -> frame {}", vpn, frame);
                table.push(TranslationEntry::new(vpn, frame));
            }
        }

        for (name, seg) in header.loadable_segments() {
            if seg.is_empty() {
                continue;
            }
            log::debug!(
                "initializing {} segment at {:#x}, size {}",
                name,
                seg.virtual_addr,
                seg.size
            );
            self.copy_segment(file.as_ref(), seg)
                .map_err(|_| LoadError::BadHeader)?;
        }

        Ok(())
    }

    /// Copy a segment's bytes from the image, a page-sized chunk at a time.
    fn copy_segment(&self, file: &dyn OpenFile, seg: Segment) -> Result<(), ExceptionType> {
        let page_size = self.kernel.config().page_size;
        let mut chunk = vec![0u8; page_size];
        let mut vaddr = seg.virtual_addr as usize;
        let mut in_file = seg.in_file_addr as usize;
        let mut remaining = seg.size as usize;

        while remaining > 0 {
            let n = remaining.min(page_size);
            file.read_at(&mut chunk[..n], in_file);
            self.user_write(VirtAddr::new(vaddr), &chunk[..n])?;
            vaddr += n;
            in_file += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Return every mapped frame to the allocator.
    fn release_frames(&self) {
        let frames = self.page_table.lock().take_frames();
        let memory = self.kernel.memory();
        for frame in frames {
            memory.clear_page(frame);
        }
    }

    // ── Translation ─────────────────────────────────────────────

    /// Translate a user address for an access of the given kind.
    pub fn translate(&self, vaddr: VirtAddr, is_write: bool) -> Result<PhysAddr, ExceptionType> {
        self.page_table
            .lock()
            .translate(vaddr, is_write, self.kernel.machine().num_phys_pages())
    }

    /// Copy `buf.len()` bytes out of user memory starting at `vaddr`.
    pub fn user_read(&self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), ExceptionType> {
        let machine = self.kernel.machine();
        let page_size = self.kernel.config().page_size;
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr + done;
            let n = (buf.len() - done).min(page_size - va.page_offset(page_size));
            let pa = self.translate(va, false)?;
            machine.read_phys(pa, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `data` into user memory starting at `vaddr`.
    pub fn user_write(&self, vaddr: VirtAddr, data: &[u8]) -> Result<(), ExceptionType> {
        let machine = self.kernel.machine();
        let page_size = self.kernel.config().page_size;
        let mut done = 0;
        while done < data.len() {
            let va = vaddr + done;
            let n = (data.len() - done).min(page_size - va.page_offset(page_size));
            let pa = self.translate(va, true)?;
            machine.write_phys(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    // ── Fork ────────────────────────────────────────────────────

    /// Duplicate this address space into a new child process.
    ///
    /// Frames are reserved before the child is registered, so running out
    /// of memory leaves no half-made process behind.
    pub fn fork(&self) -> Result<AddrSpace, LoadError> {
        let parent = self.page_table.lock().clone();
        let num_pages = parent.len();

        let memory = self.kernel.memory();
        if !memory.reserve_pages(num_pages) {
            log::warn!("fork of process {}: cannot reserve {} pages", self.pid(), num_pages);
            return Err(LoadError::OutOfMemory { pages: num_pages });
        }

        let child = AddrSpace::new(&self.kernel);
        child.proc.set_ppid(self.pid());
        log::debug!(
            "forking address space of process {} into {}: {} pages",
            self.pid(),
            child.pid(),
            num_pages
        );

        {
            let machine = self.kernel.machine();
            let mut table = child.page_table.lock();
            for entry in parent.iter() {
                let frame = memory.get_page();
                log::trace!("[page table] vpn {} -> frame {}", entry.virtual_page, frame);
                machine.copy_frame(entry.physical_page, frame);
                table.push(TranslationEntry {
                    virtual_page: entry.virtual_page,
                    physical_page: frame,
                    flags: entry.flags,
                });
            }
        }

        Ok(child)
    }

    // ── Machine state ───────────────────────────────────────────

    /// Set the initial register values for a fresh start of the program.
    pub fn init_registers(&self) {
        let machine = self.kernel.machine();
        for reg in 0..NUM_TOTAL_REGS {
            machine.write_register(reg, 0);
        }

        // Execution starts at virtual address 0.
        machine.write_register(PC_REG, 0);
        machine.write_register(NEXT_PC_REG, 4);

        let sp = self.size().saturating_sub(STACK_SAFETY_MARGIN);
        machine.write_register(STACK_REG, sp as i32);
        log::debug!("initializing stack pointer: {}", sp);
    }

    /// Save machine state specific to this space on a switch away.
    ///
    /// Translation state lives in the page table itself, so there is
    /// nothing to save.
    pub fn save_state(&self) {}

    /// Install this space's page table into the machine.
    pub fn restore_state(&self) {
        self.kernel
            .machine()
            .install_page_table(Arc::clone(&self.page_table));
    }

    /// Run the loaded program on the current thread.
    ///
    /// The space becomes the current thread's address space, registers are
    /// reset to the entry point and the processor takes over. Returns when
    /// the processor does.
    pub fn execute(self) {
        let kernel = Arc::clone(&self.kernel);
        let thread = KThread::current();

        self.proc.set_thread(&thread);
        self.init_registers();
        self.restore_state();

        // Dropping a replaced space frees its frames; do it outside the
        // thread's slot guard.
        let old = thread.set_space(self);
        drop(old);

        kernel.run_user();
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        log::trace!("releasing address space of process {}", self.pid());
        self.release_frames();
    }
}

impl core::fmt::Debug for AddrSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddrSpace")
            .field("pid", &self.pid())
            .field("num_pages", &self.num_pages())
            .finish()
    }
}
