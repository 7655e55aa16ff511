// =============================================================================
// SimOS — Simulated Machine
// =============================================================================
//
// The hardware surface the kernel drives:
//
//   - Main memory: one byte array of `num_phys_pages * page_size` bytes,
//     shared by every process. Kernel code touches it through physical
//     addresses; user accesses go through the installed page table.
//   - CPU context: the MIPS register file plus the page table the running
//     process installed. Every kernel thread runs on its own host thread,
//     so the CPU context is per execution context, the same way the
//     interrupt level is.
//   - The instruction interpreter is an external collaborator behind the
//     `Processor` trait.
//
// Simulated memory is little-endian.
//
// =============================================================================

pub mod interrupt;

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::vmm::{ExceptionType, PageTable};
use crate::sync::spinlock::SpinLock;

// ── Register file layout ────────────────────────────────────────

/// Number of general purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// User stack pointer.
pub const STACK_REG: usize = 29;
/// Holds the return address for procedure calls.
pub const RET_ADDR_REG: usize = 31;
/// Double register for multiplication results.
pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter (for branch delay).
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter (for debugging).
pub const PREV_PC_REG: usize = 36;
/// The register target of a delayed load.
pub const LOAD_REG: usize = 37;
/// The value to be loaded on a delayed load.
pub const LOAD_VALUE_REG: usize = 38;
/// The failing virtual address on an exception.
pub const BAD_VADDR_REG: usize = 39;
pub const NUM_TOTAL_REGS: usize = 40;

/// System-call code on entry, return value on exit.
pub const RESULT_REG: usize = 2;
/// First of the four argument registers (4..=7).
pub const ARG_REG_BASE: usize = 4;

// ── CPU context ─────────────────────────────────────────────────

struct CpuContext {
    registers: [i32; NUM_TOTAL_REGS],
    page_table: Option<Arc<SpinLock<PageTable>>>,
}

thread_local! {
    static CPU: RefCell<CpuContext> = const {
        RefCell::new(CpuContext {
            registers: [0; NUM_TOTAL_REGS],
            page_table: None,
        })
    };
}

// ── Machine ─────────────────────────────────────────────────────

/// The simulated hardware.
pub struct Machine {
    main_memory: SpinLock<Box<[u8]>>,
    num_phys_pages: usize,
    page_size: usize,
    halted: AtomicBool,
}

impl Machine {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            main_memory: SpinLock::new(vec![0u8; config.memory_size()].into_boxed_slice()),
            num_phys_pages: config.num_phys_pages,
            page_size: config.page_size,
            halted: AtomicBool::new(false),
        }
    }

    pub fn num_phys_pages(&self) -> usize {
        self.num_phys_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // ── Registers ───────────────────────────────────────────────

    pub fn read_register(&self, index: usize) -> i32 {
        assert!(index < NUM_TOTAL_REGS, "register {} out of range", index);
        CPU.with(|cpu| cpu.borrow().registers[index])
    }

    pub fn write_register(&self, index: usize, value: i32) {
        assert!(index < NUM_TOTAL_REGS, "register {} out of range", index);
        CPU.with(|cpu| cpu.borrow_mut().registers[index] = value);
    }

    /// Step past the trapping instruction: PrevPC ← PC, PC ← PC + 4,
    /// NextPC ← PC + 8.
    pub fn advance_pc(&self) {
        let pc = self.read_register(PC_REG);
        self.write_register(PREV_PC_REG, pc);
        self.write_register(PC_REG, pc.wrapping_add(4));
        self.write_register(NEXT_PC_REG, pc.wrapping_add(8));
    }

    // ── Page table ──────────────────────────────────────────────

    /// Make `table` the translation used for user accesses on this context.
    pub fn install_page_table(&self, table: Arc<SpinLock<PageTable>>) {
        CPU.with(|cpu| cpu.borrow_mut().page_table = Some(table));
    }

    /// Drop the installed table; every user access faults afterwards.
    pub fn uninstall_page_table(&self) {
        CPU.with(|cpu| cpu.borrow_mut().page_table = None);
    }

    /// Length, in pages, of the installed table.
    pub fn page_table_size(&self) -> usize {
        CPU.with(|cpu| {
            cpu.borrow()
                .page_table
                .as_ref()
                .map_or(0, |table| table.lock().len())
        })
    }

    fn installed_table(&self) -> Option<Arc<SpinLock<PageTable>>> {
        CPU.with(|cpu| cpu.borrow().page_table.clone())
    }

    /// Translate a user access of `size` bytes through the installed table.
    ///
    /// On failure the faulting address lands in `BAD_VADDR_REG`.
    pub fn translate(
        &self,
        vaddr: VirtAddr,
        size: usize,
        is_write: bool,
    ) -> Result<PhysAddr, ExceptionType> {
        let result = if !vaddr.is_aligned(size) {
            Err(ExceptionType::AddressError)
        } else {
            match self.installed_table() {
                Some(table) => table.lock().translate(vaddr, is_write, self.num_phys_pages),
                None => Err(ExceptionType::AddressError),
            }
        };

        if let Err(e) = result {
            log::debug!("machine: {} on {} access at {}", e, size, vaddr);
            self.write_register(BAD_VADDR_REG, vaddr.as_usize() as i32);
        }
        result
    }

    // ── User memory ─────────────────────────────────────────────

    /// Read 1, 2 or 4 bytes at a user address.
    pub fn read_mem(&self, vaddr: VirtAddr, size: usize) -> Result<i32, ExceptionType> {
        assert!(matches!(size, 1 | 2 | 4), "read_mem: bad size {}", size);
        let pa = self.translate(vaddr, size, false)?.as_usize();
        let mem = self.main_memory.lock();
        let value = match size {
            1 => mem[pa] as i32,
            2 => u16::from_le_bytes([mem[pa], mem[pa + 1]]) as i32,
            _ => i32::from_le_bytes([mem[pa], mem[pa + 1], mem[pa + 2], mem[pa + 3]]),
        };
        Ok(value)
    }

    /// Write the low 1, 2 or 4 bytes of `value` at a user address.
    pub fn write_mem(&self, vaddr: VirtAddr, size: usize, value: i32) -> Result<(), ExceptionType> {
        assert!(matches!(size, 1 | 2 | 4), "write_mem: bad size {}", size);
        let pa = self.translate(vaddr, size, true)?.as_usize();
        let bytes = value.to_le_bytes();
        self.main_memory.lock()[pa..pa + size].copy_from_slice(&bytes[..size]);
        Ok(())
    }

    // ── Physical memory ─────────────────────────────────────────

    /// Copy `buf.len()` bytes out of main memory starting at `pa`.
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) {
        let start = pa.as_usize();
        buf.copy_from_slice(&self.main_memory.lock()[start..start + buf.len()]);
    }

    /// Copy `data` into main memory starting at `pa`.
    pub fn write_phys(&self, pa: PhysAddr, data: &[u8]) {
        let start = pa.as_usize();
        self.main_memory.lock()[start..start + data.len()].copy_from_slice(data);
    }

    /// Fill a whole frame with zeroes.
    pub fn zero_frame(&self, frame: usize) {
        let start = frame * self.page_size;
        self.main_memory.lock()[start..start + self.page_size].fill(0);
    }

    /// Copy frame `src` over frame `dst`.
    pub fn copy_frame(&self, src: usize, dst: usize) {
        let page = self.page_size;
        self.main_memory
            .lock()
            .copy_within(src * page..(src + 1) * page, dst * page);
    }

    // ── Power ───────────────────────────────────────────────────

    /// Request that the simulation stop.
    pub fn halt(&self) {
        log::info!("machine halting");
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("num_phys_pages", &self.num_phys_pages)
            .field("page_size", &self.page_size)
            .field("halted", &self.is_halted())
            .finish()
    }
}

// ── Processor ───────────────────────────────────────────────────

/// The instruction interpreter.
///
/// `run` executes user instructions on the calling context with the
/// current process's table installed, trapping into the kernel (for
/// instance through [`handle_syscall`](crate::syscall::handle_syscall)) as
/// the program requires. It returns when the program stops running on this
/// context.
pub trait Processor: Send + Sync {
    fn run(&self, kernel: &Arc<Kernel>);
}

impl<F> Processor for F
where
    F: Fn(&Arc<Kernel>) + Send + Sync,
{
    fn run(&self, kernel: &Arc<Kernel>) {
        self(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmm::{EntryFlags, TranslationEntry};

    fn machine() -> Machine {
        Machine::new(&KernelConfig::default().with_phys_pages(8))
    }

    fn table(frames: &[usize]) -> Arc<SpinLock<PageTable>> {
        let mut pt = PageTable::new(128);
        for (vpn, &frame) in frames.iter().enumerate() {
            pt.push(TranslationEntry::new(vpn, frame));
        }
        Arc::new(SpinLock::new(pt))
    }

    #[test]
    fn advance_pc_shifts_the_window() {
        let m = machine();
        m.write_register(PC_REG, 100);
        m.advance_pc();
        assert_eq!(m.read_register(PREV_PC_REG), 100);
        assert_eq!(m.read_register(PC_REG), 104);
        assert_eq!(m.read_register(NEXT_PC_REG), 108);
    }

    #[test]
    fn user_access_goes_through_the_table() {
        let m = machine();
        m.install_page_table(table(&[3, 5]));
        assert_eq!(m.page_table_size(), 2);

        m.write_mem(VirtAddr::new(128 + 8), 4, 0x1234_5678).unwrap();
        let mut raw = [0u8; 4];
        m.read_phys(PhysAddr::from_frame(5, 8, 128), &mut raw);
        assert_eq!(raw, [0x78, 0x56, 0x34, 0x12]);

        assert_eq!(m.read_mem(VirtAddr::new(128 + 8), 4), Ok(0x1234_5678));
        assert_eq!(m.read_mem(VirtAddr::new(128 + 9), 1), Ok(0x56));
        assert_eq!(m.read_mem(VirtAddr::new(128 + 10), 2), Ok(0x1234));
    }

    #[test]
    fn faults_record_the_bad_address() {
        let m = machine();
        m.install_page_table(table(&[0]));
        assert_eq!(m.read_mem(VirtAddr::new(2), 4), Err(ExceptionType::AddressError));
        assert_eq!(m.read_register(BAD_VADDR_REG), 2);
        assert_eq!(m.read_mem(VirtAddr::new(128), 1), Err(ExceptionType::AddressError));
        assert_eq!(m.read_register(BAD_VADDR_REG), 128);
    }

    #[test]
    fn read_only_pages_reject_writes() {
        let m = machine();
        let pt = table(&[1]);
        pt.lock().entry_mut(0).unwrap().flags.insert(EntryFlags::READ_ONLY);
        m.install_page_table(pt);
        assert_eq!(m.write_mem(VirtAddr::new(0), 1, 7), Err(ExceptionType::ReadOnlyError));
        assert_eq!(m.read_mem(VirtAddr::new(0), 1), Ok(0));
    }

    #[test]
    fn no_table_means_every_access_faults() {
        let m = machine();
        m.uninstall_page_table();
        assert_eq!(m.page_table_size(), 0);
        assert_eq!(m.read_mem(VirtAddr::new(0), 1), Err(ExceptionType::AddressError));
    }

    #[test]
    fn frame_helpers() {
        let m = machine();
        m.write_phys(PhysAddr::from_frame(2, 0, 128), &[9; 128]);
        m.copy_frame(2, 4);
        let mut buf = [0u8; 128];
        m.read_phys(PhysAddr::from_frame(4, 0, 128), &mut buf);
        assert!(buf.iter().all(|&b| b == 9));
        m.zero_frame(4);
        m.read_phys(PhysAddr::from_frame(4, 0, 128), &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn halt_is_sticky() {
        let m = machine();
        assert!(!m.is_halted());
        m.halt();
        assert!(m.is_halted());
    }
}
