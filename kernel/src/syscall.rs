//! System-call layer.
//!
//! The processor traps here with the call code in register 2 and up to
//! four arguments in registers 4..=7. [`handle_syscall`] dispatches, writes
//! the result back into register 2 and steps the PC past the trapping
//! instruction.
//!
//! A successful `Exec`/`ExecV` replaces the running image in place: the
//! registers already point at the new program's entry, so the PC is left
//! alone. `Exit` and `Halt` end the program on the calling context, which
//! the processor learns from the returned [`Flow`].

use std::sync::Arc;

use crate::config::MAX_ARG_LEN;
use crate::kernel::Kernel;
use crate::machine::{ARG_REG_BASE, Machine, NEXT_PC_REG, PC_REG, PREV_PC_REG, RESULT_REG};
use crate::memory::address::VirtAddr;
use crate::memory::vmm::ExceptionType;
use crate::task::thread::KThread;
use crate::userprog::LoadError;

// ── Call codes ──────────────────────────────────────────────────

pub const SC_HALT: i32 = 0;
pub const SC_EXIT: i32 = 1;
pub const SC_EXEC: i32 = 2;
pub const SC_JOIN: i32 = 3;
pub const SC_FORK: i32 = 9;
pub const SC_EXECV: i32 = 13;
pub const SC_ADD: i32 = 42;

/// Out of memory.
pub const ENOMEM: i32 = 12;

/// What `Exec`/`ExecV` leave in register 2 when they fail.
pub const EXEC_FAILED: i32 = 1;

/// Size of a user pointer.
const PTR_SIZE: usize = 4;

/// Gap left below the argument block and above the initial stack pointer.
const ARG_BLOCK_MARGIN: usize = 16;

/// What the processor does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep executing at the PC now in the register file.
    Continue,
    /// The program on this context is finished.
    Stop,
}

/// Why an `Exec`/`ExecV` failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// An argument pointer faulted.
    BadAddress(ExceptionType),
    /// The arguments do not fit in the new program's stack.
    ArgsTooLarge,
    /// The calling thread has no address space.
    NoAddressSpace,
    /// `argc` is not positive.
    BadArgCount(i32),
    Load(LoadError),
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::BadAddress(e) => write!(f, "bad argument address: {}", e),
            ExecError::ArgsTooLarge => write!(f, "arguments exceed the user stack"),
            ExecError::NoAddressSpace => write!(f, "caller has no address space"),
            ExecError::BadArgCount(n) => write!(f, "bad argument count {}", n),
            ExecError::Load(e) => write!(f, "{}", e),
        }
    }
}

impl From<ExceptionType> for ExecError {
    fn from(e: ExceptionType) -> Self {
        ExecError::BadAddress(e)
    }
}

impl From<LoadError> for ExecError {
    fn from(e: LoadError) -> Self {
        ExecError::Load(e)
    }
}

// ── Dispatch ────────────────────────────────────────────────────

/// Service the system call the current context trapped with.
pub fn handle_syscall(kernel: &Arc<Kernel>) -> Flow {
    let machine = kernel.machine();
    let code = machine.read_register(RESULT_REG);
    let arg = |i: usize| machine.read_register(ARG_REG_BASE + i);
    log::trace!(
        "syscall {} ({}, {}, {}, {})",
        code,
        arg(0),
        arg(1),
        arg(2),
        arg(3)
    );

    let result = match code {
        SC_HALT => {
            sys_halt(kernel);
            return Flow::Stop;
        }
        SC_EXIT => {
            sys_exit(kernel, arg(0));
            return Flow::Stop;
        }
        SC_ADD => sys_add(arg(0), arg(1)),
        SC_FORK => sys_fork(kernel),
        SC_JOIN => sys_join(kernel, arg(0)),
        SC_EXEC => match sys_exec(kernel, arg(0)) {
            Ok(()) => return Flow::Continue,
            Err(e) => {
                log::warn!("exec failed: {}", e);
                EXEC_FAILED
            }
        },
        SC_EXECV => match sys_execv(kernel, arg(0), arg(1)) {
            Ok(()) => return Flow::Continue,
            Err(e) => {
                log::warn!("execv failed: {}", e);
                EXEC_FAILED
            }
        },
        other => {
            log::warn!("unexpected system call {}", other);
            -1
        }
    };

    log::trace!("syscall {} returned {}", code, result);
    machine.write_register(RESULT_REG, result);
    machine.advance_pc();
    Flow::Continue
}

// ── String marshaling ───────────────────────────────────────────

/// Read a NUL-terminated string from user memory, looking at no more than
/// `max` bytes. A string with no terminator in range is cut at `max`.
///
/// The bytes come back verbatim, without the terminator.
pub fn read_str(machine: &Machine, vaddr: VirtAddr, max: usize) -> Result<Vec<u8>, ExceptionType> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = machine.read_mem(vaddr + i, 1)? as u8;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    if bytes.len() == max {
        log::warn!("read_str: no terminator within {} bytes at {}", max, vaddr);
    }
    Ok(bytes)
}

/// Write `s` plus a NUL terminator to user memory, at most `max` bytes in
/// all. Returns the number of bytes written, terminator included.
pub fn write_str(machine: &Machine, vaddr: VirtAddr, s: &[u8], max: usize) -> Result<usize, ExceptionType> {
    if max == 0 {
        return Ok(0);
    }
    let body = &s[..s.len().min(max - 1)];
    for (i, &b) in body.iter().enumerate() {
        machine.write_mem(vaddr + i, 1, b as i32)?;
    }
    machine.write_mem(vaddr + body.len(), 1, 0)?;
    Ok(body.len() + 1)
}

/// A program name read from user memory. Names that are not UTF-8 cannot
/// exist in the file system.
fn program_name(bytes: &[u8]) -> Result<&str, ExecError> {
    core::str::from_utf8(bytes)
        .map_err(|_| ExecError::Load(LoadError::NotFound(String::from_utf8_lossy(bytes).into_owned())))
}

// ── Calls ───────────────────────────────────────────────────────

pub fn sys_halt(kernel: &Arc<Kernel>) {
    log::info!("halt requested by {:?}", KThread::current().pid());
    kernel.machine().halt();
}

pub fn sys_add(op1: i32, op2: i32) -> i32 {
    op1.wrapping_add(op2)
}

/// Duplicate the calling process. The parent gets the child's pid, the
/// child resumes after the trap with 0 in register 2.
pub fn sys_fork(kernel: &Arc<Kernel>) -> i32 {
    let machine = kernel.machine();
    let parent = KThread::current();

    let forked = match parent.space().as_ref() {
        Some(space) => space.fork(),
        None => {
            log::warn!("fork from thread '{}' with no address space", parent.name());
            return -ENOMEM;
        }
    };
    let space = match forked {
        Ok(space) => space,
        Err(e) => {
            log::warn!("fork failed: {}", e);
            return -ENOMEM;
        }
    };

    let pid = space.pid();
    let child = KThread::new(&format!("child-{}", pid));
    space.proc().set_thread(&child);

    child.save_user_state(machine);
    let pc = machine.read_register(PC_REG);
    child.write_user_register(PREV_PC_REG, pc);
    child.write_user_register(PC_REG, pc.wrapping_add(4));
    child.write_user_register(NEXT_PC_REG, pc.wrapping_add(4));
    child.write_user_register(RESULT_REG, 0);
    drop(child.set_space(space));

    let kernel = Arc::clone(kernel);
    child.fork(move || {
        let me = KThread::current();
        me.restore_user_state(kernel.machine());
        if let Some(space) = me.space().as_ref() {
            space.restore_state();
        }
        kernel.run_user();
    });

    log::debug!("forked process {}", pid);
    parent.yield_cpu();
    pid as i32
}

/// Replace the caller's image with the program named at `name_addr`.
pub fn sys_exec(kernel: &Arc<Kernel>, name_addr: i32) -> Result<(), ExecError> {
    let name = read_str(kernel.machine(), VirtAddr::from_register(name_addr), MAX_ARG_LEN)?;
    let name = program_name(&name)?;
    log::debug!("exec '{}'", name);

    let thread = KThread::current();
    let mut space = thread.take_space().ok_or(ExecError::NoAddressSpace)?;
    let loaded = space.load(name);
    if loaded.is_ok() {
        space.init_registers();
        space.restore_state();
    }
    drop(thread.set_space(space));

    loaded.map_err(ExecError::from)
}

/// Like [`sys_exec`], passing `argc` strings from the user array at
/// `argv_addr`. `argv[0]` names the program.
///
/// The argument strings and a pointer array to them are laid out at the
/// bottom of the new program's stack region; register 4 gets `argc` and
/// register 5 the array's address.
pub fn sys_execv(kernel: &Arc<Kernel>, argc: i32, argv_addr: i32) -> Result<(), ExecError> {
    let machine = kernel.machine();
    let argv_addr = VirtAddr::from_register(argv_addr);
    if argc <= 0 {
        return Err(ExecError::BadArgCount(argc));
    }
    let argc = argc as usize;

    // The pointer array alone must fit in the stack block.
    let user_stack = kernel.config().user_stack_size;
    let max_argc = user_stack.saturating_sub(2 * ARG_BLOCK_MARGIN) / PTR_SIZE;
    if argc > max_argc {
        log::warn!("execv: argc {} exceeds {}", argc, max_argc);
        return Err(ExecError::ArgsTooLarge);
    }

    let mut args = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr = machine.read_mem(argv_addr + i * PTR_SIZE, PTR_SIZE)?;
        let arg = read_str(machine, VirtAddr::from_register(ptr), MAX_ARG_LEN)?;
        log::debug!("execv arg {}: {:?}", i, String::from_utf8_lossy(&arg));
        args.push(arg);
    }
    let name = program_name(&args[0])?;

    let block: usize = argc * PTR_SIZE
        + args
            .iter()
            .map(|a| a.len().min(MAX_ARG_LEN - 1) + 1)
            .sum::<usize>();
    if block + 2 * ARG_BLOCK_MARGIN > user_stack {
        return Err(ExecError::ArgsTooLarge);
    }

    let thread = KThread::current();
    let mut space = thread.take_space().ok_or(ExecError::NoAddressSpace)?;
    let loaded = space.load(name);
    if loaded.is_ok() {
        space.init_registers();
        space.restore_state();
    }
    let size = space.size();
    drop(thread.set_space(space));
    loaded?;
    let stack_bottom = size - user_stack + ARG_BLOCK_MARGIN;
    log::debug!("execv: program '{}' loaded", name);

    let mut head = stack_bottom + argc * PTR_SIZE;
    for (i, arg) in args.iter().enumerate() {
        machine.write_mem(VirtAddr::new(stack_bottom + i * PTR_SIZE), PTR_SIZE, head as i32)?;
        head += write_str(machine, VirtAddr::new(head), arg, MAX_ARG_LEN)?;
    }

    machine.write_register(ARG_REG_BASE, argc as i32);
    machine.write_register(ARG_REG_BASE + 1, stack_bottom as i32);
    Ok(())
}

/// Wait for `pid` and return its exit value, or -1 for a bad pid.
pub fn sys_join(kernel: &Arc<Kernel>, pid: i32) -> i32 {
    kernel.procs().join(pid).unwrap_or(-1)
}

/// Record the caller's exit value, wake a joiner and release the caller's
/// memory.
pub fn sys_exit(kernel: &Arc<Kernel>, code: i32) {
    let thread = KThread::current();
    let Some(space) = thread.take_space() else {
        log::warn!("exit from thread '{}' with no address space", thread.name());
        return;
    };

    log::debug!("process {} exiting with {}", space.pid(), code);
    kernel.procs().exit(space.pid(), code);
    kernel.machine().uninstall_page_table();
    drop(space);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::fs::RamDisk;
    use crate::fs::noff::{NOFF_HEADER_SIZE, NoffHeader, Segment};
    use crate::sync::spinlock::SpinLock;
    use crate::userprog::AddrSpace;

    fn image(code_len: usize) -> Vec<u8> {
        let header = NoffHeader::new(
            Segment::new(0, NOFF_HEADER_SIZE as u32, code_len as u32),
            Segment::default(),
            Segment::default(),
            Segment::default(),
        );
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend(std::iter::repeat_n(0xAAu8, code_len));
        bytes
    }

    /// A kernel whose processor does nothing, with the calling thread
    /// running a loaded copy of "prog".
    fn running_kernel() -> Arc<Kernel> {
        let disk = RamDisk::new()
            .with_file("prog", image(64))
            .with_file("other", image(300));
        let k = Kernel::new(KernelConfig::default().with_phys_pages(64), disk, |_: &Arc<Kernel>| {});
        let mut space = AddrSpace::new(&k);
        space.load("prog").unwrap();
        space.init_registers();
        space.restore_state();
        drop(KThread::current().set_space(space));
        k
    }

    fn trap(k: &Arc<Kernel>, code: i32, args: &[i32]) -> Flow {
        let m = k.machine();
        m.write_register(RESULT_REG, code);
        for (i, &a) in args.iter().enumerate() {
            m.write_register(ARG_REG_BASE + i, a);
        }
        handle_syscall(k)
    }

    #[test]
    fn add_writes_result_and_advances_pc() {
        let k = running_kernel();
        let m = k.machine();
        m.write_register(PC_REG, 40);
        assert_eq!(trap(&k, SC_ADD, &[2, 3]), Flow::Continue);
        assert_eq!(m.read_register(RESULT_REG), 5);
        assert_eq!(m.read_register(PREV_PC_REG), 40);
        assert_eq!(m.read_register(PC_REG), 44);
        assert_eq!(m.read_register(NEXT_PC_REG), 48);
        assert_eq!(sys_add(i32::MAX, 1), i32::MIN);
    }

    #[test]
    fn strings_round_trip_through_user_memory() {
        let k = running_kernel();
        let m = k.machine();
        assert_eq!(write_str(m, VirtAddr::new(100), b"hello", MAX_ARG_LEN), Ok(6));
        assert_eq!(read_str(m, VirtAddr::new(100), MAX_ARG_LEN).unwrap(), b"hello");

        // Truncated to the bound, terminator included.
        assert_eq!(write_str(m, VirtAddr::new(100), b"abcdef", 4), Ok(4));
        assert_eq!(read_str(m, VirtAddr::new(100), MAX_ARG_LEN).unwrap(), b"abc");
        assert_eq!(read_str(m, VirtAddr::new(100), 2).unwrap(), b"ab");

        assert!(read_str(m, VirtAddr::from_register(-8), 4).is_err());
    }

    #[test]
    fn join_of_bad_pid_returns_minus_one() {
        let k = running_kernel();
        assert_eq!(trap(&k, SC_JOIN, &[-3]), Flow::Continue);
        assert_eq!(k.machine().read_register(RESULT_REG), -1);
        assert_eq!(trap(&k, SC_JOIN, &[150]), Flow::Continue);
        assert_eq!(k.machine().read_register(RESULT_REG), -1);
    }

    #[test]
    fn failed_exec_returns_one_and_keeps_running() {
        let k = running_kernel();
        let m = k.machine();
        write_str(m, VirtAddr::new(100), b"missing", MAX_ARG_LEN).unwrap();
        m.write_register(PC_REG, 8);
        assert_eq!(trap(&k, SC_EXEC, &[100]), Flow::Continue);
        assert_eq!(m.read_register(RESULT_REG), EXEC_FAILED);
        assert_eq!(m.read_register(PC_REG), 12);
        // The old image is intact.
        assert_eq!(m.read_mem(VirtAddr::new(0), 1), Ok(0xAA));
    }

    #[test]
    fn exec_replaces_the_image_in_place() {
        let k = running_kernel();
        let m = k.machine();
        write_str(m, VirtAddr::new(100), b"other", MAX_ARG_LEN).unwrap();
        m.write_register(PC_REG, 8);
        assert_eq!(trap(&k, SC_EXEC, &[100]), Flow::Continue);

        let space_size = KThread::current().space().as_ref().unwrap().size();
        // 300 + 1024 bytes → 11 pages.
        assert_eq!(space_size, 11 * 128);
        assert_eq!(m.page_table_size(), 11);
        assert_eq!(m.read_register(PC_REG), 0);
        assert_eq!(m.read_register(crate::machine::STACK_REG), (space_size - 16) as i32);
    }

    #[test]
    fn execv_lays_out_arguments() {
        let k = running_kernel();
        let m = k.machine();
        // argv array at 200, strings at 240 and 250.
        write_str(m, VirtAddr::new(240), b"other", MAX_ARG_LEN).unwrap();
        write_str(m, VirtAddr::new(250), b"-v", MAX_ARG_LEN).unwrap();
        m.write_mem(VirtAddr::new(200), 4, 240).unwrap();
        m.write_mem(VirtAddr::new(204), 4, 250).unwrap();

        assert_eq!(trap(&k, SC_EXECV, &[2, 200]), Flow::Continue);
        let size = KThread::current().space().as_ref().unwrap().size();
        let bottom = size - 1024 + 16;
        assert_eq!(m.read_register(4), 2);
        assert_eq!(m.read_register(5), bottom as i32);

        let p0 = m.read_mem(VirtAddr::new(bottom), 4).unwrap();
        let p1 = m.read_mem(VirtAddr::new(bottom + 4), 4).unwrap();
        assert_eq!(p0 as usize, bottom + 8);
        assert_eq!(p1 as usize, bottom + 8 + 6);
        assert_eq!(read_str(m, VirtAddr::from_register(p0), MAX_ARG_LEN).unwrap(), b"other");
        assert_eq!(read_str(m, VirtAddr::from_register(p1), MAX_ARG_LEN).unwrap(), b"-v");
    }

    #[test]
    fn execv_rejects_an_oversized_argc_without_allocating() {
        let k = running_kernel();
        let m = k.machine();
        m.write_register(PC_REG, 8);
        assert_eq!(trap(&k, SC_EXECV, &[i32::MAX, 200]), Flow::Continue);
        assert_eq!(m.read_register(RESULT_REG), EXEC_FAILED);
        assert_eq!(m.read_register(PC_REG), 12);
        assert_eq!(sys_execv(&k, i32::MAX, 200), Err(ExecError::ArgsTooLarge));
        // One past the most pointers the stack block holds.
        assert_eq!(sys_execv(&k, (1024 - 32) / 4 + 1, 200), Err(ExecError::ArgsTooLarge));
        assert_eq!(m.read_mem(VirtAddr::new(0), 1), Ok(0xAA));
    }

    #[test]
    fn execv_copies_argument_bytes_verbatim() {
        let k = running_kernel();
        let m = k.machine();
        write_str(m, VirtAddr::new(240), b"other", MAX_ARG_LEN).unwrap();
        write_str(m, VirtAddr::new(250), &[0xff, 0x41], MAX_ARG_LEN).unwrap();
        m.write_mem(VirtAddr::new(200), 4, 240).unwrap();
        m.write_mem(VirtAddr::new(204), 4, 250).unwrap();

        assert_eq!(trap(&k, SC_EXECV, &[2, 200]), Flow::Continue);
        let argv = VirtAddr::from_register(m.read_register(5));
        let p1 = m.read_mem(argv + 4, 4).unwrap();
        assert_eq!(read_str(m, VirtAddr::from_register(p1), MAX_ARG_LEN).unwrap(), [0xffu8, 0x41]);
        assert_eq!(m.read_mem(VirtAddr::from_register(p1) + 2, 1), Ok(0));
    }

    #[test]
    fn exec_of_a_non_utf8_name_is_not_found() {
        let k = running_kernel();
        let m = k.machine();
        write_str(m, VirtAddr::new(100), &[0x6f, 0xff], MAX_ARG_LEN).unwrap();
        assert!(matches!(
            sys_exec(&k, 100),
            Err(ExecError::Load(LoadError::NotFound(_)))
        ));
        assert_eq!(m.read_mem(VirtAddr::new(0), 1), Ok(0xAA));
    }

    #[test]
    fn exit_releases_memory_and_records_value() {
        let k = running_kernel();
        let pid = KThread::current().pid().unwrap();
        let free = k.memory().free_page_count();
        assert_eq!(trap(&k, SC_EXIT, &[3]), Flow::Stop);
        assert!(KThread::current().pid().is_none());
        assert!(k.memory().free_page_count() > free);
        assert_eq!(k.procs().join(pid as i32), Some(3));
    }

    #[test]
    fn halt_stops_the_machine() {
        let k = running_kernel();
        assert_eq!(trap(&k, SC_HALT, &[]), Flow::Stop);
        assert!(k.machine().is_halted());
    }

    #[test]
    fn unknown_call_returns_minus_one() {
        let k = running_kernel();
        assert_eq!(trap(&k, 77, &[]), Flow::Continue);
        assert_eq!(k.machine().read_register(RESULT_REG), -1);
    }

    #[test]
    fn forked_child_resumes_after_the_trap_with_zero() {
        let seen: Arc<SpinLock<Vec<(usize, i32, i32)>>> = Arc::new(SpinLock::new(Vec::new()));
        let record = Arc::clone(&seen);
        let processor = move |k: &Arc<Kernel>| {
            let m = k.machine();
            let pid = KThread::current().pid().unwrap();
            record.lock().push((pid, m.read_register(RESULT_REG), m.read_register(PC_REG)));
            m.write_register(RESULT_REG, SC_EXIT);
            m.write_register(ARG_REG_BASE, 7);
            assert_eq!(handle_syscall(k), Flow::Stop);
        };

        let disk = RamDisk::new().with_file("prog", image(64));
        let k = Kernel::new(KernelConfig::default(), disk, processor);
        let mut space = AddrSpace::new(&k);
        space.load("prog").unwrap();
        space.init_registers();
        space.restore_state();
        let parent_pid = space.pid();
        drop(KThread::current().set_space(space));

        let m = k.machine();
        m.write_register(PC_REG, 20);
        m.write_register(NEXT_PC_REG, 24);
        assert_eq!(trap(&k, SC_FORK, &[]), Flow::Continue);
        let child_pid = m.read_register(RESULT_REG);
        assert!(child_pid > 0 && child_pid as usize != parent_pid);
        assert_eq!(m.read_register(PC_REG), 24);

        assert_eq!(trap(&k, SC_JOIN, &[child_pid]), Flow::Continue);
        assert_eq!(m.read_register(RESULT_REG), 7);
        assert_eq!(*seen.lock(), vec![(child_pid as usize, 0, 24)]);
        assert_eq!(
            k.procs().proc_of(child_pid as usize).unwrap().ppid(),
            parent_pid
        );
    }
}
