//! Kernel threads: the execution contexts the scheduler moves between
//! running, ready and blocked.
//!
//! Each kernel thread is hosted on its own host thread. Only the blocking
//! protocol matters to the kernel: a thread gives up its atomicity guard and
//! sleeps in [`KThread::sleep`], and stays asleep until some other context
//! passes it to [`scheduler::ready_to_run`](super::scheduler::ready_to_run).

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{JoinHandle, Thread};

use spin::Once;

use crate::machine::{Machine, NUM_TOTAL_REGS};
use crate::sync::spinlock::{SpinLock, SpinLockGuard};
use crate::userprog::addrspace::AddrSpace;

// ── Thread identifiers ──────────────────────────────────────────

/// Monotonically increasing thread id counter. Id 0 means "nobody".
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

// ── Thread state ────────────────────────────────────────────────

/// The possible states of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, not started yet.
    JustCreated,
    /// Currently executing.
    Running,
    /// Runnable, waiting for the core.
    Ready,
    /// Asleep on a semaphore queue.
    Blocked,
    /// Body returned; awaiting cleanup.
    Finished,
}

thread_local! {
    /// The kernel thread bound to this host thread.
    static CURRENT: RefCell<Option<Arc<KThread>>> = const { RefCell::new(None) };
}

/// A kernel thread control block.
pub struct KThread {
    id: u64,
    name: String,
    status: SpinLock<ThreadStatus>,
    /// Host thread to unpark when made ready.
    host: Once<Thread>,
    /// Set by `ready_to_run`, consumed by `sleep`.
    wakeup: AtomicBool,
    /// User-mode registers saved while the thread is not on the machine.
    user_registers: SpinLock<[i32; NUM_TOTAL_REGS]>,
    /// The address space this thread runs user code in, if any.
    space: SpinLock<Option<AddrSpace>>,
}

impl KThread {
    /// Create a thread control block. Nothing runs until [`KThread::fork`].
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: alloc_tid(),
            name: String::from(name),
            status: SpinLock::new(ThreadStatus::JustCreated),
            host: Once::new(),
            wakeup: AtomicBool::new(false),
            user_registers: SpinLock::new([0; NUM_TOTAL_REGS]),
            space: SpinLock::new(None),
        })
    }

    /// The kernel thread running on the calling host thread.
    ///
    /// A host thread that was not started through `fork` (the bootstrap
    /// thread, a test harness thread) gets a "main" control block on first
    /// use.
    pub fn current() -> Arc<KThread> {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(thread) = slot.as_ref() {
                return Arc::clone(thread);
            }
            let thread = KThread::new("main");
            thread.bind_host();
            *thread.status.lock() = ThreadStatus::Running;
            *slot = Some(Arc::clone(&thread));
            thread
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        *self.status.lock() = status;
    }

    /// Is this the thread executing the caller?
    pub fn is_current(&self) -> bool {
        KThread::current().id == self.id
    }

    fn bind_host(&self) {
        self.host.call_once(std::thread::current);
    }

    /// Start the thread running `body`.
    ///
    /// The returned handle lets hosting code wait for the body to finish;
    /// the kernel itself never joins host threads.
    pub fn fork<F>(self: &Arc<Self>, body: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Arc::clone(self);
        self.set_status(ThreadStatus::Ready);
        log::debug!("forking thread '{}' (tid {})", self.name, self.id);

        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                thread.bind_host();
                CURRENT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&thread)));
                thread.set_status(ThreadStatus::Running);
                body();
                thread.finish();
            })
            .unwrap_or_else(|e| panic!("failed to start kernel thread '{}': {}", self.name, e))
    }

    /// Mark the thread finished and release its address space.
    fn finish(&self) {
        // Take the space out first: dropping it frees frames and must not
        // happen under our own guard.
        let space = self.space.lock().take();
        drop(space);
        self.set_status(ThreadStatus::Finished);
        log::debug!("thread '{}' (tid {}) finished", self.name, self.id);
    }

    /// Relinquish the core to any other runnable thread.
    pub fn yield_cpu(&self) {
        std::thread::yield_now();
    }

    /// Put the calling thread to sleep.
    ///
    /// `guard` is the atomicity guard under which the caller queued itself
    /// somewhere `ready_to_run` will find it. The guard is released, the
    /// thread blocks until made ready, and the same lock is re-taken before
    /// returning.
    pub fn sleep<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        debug_assert!(self.is_current(), "only the running thread can put itself to sleep");
        let lock = SpinLockGuard::spinlock(&guard);

        self.set_status(ThreadStatus::Blocked);
        drop(guard);

        // Host wakeups without a matching `ready_to_run` are absorbed here.
        while !self.wakeup.swap(false, Ordering::Acquire) {
            std::thread::park();
        }

        self.set_status(ThreadStatus::Running);
        lock.lock()
    }

    /// Make the thread runnable. Called by the scheduler only.
    pub(crate) fn wake(&self) {
        self.wakeup.store(true, Ordering::Release);
        if let Some(host) = self.host.get() {
            host.unpark();
        }
    }

    // ── User-mode state ─────────────────────────────────────────

    /// Save the machine's user registers into this thread.
    pub fn save_user_state(&self, machine: &Machine) {
        let mut regs = self.user_registers.lock();
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = machine.read_register(i);
        }
    }

    /// Load this thread's saved user registers into the machine.
    pub fn restore_user_state(&self, machine: &Machine) {
        let regs = self.user_registers.lock();
        for (i, reg) in regs.iter().enumerate() {
            machine.write_register(i, *reg);
        }
    }

    pub fn read_user_register(&self, index: usize) -> i32 {
        self.user_registers.lock()[index]
    }

    pub fn write_user_register(&self, index: usize, value: i32) {
        self.user_registers.lock()[index] = value;
    }

    // ── Address space ───────────────────────────────────────────

    /// Borrow the thread's address space slot.
    pub fn space(&self) -> SpinLockGuard<'_, Option<AddrSpace>> {
        self.space.lock()
    }

    /// Install an address space, returning the one it replaces.
    ///
    /// The caller drops the old space outside of any guard.
    pub fn set_space(&self, space: AddrSpace) -> Option<AddrSpace> {
        self.space.lock().replace(space)
    }

    /// Detach the thread's address space.
    pub fn take_space(&self) -> Option<AddrSpace> {
        self.space.lock().take()
    }

    /// Pid of the process this thread runs, if it has an address space.
    pub fn pid(&self) -> Option<usize> {
        self.space.lock().as_ref().map(AddrSpace::pid)
    }
}

impl core::fmt::Debug for KThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
