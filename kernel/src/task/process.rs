//! Process table: pid allocation and the join/exit rendezvous.
//!
//! Every address space registers one [`Proc`] record here. A record outlives
//! its process: after `exit` it stays in the table, dead, holding the exit
//! value until a joiner harvests it or a later `get_pid` sweep reclaims the
//! slot. Slots are never reclaimed eagerly.
//!
//! Pid 0 is never handed out: a parent pid of 0 means "no parent".

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use spin::Once;

use crate::memory::bitmap::Bitmap;
use crate::sync::condition::Condition;
use crate::sync::lock::Lock;
use crate::sync::spinlock::SpinLock;
use crate::task::thread::KThread;

/// Joiner count of a process nobody ever joined.
pub const NO_JOINER: i32 = -1;

/// Parent pid of a process with no parent. Reserved, never allocated.
pub const NO_PARENT: usize = 0;

// ── Process record ──────────────────────────────────────────────

/// Mutable part of a process record, guarded by its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStatus {
    pub alive: bool,
    /// [`NO_JOINER`] until a join registers, then the number of joiners
    /// currently waiting, minus one.
    pub joiners: i32,
    pub ret_value: i32,
}

/// A process record.
pub struct Proc {
    pid: usize,
    ppid: AtomicUsize,
    /// The thread running the process.
    thread: SpinLock<Weak<KThread>>,
    status: SpinLock<ProcStatus>,
}

impl Proc {
    pub fn new(pid: usize, thread: &Arc<KThread>) -> Self {
        Self {
            pid,
            ppid: AtomicUsize::new(NO_PARENT),
            thread: SpinLock::new(Arc::downgrade(thread)),
            status: SpinLock::new(ProcStatus {
                alive: true,
                joiners: NO_JOINER,
                ret_value: 0,
            }),
        }
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn ppid(&self) -> usize {
        self.ppid.load(Ordering::Acquire)
    }

    pub fn set_ppid(&self, ppid: usize) {
        self.ppid.store(ppid, Ordering::Release);
    }

    /// The owning thread, while it is still around.
    pub fn thread(&self) -> Option<Arc<KThread>> {
        self.thread.lock().upgrade()
    }

    /// Hand the record to the thread that will run the process.
    pub fn set_thread(&self, thread: &Arc<KThread>) {
        *self.thread.lock() = Arc::downgrade(thread);
    }

    /// Snapshot of the mutable state.
    pub fn status(&self) -> ProcStatus {
        *self.status.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.status.lock().alive
    }

    fn is_reclaimable(&self) -> bool {
        let status = self.status.lock();
        !status.alive && status.joiners == NO_JOINER
    }
}

impl core::fmt::Debug for Proc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Proc")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid())
            .field("status", &self.status())
            .finish()
    }
}

// ── Process table ───────────────────────────────────────────────

struct ProcTable {
    pids: Bitmap,
    procs: Vec<Option<Arc<Proc>>>,
}

/// The process table.
pub struct ProcessManager {
    table: SpinLock<ProcTable>,
    /// Per-pid join/exit lock, created on first use.
    locks: Box<[Once<Lock>]>,
    /// Per-pid join/exit condition, created on first use.
    conditions: Box<[Once<Condition>]>,
}

impl ProcessManager {
    pub fn new(max_processes: usize) -> Self {
        let mut pids = Bitmap::new(max_processes);
        if max_processes > NO_PARENT {
            pids.mark(NO_PARENT);
        }
        Self {
            table: SpinLock::new(ProcTable {
                pids,
                procs: vec![None; max_processes],
            }),
            locks: (0..max_processes).map(|_| Once::new()).collect(),
            conditions: (0..max_processes).map(|_| Once::new()).collect(),
        }
    }

    pub fn max_processes(&self) -> usize {
        self.locks.len()
    }

    /// Allocate a pid.
    ///
    /// When every pid is taken, slots of dead processes nobody ever joined
    /// are reclaimed first.
    ///
    /// # Panics
    ///
    /// Panics if the table is still full after the sweep.
    pub fn get_pid(&self) -> usize {
        let mut table = self.table.lock();
        if let Some(pid) = table.pids.find_and_set() {
            return pid;
        }

        let mut reclaimed = 0;
        for pid in 0..table.procs.len() {
            if table.procs[pid].as_ref().is_some_and(|p| p.is_reclaimable()) {
                table.procs[pid] = None;
                table.pids.clear(pid);
                reclaimed += 1;
            }
        }
        log::info!("process table full, reclaimed {} dead process(es)", reclaimed);

        match table.pids.find_and_set() {
            Some(pid) => pid,
            None => panic!("process table exhausted: {} live processes", table.procs.len()),
        }
    }

    /// Store the record for an allocated pid.
    pub fn insert(&self, proc: Arc<Proc>) {
        let pid = proc.pid();
        let mut table = self.table.lock();
        assert!(table.pids.test(pid), "inserting process {} without a pid", pid);
        table.procs[pid] = Some(proc);
    }

    /// Allocate a pid and register a process record for `thread`.
    pub fn register(&self, thread: &Arc<KThread>) -> Arc<Proc> {
        let pid = self.get_pid();
        let proc = Arc::new(Proc::new(pid, thread));
        self.insert(Arc::clone(&proc));
        log::debug!("registered process {} for thread '{}'", pid, thread.name());
        proc
    }

    /// Release `pid` and drop its record.
    pub fn clear_pid(&self, pid: usize) {
        assert_ne!(pid, NO_PARENT, "pid {} is reserved", NO_PARENT);
        let mut table = self.table.lock();
        table.pids.clear(pid);
        table.procs[pid] = None;
    }

    /// Bounds check only.
    pub fn valid_pid(&self, pid: i32) -> bool {
        0 <= pid && (pid as usize) < self.max_processes()
    }

    /// The record of `pid`, if the pid is allocated.
    pub fn proc_of(&self, pid: usize) -> Option<Arc<Proc>> {
        self.table.lock().procs.get(pid)?.clone()
    }

    /// Number of processes that have not exited.
    pub fn live_count(&self) -> usize {
        self.table
            .lock()
            .procs
            .iter()
            .flatten()
            .filter(|p| p.is_alive())
            .count()
    }

    /// The join/exit lock of `pid`.
    pub fn get_lock(&self, pid: usize) -> &Lock {
        assert!(pid < self.max_processes(), "pid {} out of range", pid);
        self.locks[pid].call_once(|| Lock::new("proc lock"))
    }

    /// The join/exit condition of `pid`.
    pub fn get_condition(&self, pid: usize) -> &Condition {
        assert!(pid < self.max_processes(), "pid {} out of range", pid);
        self.conditions[pid].call_once(|| Condition::new("proc condition"))
    }

    /// Record that `pid` exited with `value` and release one joiner.
    pub fn exit(&self, pid: usize, value: i32) {
        let lock = self.get_lock(pid);
        lock.acquire();

        match self.proc_of(pid) {
            Some(proc) => {
                let mut status = proc.status.lock();
                status.alive = false;
                status.ret_value = value;
            }
            None => log::warn!("exit of unregistered pid {}", pid),
        }
        log::debug!("process {} exited with {}", pid, value);

        self.get_condition(pid).signal(lock);
        lock.release();
    }

    /// Wait for `pid` to exit and return its exit value.
    ///
    /// Returns `None` if `pid` is out of range or not allocated. A process
    /// that already exited yields its value without blocking.
    pub fn join(&self, pid: i32) -> Option<i32> {
        if !self.valid_pid(pid) {
            log::warn!("join of invalid pid {}", pid);
            return None;
        }
        let pid = pid as usize;
        let Some(proc) = self.proc_of(pid) else {
            log::warn!("join of unallocated pid {}", pid);
            return None;
        };

        let lock = self.get_lock(pid);
        lock.acquire();

        {
            let status = proc.status.lock();
            if !status.alive {
                let value = status.ret_value;
                drop(status);
                lock.release();
                return Some(value);
            }
        }

        proc.status.lock().joiners += 1;
        self.get_condition(pid).wait(lock);

        let value = {
            let mut status = proc.status.lock();
            status.joiners -= 1;
            assert!(!status.alive, "joiner of process {} woke while it is alive", pid);
            status.ret_value
        };
        lock.release();

        log::debug!("joined process {}: {}", pid, value);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::ThreadStatus;
    use std::sync::atomic::AtomicI32;

    fn manager(max: usize) -> Arc<ProcessManager> {
        Arc::new(ProcessManager::new(max))
    }

    #[test]
    fn pids_are_handed_out_in_order() {
        let pm = manager(4);
        assert_eq!(pm.get_pid(), 1);
        assert_eq!(pm.get_pid(), 2);
        pm.clear_pid(1);
        assert_eq!(pm.get_pid(), 1);
    }

    #[test]
    fn pid_zero_is_never_handed_out() {
        let pm = manager(3);
        let me = KThread::current();
        let first = pm.register(&me);
        let second = pm.register(&me);
        assert_eq!((first.pid(), second.pid()), (1, 2));
        assert_eq!(first.ppid(), NO_PARENT);

        // A full table of dead processes still never yields pid 0.
        pm.exit(1, 0);
        pm.exit(2, 0);
        assert_eq!(pm.get_pid(), 1);
        assert!(pm.proc_of(NO_PARENT).is_none());
        assert_eq!(pm.join(NO_PARENT as i32), None);
    }

    #[test]
    fn valid_pid_is_a_bounds_check() {
        let pm = manager(4);
        assert!(pm.valid_pid(0));
        assert!(pm.valid_pid(3));
        assert!(!pm.valid_pid(4));
        assert!(!pm.valid_pid(-1));
    }

    #[test]
    fn per_pid_sync_objects_are_stable() {
        let pm = manager(4);
        assert!(core::ptr::eq(pm.get_lock(2), pm.get_lock(2)));
        assert!(core::ptr::eq(pm.get_condition(2), pm.get_condition(2)));
        assert!(!core::ptr::eq(pm.get_lock(1), pm.get_lock(2)));
    }

    #[test]
    fn sweep_reclaims_dead_unjoined_processes() {
        let pm = manager(4);
        let me = KThread::current();
        let procs: Vec<_> = (0..3).map(|_| pm.register(&me)).collect();
        pm.exit(2, 5);
        assert_eq!(pm.live_count(), 2);

        // Full: the sweep frees pid 2 only.
        assert_eq!(pm.get_pid(), 2);
        assert!(pm.proc_of(2).is_none());
        assert!(procs[0].is_alive());
        assert!(procs[2].is_alive());
    }

    #[test]
    #[should_panic(expected = "process table exhausted")]
    fn exhaustion_after_sweep_panics() {
        let pm = manager(2);
        pm.register(&KThread::current());
        pm.get_pid();
    }

    #[test]
    fn sweeps_run_alongside_exits() {
        let pm = manager(4);
        let polling = Arc::new(core::sync::atomic::AtomicBool::new(true));

        let poller = {
            let (p, run) = (Arc::clone(&pm), Arc::clone(&polling));
            KThread::new("poller").fork(move || {
                while run.load(Ordering::SeqCst) {
                    assert!(p.live_count() <= 3);
                }
            })
        };

        // Three workers, three usable pids: every allocation past the
        // first round goes through a sweep.
        let workers: Vec<_> = (0..3)
            .map(|i| {
                let p = Arc::clone(&pm);
                KThread::new(&format!("worker-{}", i)).fork(move || {
                    let me = KThread::current();
                    for round in 0..50 {
                        let proc = p.register(&me);
                        p.exit(proc.pid(), round);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        polling.store(false, Ordering::SeqCst);
        poller.join().unwrap();
        assert_eq!(pm.live_count(), 0);
    }

    #[test]
    fn join_after_exit_returns_immediately() {
        let pm = manager(4);
        let proc = pm.register(&KThread::current());
        pm.exit(proc.pid(), 42);
        assert_eq!(pm.join(proc.pid() as i32), Some(42));
        assert_eq!(proc.status().joiners, NO_JOINER);
    }

    #[test]
    fn join_rejects_bad_pids() {
        let pm = manager(4);
        assert_eq!(pm.join(-1), None);
        assert_eq!(pm.join(4), None);
        assert_eq!(pm.join(2), None);
        assert_eq!(pm.join(0), None);
    }

    #[test]
    fn join_blocks_until_exit() {
        let pm = manager(4);
        let target = pm.register(&KThread::current());
        let pid = target.pid();
        let result = Arc::new(AtomicI32::new(i32::MIN));

        let joiner = KThread::new("joiner");
        let (p, r) = (Arc::clone(&pm), Arc::clone(&result));
        let handle = joiner.fork(move || {
            let v = p.join(pid as i32).unwrap();
            r.store(v, Ordering::SeqCst);
        });

        while joiner.status() != ThreadStatus::Blocked || target.status().joiners != 0 {
            std::thread::yield_now();
        }
        assert_eq!(result.load(Ordering::SeqCst), i32::MIN);

        pm.exit(pid, 10);
        handle.join().unwrap();
        assert_eq!(result.load(Ordering::SeqCst), 10);
        // Harvested: the slot is reclaimable again.
        assert_eq!(target.status().joiners, NO_JOINER);
    }
}
