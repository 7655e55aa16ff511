//! Join/exit rendezvous driven through the system-call layer.

mod common;

use std::sync::Arc;

use common::{init_logging, program, trap};
use simos_kernel::fs::RamDisk;
use simos_kernel::machine::PC_REG;
use simos_kernel::sync::SpinLock;
use simos_kernel::syscall::{SC_EXIT, SC_FORK, SC_JOIN};
use simos_kernel::task::KThread;
use simos_kernel::{Flow, Kernel, KernelConfig};

#[test]
fn join_issued_before_exit_returns_the_exit_value() {
    init_logging();
    let joined = Arc::new(SpinLock::new(None));
    let record = Arc::clone(&joined);

    let processor = move |k: &Arc<Kernel>| {
        let m = k.machine();
        if m.read_register(PC_REG) == 0 {
            // Parent: fork, then join the child before it exits.
            let (_, child) = trap(k, SC_FORK, &[]);
            assert!(child > 0);
            let (_, value) = trap(k, SC_JOIN, &[child]);
            *record.lock() = Some((child, value));
            trap(k, SC_EXIT, &[0]);
        } else {
            // Child: resumes past the fork trap. Exit only once the parent
            // is registered as a joiner.
            let me = KThread::current().pid().unwrap();
            let proc = k.procs().proc_of(me).unwrap();
            while proc.status().joiners < 0 {
                std::thread::yield_now();
            }
            assert_eq!(trap(k, SC_EXIT, &[10]).0, Flow::Stop);
        }
    };

    let disk = RamDisk::new().with_file("parent", program(1, 16));
    let k = Kernel::new(KernelConfig::default(), disk, processor);
    let (parent, handle) = k.start_process("parent").unwrap();
    handle.join().unwrap();

    let (child, value) = joined.lock().take().unwrap();
    assert_eq!(value, 10);
    assert_eq!(k.procs().proc_of(child as usize).unwrap().ppid(), parent);
    assert_eq!(k.procs().join(parent as i32), Some(0));
}

#[test]
fn join_after_exit_does_not_block() {
    init_logging();
    let processor = |k: &Arc<Kernel>| {
        trap(k, SC_EXIT, &[33]);
    };
    let disk = RamDisk::new().with_file("p", program(1, 8));
    let k = Kernel::new(KernelConfig::default(), disk, processor);

    let (pid, handle) = k.start_process("p").unwrap();
    handle.join().unwrap();
    assert_eq!(k.procs().join(pid as i32), Some(33));
    // Harvesting leaves the record dead and unjoined.
    let status = k.procs().proc_of(pid).unwrap().status();
    assert!(!status.alive);
    assert_eq!(status.joiners, -1);
}

#[test]
fn exit_wakes_exactly_one_joiner() {
    init_logging();
    let k = Kernel::new(KernelConfig::default(), RamDisk::new(), |_: &Arc<Kernel>| {});
    let target = k.procs().register(&KThread::current());
    let pid = target.pid() as i32;

    let results = Arc::new(SpinLock::new(Vec::new()));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let (k, r) = (Arc::clone(&k), Arc::clone(&results));
            KThread::new(&format!("joiner-{}", i)).fork(move || {
                let v = k.procs().join(pid).unwrap();
                r.lock().push(v);
            })
        })
        .collect();

    while k.procs().get_condition(target.pid()).waiter_count() < 2 {
        std::thread::yield_now();
    }
    k.procs().exit(target.pid(), 5);

    while results.lock().is_empty() {
        std::thread::yield_now();
    }
    assert_eq!(k.procs().get_condition(target.pid()).waiter_count(), 1);
    assert_eq!(*results.lock(), vec![5]);

    // Release the second joiner so the test can finish.
    let lock = k.procs().get_lock(target.pid());
    lock.acquire();
    k.procs().get_condition(target.pid()).signal(lock);
    lock.release();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*results.lock(), vec![5, 5]);
}
