mod common;

use common::{open, run_root, Sim, TIMEOUT};
use eevdf_kernel::error::{ProcError, VmError};
use eevdf_kernel::param::{MMAPBASE, NPROC};
use eevdf_kernel::syscall::Sysno;
use eevdf_kernel::vm::PAGE_SIZE;
use eevdf_kernel::ProcState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;

#[test]
fn fork_copies_memory_and_returns_zero_to_the_child() {
    run_root(1, 64, |user| {
        user.store(0x900, b"before fork");
        let parent = user.pid();

        let child = user.fork(move |child| {
            assert_eq!(child.kernel.with_trapframe(child.me, |frame| frame.a0), 0);
            assert_ne!(child.pid(), parent);
            assert_eq!(child.load(0x900, 11), b"before fork");
            child.store(0x900, b"child wrote");
            child.exit(7);
        });
        assert!(child > parent);
        assert_eq!(user.reap(child), 7);
        assert_eq!(user.load(0x900, 11), b"before fork");
        assert!(user.kernel.lookup(child).is_none());
    });
}

#[test]
fn wait_returns_the_reaped_pid() {
    run_root(1, 64, |user| {
        let first = user.fork(|child| child.exit(1));
        let second = user.fork(|child| child.exit(2));

        let mut reaped = vec![
            user.kernel.wait(user.me, 0).unwrap(),
            user.kernel.wait(user.me, 0).unwrap(),
        ];
        reaped.sort_unstable();
        assert_eq!(reaped, [first, second]);
        assert_eq!(user.kernel.wait(user.me, 0), Err(ProcError::NoChildren));
    });
}

#[test]
fn waitpid_only_reaps_the_named_child() {
    run_root(1, 64, |user| {
        let slow = user.fork(|child| {
            let _ = child.kernel.sleep_ticks(child.me, 5);
            child.exit(3);
        });
        let fast = user.fork(|child| child.exit(4));

        assert_eq!(user.reap(slow), 3);
        assert_eq!(user.reap(fast), 4);
        assert_eq!(
            user.kernel.waitpid(user.me, fast, 0),
            Err(ProcError::NoChildren)
        );
        assert_eq!(
            user.kernel.waitpid(user.me, user.pid(), 0),
            Err(ProcError::NoChildren)
        );
    });
}

#[test]
fn wait_through_the_system_call_reports_status() {
    run_root(1, 64, |user| {
        let child = user.fork(|child| child.exit(-5));
        let pid = user.ecall(Sysno::Wait, &[common::SCRATCH as u64]);
        assert_eq!(pid, child as u64);
        assert_eq!(user.load_i32(common::SCRATCH), -5);
        assert_eq!(user.ecall_signed(Sysno::Wait, &[0]), -1);
        assert_eq!(user.ecall_signed(Sysno::Waitpid, &[child as u64, 0]), -1);
    });
}

#[test]
fn pids_keep_increasing_across_slot_reuse() {
    run_root(1, 64, |user| {
        let mut last = user.pid();
        for _ in 0..5 {
            let child = user.fork(|child| child.exit(0));
            assert!(child > last);
            assert_eq!(user.reap(child), 0);
            last = child;
        }
    });
}

#[test]
fn children_inherit_priority_and_virtual_time() {
    run_root(1, 64, |user| {
        user.kernel.setnice(user.pid(), 10).unwrap();
        let (report, reports) = mpsc::channel();
        let child = user.fork(move |child| {
            report.send(child.kernel.getnice(child.pid())).unwrap();
            child.exit(0);
        });
        let rows = user.kernel.ps(Some(user.me), child);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nice, 10);
        assert_eq!(rows[0].runtime, 0);
        assert_eq!(user.reap(child), 0);
        assert_eq!(reports.recv_timeout(TIMEOUT).unwrap(), Ok(10));
    });
}

#[test]
fn kill_wakes_a_sleeping_child() {
    run_root(1, 64, |user| {
        let child = user.fork(|child| {
            child.ecall(Sysno::Sleep, &[1_000_000]);
            child.exit(0);
        });
        user.wait_until_sleeping(child);
        assert_eq!(
            user.kernel.ps(Some(user.me), child)[0].state,
            ProcState::Sleeping
        );
        assert_eq!(user.ecall(Sysno::Kill, &[child as u64]), 0);
        assert_eq!(user.reap(child), -1);
        assert_eq!(user.kernel.kill(child), Err(ProcError::NoSuchProcess(child)));
        assert_eq!(user.ecall_signed(Sysno::Kill, &[child as u64]), -1);
    });
}

#[test]
fn a_killed_process_exits_at_its_next_trap() {
    run_root(1, 64, |user| {
        let child = user.fork(|child| loop {
            child.ecall(Sysno::Getpid, &[]);
            child.tick();
        });
        user.kernel.kill(child).unwrap();
        assert_eq!(user.reap(child), -1);
    });
}

#[test]
fn orphans_are_reaped_by_the_root() {
    let sim = Sim::boot(1, 64);
    let (report, reports) = mpsc::channel();
    sim.start(move |user| {
        let grandchild_report = report.clone();
        let child = user.fork(move |child| {
            let grandchild = child.fork(|grandchild| {
                let _ = grandchild.kernel.sleep_ticks(grandchild.me, 20);
                grandchild.exit(9);
            });
            grandchild_report.send(grandchild).unwrap();
            child.exit(0);
        });
        assert_eq!(user.reap(child), 0);
        let grandchild = user.kernel.wait(user.me, 0).unwrap();
        report.send(grandchild).unwrap();
    });

    let spawned = reports.recv_timeout(TIMEOUT).unwrap();
    let reaped = reports.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(spawned, reaped);
    assert!(sim.kernel().lookup(reaped).is_none());
}

#[test]
fn the_table_fills_up_and_drains() {
    run_root(1, 256, |user| {
        let before = user.kernel.freemem();
        let mut children = Vec::new();
        loop {
            match user.try_fork(|child| child.exit(0)) {
                Ok(pid) => children.push(pid),
                Err(err) => {
                    assert_eq!(err, ProcError::NoFreeSlot);
                    break;
                }
            }
        }
        assert_eq!(children.len(), NPROC - 1);

        for _ in &children {
            user.kernel.wait(user.me, 0).unwrap();
        }
        assert_eq!(user.kernel.freemem(), before);
        assert!(user.try_fork(|child| child.exit(0)).is_ok());
    });
}

#[test]
fn failed_fork_rolls_back() {
    run_root(1, 8, |user| {
        // Root uses a trap frame and one page; grow until a copy cannot fit.
        let free = user.kernel.freemem();
        user.kernel
            .growproc(user.me, ((free - 2) * PAGE_SIZE) as isize)
            .unwrap();
        let before = user.kernel.freemem();
        assert_eq!(before, 2);

        assert_eq!(
            user.try_fork(|child| child.exit(0)),
            Err(ProcError::Vm(VmError::OutOfMemory))
        );
        assert_eq!(user.kernel.freemem(), before);
        assert_eq!(user.kernel.wait(user.me, 0), Err(ProcError::NoChildren));
    });
}

#[test]
fn sbrk_grows_and_shrinks_the_heap() {
    run_root(1, 64, |user| {
        let start = user.ecall(Sysno::Sbrk, &[2 * PAGE_SIZE as u64]) as usize;
        assert_eq!(start, PAGE_SIZE);
        user.store(start + PAGE_SIZE + 10, b"heap");
        assert_eq!(user.load(start + PAGE_SIZE + 10, 4), b"heap");

        let free = user.kernel.freemem();
        let top = user.ecall(Sysno::Sbrk, &[(-(PAGE_SIZE as i64)) as u64]) as usize;
        assert_eq!(top, 3 * PAGE_SIZE);
        assert_eq!(user.kernel.freemem(), free + 1);

        assert_eq!(
            user.kernel.growproc(user.me, MMAPBASE as isize),
            Err(ProcError::Vm(VmError::BadAddress(2 * PAGE_SIZE)))
        );
        assert_eq!(user.kernel.growproc(user.me, 0), Ok(2 * PAGE_SIZE));
    });
}

#[test]
fn descriptors_are_shared_with_children() {
    run_root(1, 64, |user| {
        let file = open(b"data", true, false);
        assert_eq!(user.kernel.fdalloc(user.me, file.clone()), Ok(0));
        assert_eq!(user.kernel.fdalloc(user.me, file.clone()), Ok(1));
        assert_eq!(user.kernel.close(user.me, 0), Ok(()));
        assert_eq!(user.kernel.close(user.me, 0), Err(ProcError::BadFd(0)));
        assert_eq!(user.ecall_signed(Sysno::Close, &[99]), -1);

        let child = user.fork(|child| {
            assert!(child.kernel.file(child.me, 1).is_some());
            assert!(child.kernel.file(child.me, 0).is_none());
            child.exit(0);
        });
        assert_eq!(user.reap(child), 0);
        assert_eq!(user.ecall(Sysno::Close, &[1]), 0);
        assert_eq!(std::sync::Arc::strong_count(&file), 1);
    });
}

#[test]
fn the_root_process_may_not_exit() {
    run_root(1, 64, |user| {
        let result = catch_unwind(AssertUnwindSafe(|| user.exit(0)));
        assert!(result.is_err());
        assert_eq!(
            user.kernel.ps(Some(user.me), user.pid())[0].state,
            ProcState::Running
        );
    });
}
