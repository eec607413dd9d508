use super::{Pid, ProcRef, ProcState};
use crate::println::println;
use crate::Kernel;
use alloc::vec::Vec;

/// One row of the `ps` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub name: &'static str,
    pub pid: Pid,
    pub state: ProcState,
    pub nice: i32,
    /// `runtime * 1000 / weight`
    pub runtime_per_weight: u64,
    /// Runtime in milliticks
    pub runtime: u64,
    pub vruntime: u64,
    pub vdeadline: u64,
    pub eligible: bool,
}

impl Kernel {
    /// Print a listing of live processes to the console.
    /// Takes no locks beyond one slot at a time, for use when the system
    /// looks stuck.
    pub fn procdump(&self) {
        println!();
        for p in &self.procs.pool {
            let (pid, state) = {
                let inner = p.public_data.lock();
                (inner.pid, inner.state)
            };
            if state == ProcState::Unused {
                continue;
            }
            let name = p.private_data.lock().name;
            println!("{} {} {}", pid, state.as_str(), name);
        }
    }

    /// Scheduling details for `pid`, or for every live process when `pid`
    /// is 0. `me` is counted as competing for the CPU when judging eligibility.
    pub fn ps(&self, me: Option<ProcRef>, pid: Pid) -> Vec<ProcInfo> {
        let snapshot = self.snapshot(me);
        println!(
            "name\tpid\tstate\tpriority\truntime/weight\truntime\tvruntime\tvdeadline\tis_eligible\ttick {}",
            self.uptime() * 1000
        );

        let mut rows = Vec::new();
        for p in &self.procs.pool {
            let inner = p.public_data.lock();
            if inner.state == ProcState::Unused || (pid != 0 && inner.pid != pid) {
                continue;
            }
            let entity = inner.sched;
            let row = ProcInfo {
                name: p.private_data.lock().name,
                pid: inner.pid,
                state: inner.state,
                nice: entity.nice,
                runtime_per_weight: entity.runtime * 1000 / entity.weight,
                runtime: entity.runtime * 1000,
                vruntime: entity.vruntime,
                vdeadline: entity.vdeadline,
                eligible: snapshot.is_eligible(&entity),
            };
            drop(inner);

            println!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                row.name,
                row.pid,
                row.state.as_str(),
                row.nice,
                row.runtime_per_weight,
                row.runtime,
                row.vruntime,
                row.vdeadline,
                row.eligible
            );
            rows.push(row);
        }
        rows
    }

    /// Free physical memory in bytes, also reported on the console
    pub fn meminfo(&self) -> usize {
        let free = self.freemem() * crate::vm::PAGE_SIZE;
        println!("Available memory: {free} bytes");
        free
    }
}
