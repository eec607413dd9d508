//! Earliest eligible virtual deadline first scheduling.
//!
//! Every process carries a [`SchedEntity`]. Time is charged in milliticks of
//! virtual time, scaled by the inverse of the process weight, so a heavier
//! (lower nice) process accrues virtual time more slowly. A scheduling pass
//! takes an [`EevdfSnapshot`] of everyone competing for a CPU, discards the
//! processes that are ahead of their weighted fair share, and dispatches the
//! remaining one with the earliest virtual deadline.

use crate::param::{DEFAULT_NICE, NPROC, QUANTUM, TICK_SCALE, WEIGHT_UNIT};
use crate::proc::{ProcRef, ProcState, PublicProcData};
use crate::{error::ProcError, Kernel};
use log::trace;
use spin::mutex::MutexGuard;

/// Weight for each nice value, `nice 20` being [`WEIGHT_UNIT`]
pub const NICE_TO_WEIGHT: [u64; 40] = [
    /*  0 */ 88818, 71054, 56843, 45475, 36380, 29104, 23283, 18626, 14901, 11921,
    /* 10 */ 9537, 7629, 6104, 4883, 3906, 3125, 2500, 2000, 1600, 1280,
    /* 20 */ 1024, 819, 655, 524, 419, 336, 268, 215, 172, 137,
    /* 30 */ 110, 88, 70, 56, 45, 36, 29, 23, 18, 15,
];

#[must_use]
pub fn nice_to_weight(nice: i32) -> Option<u64> {
    usize::try_from(nice)
        .ok()
        .and_then(|index| NICE_TO_WEIGHT.get(index))
        .copied()
}

/// Scheduling state of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedEntity {
    pub nice: i32,
    pub weight: u64,
    /// Ticks actually spent running
    pub runtime: u64,
    /// Weight-scaled virtual time, in milliticks
    pub vruntime: u64,
    /// Virtual time by which the process should next get the CPU
    pub vdeadline: u64,
    /// Ticks left in the current quantum
    pub time_slice: u32,
}

impl Default for SchedEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedEntity {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nice: DEFAULT_NICE,
            weight: WEIGHT_UNIT,
            runtime: 0,
            vruntime: 0,
            vdeadline: 0,
            time_slice: QUANTUM,
        }
    }

    /// State of a freshly forked child of `parent`.
    ///
    /// The child starts at its parent's virtual time, so it cannot jump the
    /// queue by starting from zero.
    #[must_use]
    pub fn forked_from(parent: &SchedEntity) -> Self {
        let mut child = Self {
            nice: parent.nice,
            weight: parent.weight,
            runtime: 0,
            vruntime: parent.vruntime,
            vdeadline: 0,
            time_slice: QUANTUM,
        };
        child.renew_deadline();
        child
    }

    /// Virtual time one tick of running costs at this weight
    #[must_use]
    pub fn tick_cost(&self) -> u64 {
        TICK_SCALE * WEIGHT_UNIT / self.weight
    }

    /// Virtual length of a full quantum at this weight
    #[must_use]
    pub fn quantum_span(&self) -> u64 {
        u64::from(QUANTUM) * WEIGHT_UNIT * TICK_SCALE / self.weight
    }

    pub fn renew_deadline(&mut self) {
        self.vdeadline = self.vruntime + self.quantum_span();
    }

    /// Start a fresh quantum from the current virtual time
    pub fn refresh(&mut self) {
        self.time_slice = QUANTUM;
        self.renew_deadline();
    }

    /// Charge one timer tick. Returns `true` when the quantum ran out, in
    /// which case a new deadline and quantum are already in place and the
    /// caller must yield.
    pub fn account_tick(&mut self) -> bool {
        self.runtime += 1;
        self.time_slice = self.time_slice.saturating_sub(1);
        self.vruntime += self.tick_cost();
        if self.time_slice == 0 {
            self.refresh();
            true
        } else {
            false
        }
    }

    /// Change priority, taking effect on the deadline immediately.
    /// Returns the previous nice value.
    pub fn set_nice(&mut self, nice: i32) -> Result<i32, ProcError> {
        let weight = nice_to_weight(nice).ok_or(ProcError::InvalidNice(nice))?;
        let old = self.nice;
        self.nice = nice;
        self.weight = weight;
        self.renew_deadline();
        Ok(old)
    }
}

/// Competition summary over every running or runnable process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EevdfSnapshot {
    pub total_weight: u64,
    pub min_vruntime: u64,
    /// `Σ weight_i * (vruntime_i - min_vruntime)`
    pub weighted_lag: u128,
}

impl EevdfSnapshot {
    /// Summarize `(weight, vruntime)` pairs
    pub fn from_entities(entities: impl Iterator<Item = (u64, u64)> + Clone) -> Self {
        let mut total_weight = 0;
        let mut min_vruntime = None;
        for (weight, vruntime) in entities.clone() {
            total_weight += weight;
            min_vruntime = Some(min_vruntime.map_or(vruntime, |min: u64| min.min(vruntime)));
        }
        let min_vruntime = min_vruntime.unwrap_or(0);
        let weighted_lag = entities
            .map(|(weight, vruntime)| {
                u128::from(weight) * u128::from(vruntime.saturating_sub(min_vruntime))
            })
            .sum();
        Self {
            total_weight,
            min_vruntime,
            weighted_lag,
        }
    }

    /// A process may run only if it is not ahead of the weighted average
    #[must_use]
    pub fn is_eligible(&self, entity: &SchedEntity) -> bool {
        self.total_weight == 0
            || u128::from(self.total_weight)
                * u128::from(entity.vruntime.saturating_sub(self.min_vruntime))
                <= self.weighted_lag
    }
}

impl Kernel {
    /// Summarize every RUNNING or RUNNABLE process, plus `current` whatever its state
    pub fn snapshot(&self, current: Option<ProcRef>) -> EevdfSnapshot {
        let mut entities = [(0u64, 0u64); NPROC];
        let mut count = 0;
        for (slot, p) in self.procs.pool.iter().enumerate() {
            let inner = p.public_data.lock();
            let competing = matches!(inner.state, ProcState::Running | ProcState::Runnable)
                || current.is_some_and(|me| me.slot == slot && me.pid == inner.pid);
            if competing {
                entities[count] = (inner.sched.weight, inner.sched.vruntime);
                count += 1;
            }
        }
        EevdfSnapshot::from_entities(entities[..count].iter().copied())
    }

    /// Per-CPU scheduler loop. Never returns.
    pub fn scheduler(&self, cpu: usize) -> ! {
        *self.procs.cpus[cpu].proc.lock() = None;
        loop {
            self.machine.intr_on();
            if !self.scheduler_pass(cpu) {
                core::hint::spin_loop();
            }
        }
    }

    /// Pick the eligible process with the earliest deadline and run it until
    /// it gives the CPU back. Returns `false` if nothing was dispatched.
    pub fn scheduler_pass(&self, cpu: usize) -> bool {
        let snapshot = self.snapshot(None);

        let mut best: Option<(usize, MutexGuard<'_, PublicProcData>)> = None;
        for (slot, p) in self.procs.pool.iter().enumerate() {
            let inner = p.public_data.lock();
            if inner.state != ProcState::Runnable || !snapshot.is_eligible(&inner.sched) {
                continue;
            }
            let earlier = best
                .as_ref()
                .map_or(true, |(_, chosen)| inner.sched.vdeadline < chosen.sched.vdeadline);
            if earlier {
                best = Some((slot, inner));
            }
        }

        let Some((slot, mut inner)) = best else {
            return false;
        };

        // The process releases this lock once it is running, and holds it
        // again when it switches back here.
        inner.state = ProcState::Running;
        let me = ProcRef {
            slot,
            pid: inner.pid,
        };
        trace!(
            "cpu {cpu}: run pid {} vruntime {} vdeadline {}",
            me.pid,
            inner.sched.vruntime,
            inner.sched.vdeadline
        );
        *self.procs.cpus[cpu].proc.lock() = Some(me);
        self.machine.run(cpu, me);
        *self.procs.cpus[cpu].proc.lock() = None;
        drop(inner);
        true
    }

    /// Switch from `me` back to its CPU's scheduler. The caller holds its own
    /// lock and has already moved out of RUNNING; the lock is held again on
    /// return.
    pub(crate) fn sched<'a>(
        &'a self,
        me: ProcRef,
        guard: MutexGuard<'a, PublicProcData>,
    ) -> MutexGuard<'a, PublicProcData> {
        assert!(guard.pid == me.pid, "sched p->lock");
        assert!(guard.state != ProcState::Running, "sched running");
        self.machine.switch_to_scheduler(me);
        guard
    }

    /// Give up the CPU for one scheduling round
    pub fn yield_cpu(&self, me: ProcRef) {
        let mut inner = self.procs.get(me).public_data.lock();
        if inner.sched.time_slice == 0 {
            inner.sched.refresh();
        }
        inner.state = ProcState::Runnable;
        let inner = self.sched(me, inner);
        drop(inner);
    }

    pub fn getnice(&self, pid: i32) -> Result<i32, ProcError> {
        self.with_pid(pid, |inner| inner.sched.nice)
    }

    /// Set the nice value of `pid`, returning the previous one
    pub fn setnice(&self, pid: i32, nice: i32) -> Result<i32, ProcError> {
        if nice_to_weight(nice).is_none() {
            return Err(ProcError::InvalidNice(nice));
        }
        self.with_pid(pid, |inner| inner.sched.set_nice(nice))?
    }
}
