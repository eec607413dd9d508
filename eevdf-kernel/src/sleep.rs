use crate::proc::{ProcRef, ProcState};
use crate::Kernel;
use spin::mutex::{Mutex, MutexGuard};

/// What a sleeping process waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Events concerning a process, such as one of its children exiting
    Proc(ProcRef),
    /// The tick counter advancing
    Ticks,
    /// Anything else, keyed by an address the waker and sleeper agree on
    Addr(usize),
}

impl Kernel {
    /// Atomically release `guard` and sleep on `chan`, reacquiring `lock`
    /// once woken.
    ///
    /// The process lock is taken before `guard` is released, and every
    /// wakeup takes it too, so a wakeup issued after the caller checked its
    /// condition cannot be missed.
    pub fn sleep<'a, T>(
        &self,
        me: ProcRef,
        chan: Channel,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        {
            let mut inner = self.procs.get(me).public_data.lock();
            drop(guard);

            inner.chan = Some(chan);
            inner.state = ProcState::Sleeping;

            inner = self.sched(me, inner);

            inner.chan = None;
        }
        lock.lock()
    }

    /// Make every process sleeping on `chan` runnable.
    ///
    /// Sleeping earns no virtual time: the woken process keeps its vruntime
    /// and only gets a fresh quantum and deadline. Must be called without
    /// any process lock held.
    pub fn wakeup(&self, chan: Channel) {
        for p in &self.procs.pool {
            let mut inner = p.public_data.lock();
            if inner.state == ProcState::Sleeping && inner.chan == Some(chan) {
                inner.state = ProcState::Runnable;
                inner.sched.refresh();
            }
        }
    }
}
