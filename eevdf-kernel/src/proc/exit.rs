use super::{Pid, ProcRef, ProcState};
use crate::error::ProcError;
use crate::param::NPROC;
use crate::sleep::Channel;
use crate::Kernel;
use log::{debug, error, info};

impl Kernel {
    /// Exit `me` with `status`. The process stays a zombie until its parent
    /// reaps it.
    /// # Panics
    /// Panics if the root process exits.
    pub fn exit(&self, me: ProcRef, status: i32) -> ! {
        if self.procs.init_proc.get() == Some(&me) {
            error!("exit: root process pid {} exiting", me.pid);
            panic!("init exiting");
        }

        self.with_data(me, |data| {
            for file in &mut data.ofile {
                file.take();
            }
        });

        let mut parents = self.procs.parents.lock();
        self.reparent(me, &mut parents);
        if let Some(parent) = parents[me.slot] {
            self.wakeup(Channel::Proc(parent));
        }

        let mut inner = self.procs.get(me).public_data.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
        drop(parents);
        info!("exit: pid {} status {status}", me.pid);

        let _inner = self.sched(me, inner);
        panic!("zombie exit");
    }

    /// Hand the children of `me` to the root process.
    /// The caller holds the `parents` lock.
    fn reparent(&self, me: ProcRef, parents: &mut [Option<ProcRef>; NPROC]) {
        let Some(&init) = self.procs.init_proc.get() else {
            return;
        };
        for parent in parents.iter_mut().filter(|parent| **parent == Some(me)) {
            *parent = Some(init);
            self.wakeup(Channel::Proc(init));
        }
    }

    /// Wait for any child to exit and reap it. The exit status is copied
    /// to `status_address` unless it is 0.
    pub fn wait(&self, me: ProcRef, status_address: usize) -> Result<Pid, ProcError> {
        self.reap(me, None, status_address)
    }

    /// Wait for the child `pid` to exit and reap it
    pub fn waitpid(&self, me: ProcRef, pid: Pid, status_address: usize) -> Result<(), ProcError> {
        self.reap(me, Some(pid), status_address).map(|_| ())
    }

    #[allow(clippy::needless_range_loop)]
    fn reap(
        &self,
        me: ProcRef,
        target: Option<Pid>,
        status_address: usize,
    ) -> Result<Pid, ProcError> {
        let mut parents = self.procs.parents.lock();
        loop {
            let mut havekids = false;
            for slot in 0..NPROC {
                if parents[slot] != Some(me) {
                    continue;
                }
                let mut child = self.procs.pool[slot].public_data.lock();
                if child.state == ProcState::Unused
                    || target.is_some_and(|pid| child.pid != pid)
                {
                    continue;
                }
                havekids = true;

                if child.state == ProcState::Zombie {
                    let pid = child.pid;
                    if status_address != 0 {
                        self.copyout(me, status_address, &child.xstate.to_ne_bytes())?;
                    }
                    self.freeproc(ProcRef { slot, pid }, &mut child);
                    parents[slot] = None;
                    debug!("wait: pid {} reaped pid {pid}", me.pid);
                    return Ok(pid);
                }
            }

            if !havekids {
                return Err(ProcError::NoChildren);
            }
            if self.killed(me) {
                return Err(ProcError::Killed);
            }

            parents = self.sleep(me, Channel::Proc(me), &self.procs.parents, parents);
        }
    }
}
