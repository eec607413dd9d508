use super::{Pid, ProcRef, ProcState};
use crate::error::ProcError;
use crate::sched::SchedEntity;
use crate::Kernel;
use log::debug;

impl Kernel {
    /// Create a copy of `me`. Returns the child's pid to the parent; the
    /// child sees 0 in its return register.
    pub fn fork(&self, me: ProcRef) -> Result<Pid, ProcError> {
        let inherited = self.procs.get(me).public_data.lock().sched;

        let (child, mut inner) = self.allocproc()?;
        if let Err(err) = self.copy_process(me, child) {
            self.freeproc(child, &mut inner);
            return Err(err);
        }
        inner.sched = SchedEntity::forked_from(&inherited);
        drop(inner);

        self.procs.parents.lock()[child.slot] = Some(me);

        self.procs.get(child).public_data.lock().state = ProcState::Runnable;
        debug!(
            "fork: pid {} -> pid {} at vruntime {}",
            me.pid, child.pid, inherited.vruntime
        );
        Ok(child.pid)
    }

    /// Duplicate memory, mappings, registers and open files of `me` into `child`
    fn copy_process(&self, me: ProcRef, child: ProcRef) -> Result<(), ProcError> {
        let mut parent_data = self.procs.get(me).private_data.lock();
        let mut child_data = self.procs.get(child).private_data.lock();

        let size = parent_data.sz;
        let Some(parent_table) = parent_data.page_table.as_ref() else {
            panic!("fork: no page table");
        };
        parent_table.copy_pages(child_data.page_table(), self.kmem, 0, size)?;
        child_data.sz = size;
        self.dup_mappings(me, child, parent_table, child_data.page_table())?;

        let Some(frame) = parent_data.trapframe().copied() else {
            panic!("fork: no trapframe");
        };
        if let Some(child_frame) = child_data.trapframe() {
            *child_frame = frame;
            child_frame.a0 = 0;
        }

        child_data.ofile.clone_from(&parent_data.ofile);
        child_data.name = parent_data.name;
        Ok(())
    }
}
