//! The process table.
//!
//! Each slot has two locks. `public_data` guards what other CPUs look at:
//! state, sleep channel, killed flag, exit status, pid and scheduling
//! fields. `private_data` guards what mostly only the owner touches: memory,
//! trap frame, open files. Parent links live apart from both, under the
//! table-wide `parents` lock.
//!
//! Lock order: `parents`, then a process's `public_data`, then its
//! `private_data`, then the mapping table. The tick lock may be held while
//! taking any `public_data`. `private_data` is never held across a switch to
//! the scheduler.

mod dump;
mod exit;
mod fork;

pub use dump::ProcInfo;

use crate::error::{ProcError, VmError};
use crate::file::File;
use crate::kalloc::page_bytes;
use crate::param::{KSTACK_PAGES, MMAPBASE, NCPU, NOFILE, NPROC};
use crate::sched::SchedEntity;
use crate::sleep::Channel;
use crate::trap::TrapFrame;
use crate::vm::{PageTable, PteFlags, PAGE_SIZE, PGROUNDUP, TRAMPOLINE, TRAPFRAME};
use crate::Kernel;
use alloc::sync::Arc;
use log::{info, warn};
use spin::mutex::{Mutex, MutexGuard};
use spin::once::Once;

pub type Pid = i32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Used => "used",
            Self::Sleeping => "sleep",
            Self::Runnable => "runble",
            Self::Running => "run",
            Self::Zombie => "zombie",
        }
    }
}

/// Handle to a process: its slot plus the pid it had when the handle was
/// taken. A handle to a reaped process never matches the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcRef {
    pub(crate) slot: usize,
    pub(crate) pid: Pid,
}

impl ProcRef {
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
pub(crate) struct Proc {
    pub(crate) public_data: Mutex<PublicProcData>,
    pub(crate) private_data: Mutex<PrivateProcData>,
}

#[derive(Debug, Default)]
pub struct PublicProcData {
    pub state: ProcState,
    /// Only meaningful while `state` is `Sleeping`
    pub chan: Option<Channel>,
    pub killed: bool,
    pub xstate: i32,
    pub pid: Pid,
    pub sched: SchedEntity,
}

#[derive(Debug)]
pub struct PrivateProcData {
    pub kstack: usize,
    /// Size of user memory below the mapping window
    pub sz: usize,
    pub page_table: Option<PageTable>,
    /// Physical page holding the trap frame
    trapframe: Option<usize>,
    pub name: &'static str,
    pub ofile: [Option<Arc<File>>; NOFILE],
}

impl PrivateProcData {
    fn new(kstack: usize) -> Self {
        Self {
            kstack,
            sz: 0,
            page_table: None,
            trapframe: None,
            name: "",
            ofile: Default::default(),
        }
    }

    pub fn trapframe(&mut self) -> Option<&mut TrapFrame> {
        #[allow(clippy::cast_ptr_alignment)]
        self.trapframe
            .map(|physical| unsafe { &mut *(physical as *mut TrapFrame) })
    }

    /// Page table of a live process
    /// # Panics
    /// Panics if the slot has no address space, which only unused slots lack.
    pub fn page_table(&mut self) -> &mut PageTable {
        match self.page_table.as_mut() {
            Some(page_table) => page_table,
            None => panic!("proc: no page table"),
        }
    }
}

/// Per-CPU state
#[derive(Debug, Default)]
pub(crate) struct Cpu {
    /// The process running on this CPU, if any
    pub(crate) proc: Mutex<Option<ProcRef>>,
}

pub(crate) struct ProcTable {
    pub(crate) pool: [Proc; NPROC],
    /// `parents[i]` is the parent of the process in slot `i`
    pub(crate) parents: Mutex<[Option<ProcRef>; NPROC]>,
    next_pid: Mutex<Pid>,
    pub(crate) init_proc: Once<ProcRef>,
    pub(crate) cpus: [Cpu; NCPU],
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            pool: core::array::from_fn(|slot| Proc {
                public_data: Mutex::new(PublicProcData::default()),
                private_data: Mutex::new(PrivateProcData::new(kstack(slot))),
            }),
            parents: Mutex::new([None; NPROC]),
            next_pid: Mutex::new(1),
            init_proc: Once::new(),
            cpus: Default::default(),
        }
    }

    fn allocpid(&self) -> Pid {
        let mut next_pid = self.next_pid.lock();
        let pid = *next_pid;
        *next_pid += 1;
        pid
    }

    pub(crate) fn get(&self, me: ProcRef) -> &Proc {
        &self.pool[me.slot]
    }
}

/// Kernel stack of `slot`, each followed by an unmapped guard page
fn kstack(slot: usize) -> usize {
    TRAMPOLINE - (slot + 1) * (KSTACK_PAGES + 1) * PAGE_SIZE
}

impl Kernel {
    /// Find an unused slot and set it up with a fresh pid, trap frame and
    /// page table. The slot is returned with its lock held.
    pub(crate) fn allocproc(&self) -> Result<(ProcRef, MutexGuard<'_, PublicProcData>), ProcError> {
        for (slot, p) in self.procs.pool.iter().enumerate() {
            let mut inner = p.public_data.lock();
            if inner.state != ProcState::Unused {
                continue;
            }

            inner.pid = self.procs.allocpid();
            inner.state = ProcState::Used;
            inner.sched = SchedEntity::new();
            let me = ProcRef {
                slot,
                pid: inner.pid,
            };

            if let Err(err) = self.build_address_space(p) {
                self.freeproc(me, &mut inner);
                return Err(err);
            }
            return Ok((me, inner));
        }
        Err(ProcError::NoFreeSlot)
    }

    fn build_address_space(&self, p: &Proc) -> Result<(), ProcError> {
        let mut data = p.private_data.lock();
        let trapframe = self.kmem.alloc_page().ok_or(VmError::OutOfMemory)?;
        let page = unsafe { page_bytes(trapframe) };
        page.fill(0);
        data.trapframe = Some(trapframe);
        let kernel_sp = data.kstack + KSTACK_PAGES * PAGE_SIZE;
        if let Some(frame) = data.trapframe() {
            frame.kernel_sp = kernel_sp as u64;
        }
        data.page_table = Some(self.proc_pagetable(trapframe)?);
        Ok(())
    }

    /// An empty user page table with only the trampoline and trap frame mapped
    fn proc_pagetable(&self, trapframe: usize) -> Result<PageTable, VmError> {
        let mut page_table = PageTable::new()?;
        page_table.map_pages(
            TRAMPOLINE,
            PAGE_SIZE,
            self.machine.trampoline(),
            PteFlags::R | PteFlags::X,
        )?;
        page_table.map_pages(TRAPFRAME, PAGE_SIZE, trapframe, PteFlags::R | PteFlags::W)?;
        Ok(page_table)
    }

    /// Release everything hanging off a slot and mark it unused.
    /// The caller holds the slot's lock.
    pub(crate) fn freeproc(&self, me: ProcRef, inner: &mut PublicProcData) {
        let leftover = self.mappings(me);
        {
            let mut data = self.procs.get(me).private_data.lock();
            if let Some(trapframe) = data.trapframe.take() {
                self.kmem.free_page(trapframe);
            }
            let size = data.sz;
            if let Some(mut page_table) = data.page_table.take() {
                page_table.unmap(TRAMPOLINE, 1, None);
                page_table.unmap(TRAPFRAME, 1, None);
                // Records outlive the process, their pages do not.
                for area in &leftover {
                    page_table.unmap(area.addr, area.length / PAGE_SIZE, Some(self.kmem));
                }
                page_table.free(self.kmem, size);
            }
            data.sz = 0;
            data.name = "";
            data.ofile = Default::default();
        }

        if !leftover.is_empty() {
            warn!(
                "freeproc: pid {} still owns {} mapping record(s)",
                me.pid,
                leftover.len()
            );
        }

        inner.pid = 0;
        inner.chan = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcState::Unused;
    }

    /// Create the root process from an in-memory image loaded at address 0.
    /// # Panics
    /// Panics if a root process already exists.
    pub fn user_init(&self, image: &[u8]) -> Result<ProcRef, ProcError> {
        assert!(!self.procs.init_proc.is_completed(), "user_init: root exists");
        let (me, mut inner) = self.allocproc()?;

        let loaded = self.with_data(me, |data| -> Result<(), VmError> {
            let size = PGROUNDUP!(image.len()).max(PAGE_SIZE);
            let page_table = data.page_table();
            page_table.uvm_alloc(self.kmem, 0, size, PteFlags::W | PteFlags::X)?;
            page_table.copyout(0, image)?;
            data.sz = size;
            data.name = "initcode";
            if let Some(frame) = data.trapframe() {
                frame.epc = 0;
                frame.sp = size as u64;
            }
            Ok(())
        });
        if let Err(err) = loaded {
            self.freeproc(me, &mut inner);
            return Err(err.into());
        }

        self.procs.init_proc.call_once(|| me);
        inner.state = ProcState::Runnable;
        info!("user_init: root process is pid {}", me.pid);
        Ok(me)
    }

    /// Grow or shrink user memory by `n` bytes, returning the old size.
    /// The heap may not grow into the mapping window.
    pub fn growproc(&self, me: ProcRef, n: isize) -> Result<usize, ProcError> {
        self.with_data(me, |data| {
            let size = data.sz;
            let new_size = if n > 0 {
                let target = size
                    .checked_add(n.unsigned_abs())
                    .filter(|&target| target <= MMAPBASE)
                    .ok_or(VmError::BadAddress(size))?;
                data.page_table()
                    .uvm_alloc(self.kmem, size, target, PteFlags::W)?
            } else if n < 0 {
                let target = size.saturating_sub(n.unsigned_abs());
                data.page_table().uvm_dealloc(self.kmem, size, target)
            } else {
                size
            };
            data.sz = new_size;
            Ok(size)
        })
    }

    /// Mark `pid` killed. A sleeping victim is made runnable so it notices
    /// on its way back to user space.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        for p in &self.procs.pool {
            let mut inner = p.public_data.lock();
            if inner.state != ProcState::Unused && inner.pid == pid {
                inner.killed = true;
                if inner.state == ProcState::Sleeping {
                    inner.state = ProcState::Runnable;
                }
                info!("kill: pid {pid}");
                return Ok(());
            }
        }
        Err(ProcError::NoSuchProcess(pid))
    }

    pub fn setkilled(&self, me: ProcRef) {
        self.procs.get(me).public_data.lock().killed = true;
    }

    #[must_use]
    pub fn killed(&self, me: ProcRef) -> bool {
        self.procs.get(me).public_data.lock().killed
    }

    /// Find a live process by pid
    #[must_use]
    pub fn lookup(&self, pid: Pid) -> Option<ProcRef> {
        self.procs.pool.iter().enumerate().find_map(|(slot, p)| {
            let inner = p.public_data.lock();
            (inner.state != ProcState::Unused && inner.pid == pid)
                .then_some(ProcRef { slot, pid })
        })
    }

    /// Run `f` on the public data of the live process `pid`
    pub(crate) fn with_pid<T>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut PublicProcData) -> T,
    ) -> Result<T, ProcError> {
        for p in &self.procs.pool {
            let mut inner = p.public_data.lock();
            if inner.state != ProcState::Unused && inner.pid == pid {
                return Ok(f(&mut inner));
            }
        }
        Err(ProcError::NoSuchProcess(pid))
    }

    pub fn with_data<T>(&self, me: ProcRef, f: impl FnOnce(&mut PrivateProcData) -> T) -> T {
        f(&mut self.procs.get(me).private_data.lock())
    }

    /// Run `f` on the saved user registers of `me`
    /// # Panics
    /// Panics if `me` has no trap frame, which only unused slots lack.
    pub fn with_trapframe<T>(&self, me: ProcRef, f: impl FnOnce(&mut TrapFrame) -> T) -> T {
        self.with_data(me, |data| match data.trapframe() {
            Some(frame) => f(frame),
            None => panic!("proc: no trapframe"),
        })
    }

    /// Install `file` in the lowest free descriptor of `me`
    pub fn fdalloc(&self, me: ProcRef, file: Arc<File>) -> Result<usize, ProcError> {
        self.with_data(me, |data| {
            let fd = data
                .ofile
                .iter()
                .position(Option::is_none)
                .ok_or(ProcError::NoFreeFd)?;
            data.ofile[fd] = Some(file);
            Ok(fd)
        })
    }

    pub fn close(&self, me: ProcRef, fd: usize) -> Result<(), ProcError> {
        self.with_data(me, |data| {
            data.ofile
                .get_mut(fd)
                .and_then(Option::take)
                .map(|_| ())
                .ok_or(ProcError::BadFd(fd))
        })
    }

    #[must_use]
    pub fn file(&self, me: ProcRef, fd: usize) -> Option<Arc<File>> {
        self.with_data(me, |data| data.ofile.get(fd).cloned().flatten())
    }

    pub fn copyout(&self, me: ProcRef, destination: usize, source: &[u8]) -> Result<(), VmError> {
        self.with_data(me, |data| data.page_table().copyout(destination, source))
    }

    pub fn copyin(&self, me: ProcRef, destination: &mut [u8], source: usize) -> Result<(), VmError> {
        self.with_data(me, |data| data.page_table().copyin(destination, source))
    }

    /// Process running on `cpu`, if any
    #[must_use]
    pub fn running_on(&self, cpu: usize) -> Option<ProcRef> {
        *self.procs.cpus[cpu].proc.lock()
    }

    /// First code a newly dispatched process runs.
    /// # Safety
    /// Must be called exactly once, by `me` itself, right after the scheduler
    /// dispatched it for the first time: the scheduler's lock on `me` is
    /// still held and is released here.
    pub unsafe fn forkret(&self, me: ProcRef) {
        unsafe { self.procs.get(me).public_data.force_unlock() };
    }
}
