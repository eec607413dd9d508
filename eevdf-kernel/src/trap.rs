use crate::error::ProcError;
use crate::mmap::FaultKind;
use crate::param::{MMAPBASE, MMAP_REGION_SIZE};
use crate::proc::{ProcRef, ProcState};
use crate::sleep::Channel;
use crate::Kernel;
use log::{trace, warn};
use num_enum::TryFromPrimitive;

/// User registers saved by the trampoline, plus what it needs to get back
/// into the kernel. Lives in its own page, mapped at [`crate::vm::TRAPFRAME`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

/// Synchronous `scause` codes
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Exception {
    InstructionMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadMisaligned = 4,
    LoadAccessFault = 5,
    StoreMisaligned = 6,
    StoreAccessFault = 7,
    UserEnvCall = 8,
    SupervisorEnvCall = 9,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

/// Asynchronous `scause` codes, with the interrupt bit stripped
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    SupervisorTimer = 5,
    SupervisorExternal = 9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
    Unknown(u64),
}

impl Trap {
    pub const INTERRUPT_BIT: u64 = 1 << 63;

    #[must_use]
    pub fn decode(scause: u64) -> Self {
        if scause & Self::INTERRUPT_BIT == 0 {
            Exception::try_from(scause).map_or(Self::Unknown(scause), Self::Exception)
        } else {
            Interrupt::try_from(scause & !Self::INTERRUPT_BIT)
                .map_or(Self::Unknown(scause), Self::Interrupt)
        }
    }
}

fn in_mmap_window(address: u64) -> bool {
    (MMAPBASE as u64..(MMAPBASE + MMAP_REGION_SIZE) as u64).contains(&address)
}

impl Kernel {
    /// Handle a trap taken from user mode by `me`.
    ///
    /// The entry path has already saved the user pc in the trap frame.
    /// Returns when `me` may go back to user space; never returns if `me`
    /// is killed along the way.
    #[allow(clippy::cast_possible_truncation)]
    pub fn usertrap(&self, me: ProcRef, scause: u64, stval: u64) {
        match Trap::decode(scause) {
            Trap::Exception(Exception::UserEnvCall) => {
                if self.killed(me) {
                    self.exit(me, -1);
                }
                self.with_trapframe(me, |frame| frame.epc += 4);
                self.machine.intr_on();
                self.syscall(me);
            }
            Trap::Interrupt(Interrupt::SupervisorTimer) => self.clock_interrupt(Some(me)),
            Trap::Interrupt(Interrupt::SupervisorExternal) => self.machine.device_interrupt(),
            Trap::Exception(cause @ (Exception::LoadPageFault | Exception::StorePageFault))
                if in_mmap_window(stval) =>
            {
                let kind = if cause == Exception::StorePageFault {
                    FaultKind::Write
                } else {
                    FaultKind::Read
                };
                if let Err(err) = self.handle_mmap_fault(me, stval as usize, kind) {
                    warn!(
                        "usertrap(): pid {} bad access at {stval:#x}: {err:?}",
                        me.pid()
                    );
                    self.setkilled(me);
                }
            }
            trap => {
                let epc = self.with_trapframe(me, |frame| frame.epc);
                warn!(
                    "usertrap(): unexpected {trap:?} pid={} sepc={epc:#x} stval={stval:#x}",
                    me.pid()
                );
                self.setkilled(me);
            }
        }

        if self.killed(me) {
            self.exit(me, -1);
        }
        self.machine.intr_off();
    }

    /// Timer tick on some CPU, running `current` if it is not idle.
    ///
    /// Advances the tick counter, wakes tick sleepers and charges the tick
    /// to `current`, which yields once its quantum is used up.
    pub fn clock_interrupt(&self, current: Option<ProcRef>) {
        {
            let mut ticks = self.ticks.lock();
            *ticks += 1;
            self.wakeup(Channel::Ticks);
        }

        let Some(me) = current else {
            return;
        };
        let exhausted = {
            let mut inner = self.procs.get(me).public_data.lock();
            inner.state == ProcState::Running && inner.sched.account_tick()
        };
        if exhausted {
            trace!("clock: pid {} used its quantum", me.pid());
            self.yield_cpu(me);
        }
    }

    /// Sleep for `n` ticks, re-checking at every tick
    pub fn sleep_ticks(&self, me: ProcRef, n: u64) -> Result<(), ProcError> {
        let mut ticks = self.ticks.lock();
        let start = *ticks;
        while *ticks - start < n {
            if self.killed(me) {
                return Err(ProcError::Killed);
            }
            ticks = self.sleep(me, Channel::Ticks, &self.ticks, ticks);
        }
        Ok(())
    }

    /// Ticks since boot
    #[must_use]
    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }
}
