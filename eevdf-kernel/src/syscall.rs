//! System call dispatch.
//!
//! The number comes in `a7` and up to six arguments in `a0..a5`; the result
//! goes back in `a0`. Failures become the sentinel each call documents,
//! usually -1.

use crate::mmap::{MapFlags, Prot, MAP_FAILED};
use crate::proc::ProcRef;
use crate::Kernel;
use log::{trace, warn};
use num_enum::TryFromPrimitive;

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Sysno {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Close = 21,
    Getnice = 22,
    Setnice = 23,
    Ps = 24,
    Meminfo = 25,
    Waitpid = 26,
    Mmap = 27,
    Munmap = 28,
    Freemem = 29,
}

const FAILED: u64 = u64::MAX;

#[allow(clippy::cast_sign_loss)]
fn from_int(value: i64) -> u64 {
    value as u64
}

impl Kernel {
    /// Raw `n`th argument register of `me`
    fn arg(&self, me: ProcRef, n: usize) -> u64 {
        self.with_trapframe(me, |frame| match n {
            0 => frame.a0,
            1 => frame.a1,
            2 => frame.a2,
            3 => frame.a3,
            4 => frame.a4,
            5 => frame.a5,
            _ => panic!("arg: no register {n}"),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn argint(&self, me: ProcRef, n: usize) -> i32 {
        self.arg(me, n) as i32
    }

    #[allow(clippy::cast_possible_truncation)]
    fn argaddr(&self, me: ProcRef, n: usize) -> usize {
        self.arg(me, n) as usize
    }

    /// Run the system call `me` asked for and store its result
    pub fn syscall(&self, me: ProcRef) {
        let number = self.with_trapframe(me, |frame| frame.a7);
        let result = match Sysno::try_from(number) {
            Ok(sysno) => {
                trace!("syscall: pid {} {sysno:?}", me.pid());
                self.dispatch(me, sysno)
            }
            Err(_) => {
                warn!("syscall: pid {} unknown sys call {number}", me.pid());
                FAILED
            }
        };
        self.with_trapframe(me, |frame| frame.a0 = result);
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn dispatch(&self, me: ProcRef, sysno: Sysno) -> u64 {
        match sysno {
            Sysno::Fork => self
                .fork(me)
                .map_or(FAILED, |pid| from_int(pid.into())),
            Sysno::Exit => self.exit(me, self.argint(me, 0)),
            Sysno::Wait => self
                .wait(me, self.argaddr(me, 0))
                .map_or(FAILED, |pid| from_int(pid.into())),
            Sysno::Kill => self.kill(self.argint(me, 0)).map_or(FAILED, |()| 0),
            Sysno::Getpid => from_int(me.pid().into()),
            Sysno::Sbrk => self
                .growproc(me, self.argint(me, 0) as isize)
                .map_or(FAILED, |old| old as u64),
            Sysno::Sleep => {
                let ticks = self.argint(me, 0).max(0) as u64;
                self.sleep_ticks(me, ticks).map_or(FAILED, |()| 0)
            }
            Sysno::Uptime => self.uptime(),
            Sysno::Close => usize::try_from(self.argint(me, 0))
                .ok()
                .and_then(|fd| self.close(me, fd).ok())
                .map_or(FAILED, |()| 0),
            Sysno::Getnice => self
                .getnice(self.argint(me, 0))
                .map_or(FAILED, |nice| from_int(nice.into())),
            Sysno::Setnice => self
                .setnice(self.argint(me, 0), self.argint(me, 1))
                .map_or(FAILED, |old| from_int(old.into())),
            Sysno::Ps => {
                self.ps(Some(me), self.argint(me, 0));
                0
            }
            Sysno::Meminfo => {
                self.meminfo();
                0
            }
            Sysno::Waitpid => self
                .waitpid(me, self.argint(me, 0), self.argaddr(me, 1))
                .map_or(FAILED, |()| 0),
            Sysno::Mmap => self.sys_mmap(me) as u64,
            Sysno::Munmap => {
                let addr = self.argaddr(me, 0);
                usize::try_from(self.argint(me, 1))
                    .ok()
                    .and_then(|length| self.munmap(me, addr, length).ok())
                    .map_or(FAILED, |()| 1)
            }
            Sysno::Freemem => self.freemem() as u64,
        }
    }

    /// `mmap(addr, length, prot, flags, fd, offset)`, 0 on failure
    #[allow(clippy::cast_sign_loss)]
    fn sys_mmap(&self, me: ProcRef) -> usize {
        let addr = self.argaddr(me, 0);
        let (Ok(length), Ok(offset)) = (
            usize::try_from(self.argint(me, 1)),
            usize::try_from(self.argint(me, 5)),
        ) else {
            return MAP_FAILED;
        };
        let (Some(prot), Some(flags)) = (
            Prot::from_bits(self.argint(me, 2) as u32),
            MapFlags::from_bits(self.argint(me, 3) as u32),
        ) else {
            return MAP_FAILED;
        };
        let fd = self.argint(me, 4);

        match self.mmap(me, addr, length, prot, flags, fd, offset) {
            Ok(address) => address,
            Err(err) => {
                trace!("mmap: pid {} failed: {err:?}", me.pid());
                MAP_FAILED
            }
        }
    }
}
