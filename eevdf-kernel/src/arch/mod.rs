//! What the kernel needs from the hardware underneath it.

use crate::proc::ProcRef;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

/// The platform the kernel runs on.
///
/// Register-level trap entry and the context switch itself live behind this
/// trait. The kernel only ever asks to run a process on a CPU and to switch
/// from a process back to whichever CPU is running it.
pub trait Machine: Sync {
    /// Physical address of the trampoline page, mapped into every process
    fn trampoline(&self) -> usize;

    /// Switch from the scheduler of `cpu` to `proc`, returning once `proc`
    /// calls [`Machine::switch_to_scheduler`]. A process dispatched for the
    /// first time must start by calling [`crate::Kernel::forkret`].
    fn run(&self, cpu: usize, proc: ProcRef);

    /// Switch from `proc` back to the scheduler that ran it, returning when
    /// some scheduler runs `proc` again
    fn switch_to_scheduler(&self, proc: ProcRef);

    /// Drop cached translations on this CPU after a page table change
    fn flush_tlb(&self) {
        #[cfg(target_arch = "riscv64")]
        riscv64::flush_tlb();
    }

    fn intr_on(&self) {
        #[cfg(target_arch = "riscv64")]
        riscv64::intr_on();
    }

    /// Mask interrupts until the trap return path is back in user mode
    fn intr_off(&self) {
        #[cfg(target_arch = "riscv64")]
        riscv64::intr_off();
    }

    /// Service a device interrupt
    fn device_interrupt(&self) {}
}
