//! Supervisor-mode helpers for RISC-V ports.

use riscv::register::sstatus;

#[inline]
pub fn flush_tlb() {
    unsafe { riscv::asm::sfence_vma_all() }
}

#[inline]
pub fn intr_on() {
    unsafe { sstatus::set_sie() }
}

#[inline]
pub fn intr_off() {
    unsafe { sstatus::clear_sie() }
}
