//! Trap vector for interrupts taken while in supervisor mode.

use core::arch::naked_asm;

use super::trap;

/// Interrupts and exceptions from kernel code come here, on the current
/// kernel stack: push the caller-saved registers, run the Rust handler,
/// pop, and return to whatever was interrupted. kernel.ld aligns this
/// for stvec.
#[unsafe(naked)]
#[unsafe(link_section = ".text.kvec")]
pub extern "C" fn kernel_vec() {
    naked_asm!(
        // make room to save registers.
        "addi sp, sp, -256",
        // save caller-saved registers.
        "sd ra, 0(sp)",
        "sd sp, 8(sp)",
        "sd gp, 16(sp)",
        "sd tp, 24(sp)",
        "sd t0, 32(sp)",
        "sd t1, 40(sp)",
        "sd t2, 48(sp)",
        "sd a0, 72(sp)",
        "sd a1, 80(sp)",
        "sd a2, 88(sp)",
        "sd a3, 96(sp)",
        "sd a4, 104(sp)",
        "sd a5, 112(sp)",
        "sd a6, 120(sp)",
        "sd a7, 128(sp)",
        "sd t3, 216(sp)",
        "sd t4, 224(sp)",
        "sd t5, 232(sp)",
        "sd t6, 240(sp)",
        // call the Rust handler.
        "call {trap_kernel}",
        // restore registers.
        "ld ra, 0(sp)",
        "ld sp, 8(sp)",
        "ld gp, 16(sp)",
        // not tp (contains the hartid), in case we moved CPUs
        "ld t0, 32(sp)",
        "ld t1, 40(sp)",
        "ld t2, 48(sp)",
        "ld a0, 72(sp)",
        "ld a1, 80(sp)",
        "ld a2, 88(sp)",
        "ld a3, 96(sp)",
        "ld a4, 104(sp)",
        "ld a5, 112(sp)",
        "ld a6, 120(sp)",
        "ld a7, 128(sp)",
        "ld t3, 216(sp)",
        "ld t4, 224(sp)",
        "ld t5, 232(sp)",
        "ld t6, 240(sp)",
        "addi sp, sp, 256",
        // return to whatever we were doing in the kernel.
        "sret",
        trap_kernel = sym trap::trap_kernel,
    )
}
