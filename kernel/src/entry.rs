//! The very first kernel instructions.
//!
//! qemu loads the kernel at 0x8000_0000 and jumps there in machine mode
//! on every hart, with no stack. Give each hart a slice of the boot
//! stack, then call [`start`](crate::start::start).

use core::arch::naked_asm;

use crate::start::{self, STACK_SIZE};

#[unsafe(no_mangle)]
#[unsafe(link_section = ".text.init")]
#[unsafe(naked)]
extern "C" fn _entry() {
    naked_asm!(
        // sp = STACK0 + (hartid + 1) * STACK_SIZE
        "la sp, {stack0}",
        "li a0, {stack_size}",
        "csrr a1, mhartid",
        "addi a1, a1, 1",
        "mul a0, a0, a1",
        "add sp, sp, a0",
        "call {start}",
        // start() does not return, but just in case:
        "1:",
        "wfi",
        "j 1b",
        stack0 = sym start::STACK0,
        stack_size = const STACK_SIZE,
        start = sym start::start,
    )
}
