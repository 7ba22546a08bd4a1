//! Physical memory layout.
//!
//! qemu -machine virt puts things like this, per its hw/riscv/virt.c:
//!
//! ```text
//! 0x0c00_0000 -- PLIC
//! 0x1000_0000 -- UART0
//! 0x1000_1000 -- virtio disk
//! 0x8000_0000 -- boot ROM jumps here in machine mode; -kernel loads here
//! ```
//!
//! The kernel uses physical memory from 0x8000_0000 up:
//! text, then data/bss, then `end`..`PHYS_TOP` for page allocation.

use super::{PAGE_SIZE, VirtAddr};
use crate::param::NPROC;

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

// virtio mmio interface
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

// qemu puts the platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;

pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}

pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}

pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

/// Start of kernel text.
pub const KERN_BASE: usize = 0x8000_0000;

/// One past the last byte of RAM the kernel uses (128 MiB).
pub const PHYS_TOP: usize = KERN_BASE + 128 * 1024 * 1024;

/// End of kernel text, from kernel.ld.
pub fn text_end() -> usize {
    unsafe extern "C" {
        #[link_name = "etext"]
        static ETEXT: [u8; 0];
    }
    (&raw const ETEXT).addr()
}

/// First address after the kernel image, from kernel.ld.
pub fn kernel_end() -> usize {
    unsafe extern "C" {
        #[link_name = "end"]
        static END: [u8; 0];
    }
    (&raw const END).addr()
}

// User/kernel shared layout at the top of the address space:
//
//   TRAMPOLINE  (the highest page; same mapping in every address space)
//   TRAPFRAME   (user page tables only)
//   kstacks     (kernel page table only, each with a guard page below)

pub const TRAMPOLINE: VirtAddr = VirtAddr::MAX.byte_sub(PAGE_SIZE);

pub const TRAPFRAME: VirtAddr = TRAMPOLINE.byte_sub(PAGE_SIZE);

/// Kernel stack of process slot `p`: one page, plus an unmapped guard
/// page below it.
pub const fn kstack(p: usize) -> VirtAddr {
    assert!(p < NPROC);
    TRAMPOLINE.byte_sub((p + 1) * 2 * PAGE_SIZE)
}
