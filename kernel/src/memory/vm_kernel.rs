//! The kernel's direct-map page table.

use core::ptr::NonNull;

use riscv::asm;

use super::{
    PAGE_SIZE, PhysAddr, VirtAddr,
    layout::{KERN_BASE, PHYS_TOP, PLIC, TRAMPOLINE, UART0, VIRTIO0, kernel_end, text_end},
    page_table::{PageTable, PtEntryFlags},
};
use crate::{interrupt::trampoline, proc, sync::Once};

struct KernelPageTable(NonNull<PageTable>);

unsafe impl Send for KernelPageTable {}
unsafe impl Sync for KernelPageTable {}

static KERNEL_PAGE_TABLE: Once<KernelPageTable> = Once::new();

/// Builds the kernel page table. Runs once, on the boot hart.
pub fn init() {
    use PtEntryFlags as F;

    let mut root = PageTable::try_alloc().expect("boot: out of memory");
    let pt = unsafe { root.as_mut() };

    let mut ident_map = |addr: usize, size: usize, perm| {
        pt.map_pages(VirtAddr::new(addr), size, PhysAddr::new(addr), perm)
            .unwrap();
    };

    // uart registers
    ident_map(UART0, PAGE_SIZE, F::RW);

    // virtio mmio disk interface
    ident_map(VIRTIO0, PAGE_SIZE, F::RW);

    // PLIC
    ident_map(PLIC, 0x40_0000, F::RW);

    // kernel text, executable and read-only.
    ident_map(KERN_BASE, text_end() - KERN_BASE, F::RX);

    // kernel data and the physical RAM we'll make use of.
    ident_map(text_end(), PHYS_TOP - text_end(), F::RW);

    // the trampoline, at the highest virtual address in the kernel too.
    pt.map_pages(
        TRAMPOLINE,
        PAGE_SIZE,
        PhysAddr::new(trampoline::base_addr()),
        F::RX,
    )
    .unwrap();

    // a kernel stack (plus guard page) for each process slot.
    proc::map_stacks(pt);

    KERNEL_PAGE_TABLE.init(KernelPageTable(root));
}

/// Loads the kernel page table into satp and enables paging. Runs on
/// every hart.
pub fn init_hart() {
    // wait for any previous writes to page-table memory to finish.
    asm::sfence_vma_all();

    let pt = unsafe { KERNEL_PAGE_TABLE.get().0.as_ref() };
    unsafe {
        riscv::register::satp::write(riscv::register::satp::Satp::from_bits(pt.satp()));
    }

    // flush stale entries from the TLB.
    asm::sfence_vma_all();
}
