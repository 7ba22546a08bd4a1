//! Physical page allocator, for user memory, kernel stacks, page-table
//! pages and pipe buffers.
//!
//! A free list of whole 4096-byte pages threaded through the pages
//! themselves.

use core::ptr::{self, NonNull};

use crate::{
    memory::{
        PAGE_SIZE,
        addr::page_roundup,
        layout::{PHYS_TOP, kernel_end},
    },
    sync::SpinLock,
};

struct Run {
    next: Option<NonNull<Run>>,
}

unsafe impl Send for Run {}

static FREE_LIST: SpinLock<Run> = SpinLock::new(Run { next: None });

/// Hands every page between the end of the kernel image and `PHYS_TOP`
/// to the free list.
pub fn init() {
    let mut pa = page_roundup(kernel_end());
    while pa + PAGE_SIZE <= PHYS_TOP {
        unsafe {
            free_page(NonNull::new(ptr::with_exposed_provenance_mut(pa)).unwrap());
        }
        pa += PAGE_SIZE;
    }
}

/// Returns a page to the free list.
///
/// # Safety
///
/// `pa` must be a whole page obtained from [`alloc_page`] (or RAM given
/// to `init`) with no live references into it.
pub unsafe fn free_page(pa: NonNull<u8>) {
    let addr = pa.addr().get();
    assert_eq!(addr % PAGE_SIZE, 0, "freeing unaligned page");
    assert!(addr >= kernel_end() && addr < PHYS_TOP, "freeing bad page");

    // Fill with junk to catch dangling refs.
    unsafe {
        pa.write_bytes(1, PAGE_SIZE);
    }

    let mut run = pa.cast::<Run>();
    let mut free_list = FREE_LIST.lock();
    unsafe {
        run.as_mut().next = free_list.next;
    }
    free_list.next = Some(run);
}

/// Allocates one 4096-byte page, or `None` when memory is exhausted.
pub fn alloc_page() -> Option<NonNull<u8>> {
    let mut free_list = FREE_LIST.lock();
    let run = free_list.next?;
    free_list.next = unsafe { run.as_ref().next };
    drop(free_list);

    let page = run.cast::<u8>();
    // Fill with junk.
    unsafe {
        page.write_bytes(5, PAGE_SIZE);
    }
    Some(page)
}

/// Allocates one zeroed page.
pub fn alloc_zeroed_page() -> Option<NonNull<u8>> {
    let page = alloc_page()?;
    unsafe {
        page.write_bytes(0, PAGE_SIZE);
    }
    Some(page)
}
