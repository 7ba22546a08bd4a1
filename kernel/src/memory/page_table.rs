//! Sv39 page tables.
//!
//! Three levels of 512 PTEs. A 64-bit virtual address splits into:
//!
//! ```text
//!     39..=63 -- must be zero.
//!     30..=38 -- 9 bits of level-2 index.
//!     21..=29 -- 9 bits of level-1 index.
//!     12..=20 -- 9 bits of level-0 index.
//!      0..=11 -- 12 bits of byte offset within the page.
//! ```

use core::ptr::NonNull;

use bitflags::bitflags;

use super::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr, page};
use crate::error::KernelError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid.
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(usize);

impl PtEntry {
    const fn new(pa: PhysAddr, flags: PtEntryFlags) -> Self {
        Self((pa.page_num() << 10) | flags.bits())
    }

    fn phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 >> 10) << PAGE_SHIFT)
    }

    fn flags(self) -> PtEntryFlags {
        PtEntryFlags::from_bits_truncate(self.0)
    }

    fn is_valid(self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// A valid PTE with any of R/W/X maps a page; without, it points at
    /// the next-level table.
    fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    fn is_table(self) -> bool {
        self.is_valid() && !self.flags().intersects(PtEntryFlags::RWX)
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
pub struct PageTable([PtEntry; 512]);

impl PageTable {
    /// Allocates an empty page-table page.
    pub fn try_alloc() -> Result<NonNull<PageTable>, KernelError> {
        let page = page::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
        Ok(page.cast())
    }

    fn index(level: usize, va: VirtAddr) -> usize {
        (va.addr() >> (PAGE_SHIFT + 9 * level)) & 0x1ff
    }

    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(core::ptr::from_ref(self).addr())
    }

    /// The value to load into satp to use this table.
    pub fn satp(&self) -> usize {
        const SATP_SV39: usize = 8 << 60;
        SATP_SV39 | self.phys_addr().page_num()
    }

    /// Returns the level-0 PTE for `va`, optionally allocating
    /// intermediate table pages.
    fn walk_mut(&mut self, va: VirtAddr, alloc: bool) -> Result<&mut PtEntry, KernelError> {
        assert!(va < VirtAddr::MAX);

        let mut pt = self;
        for level in [2, 1] {
            let pte = &mut pt.0[Self::index(level, va)];
            if !pte.is_valid() {
                if !alloc {
                    return Err(KernelError::BadAddress);
                }
                let next = Self::try_alloc()?;
                *pte = PtEntry::new(PhysAddr::from_ptr(next), PtEntryFlags::V);
            }
            assert!(pte.is_table());
            pt = unsafe { pte.phys_addr().as_ptr::<PageTable>().as_mut() };
        }
        Ok(&mut pt.0[Self::index(0, va)])
    }

    fn walk(&self, va: VirtAddr) -> Result<&PtEntry, KernelError> {
        assert!(va < VirtAddr::MAX);

        let mut pt = self;
        for level in [2, 1] {
            let pte = &pt.0[Self::index(level, va)];
            if !pte.is_table() {
                return Err(KernelError::BadAddress);
            }
            pt = unsafe { pte.phys_addr().as_ptr::<PageTable>().as_ref() };
        }
        Ok(&pt.0[Self::index(0, va)])
    }

    /// Maps the page at `va` to `pa`.
    ///
    /// `va` must be page-aligned and not already mapped.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "map_page: unaligned va {va:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX));

        let pte = self.walk_mut(va, true)?;
        assert!(!pte.is_valid(), "map_page: remap of va {va:#x}");
        *pte = PtEntry::new(pa, perm | PtEntryFlags::V);
        Ok(())
    }

    /// Maps `size` bytes starting at `va` to physical memory starting at
    /// `pa`. `va` and `size` must be page-aligned.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(size % PAGE_SIZE == 0 && size > 0);

        for off in (0..size).step_by(PAGE_SIZE) {
            self.map_page(va.byte_add(off), pa.byte_add(off), perm)?;
        }
        Ok(())
    }

    /// Unmaps `npages` pages starting at `va`, which must all be mapped
    /// leaves. If `free_frames`, also returns the underlying pages to
    /// the allocator.
    pub fn unmap_pages(&mut self, va: VirtAddr, npages: usize, free_frames: bool) {
        assert!(va.is_page_aligned());

        for i in 0..npages {
            let va = va.byte_add(i * PAGE_SIZE);
            let pte = self.walk_mut(va, false).expect("unmap: not mapped");
            assert!(pte.is_leaf(), "unmap: not a leaf");
            if free_frames {
                unsafe {
                    page::free_page(pte.phys_addr().as_ptr());
                }
            }
            pte.clear();
        }
    }

    /// Resolves `va` to the physical address of its page, requiring the
    /// mapping to carry all of `required` (e.g. `U | W` for a user
    /// destination).
    pub fn translate(&self, va: VirtAddr, required: PtEntryFlags) -> Result<PhysAddr, KernelError> {
        let pte = self.walk(va)?;
        if !pte.is_leaf() || !pte.flags().contains(required | PtEntryFlags::V) {
            return Err(KernelError::BadAddress);
        }
        Ok(pte.phys_addr())
    }

    /// The physical page and flags behind `va`, for address-space
    /// duplication.
    pub fn leaf(&self, va: VirtAddr) -> Result<(PhysAddr, PtEntryFlags), KernelError> {
        let pte = self.walk(va)?;
        if !pte.is_leaf() {
            return Err(KernelError::BadAddress);
        }
        Ok((pte.phys_addr(), pte.flags()))
    }

    /// Removes PTE_U from the mapping at `va`; used for stack guard
    /// pages.
    pub fn forbid_user(&mut self, va: VirtAddr) {
        let pte = self.walk_mut(va, false).expect("forbid_user: not mapped");
        *pte = PtEntry::new(pte.phys_addr(), pte.flags() - PtEntryFlags::U);
    }

    /// Frees every page-table page reachable from `root`.
    ///
    /// # Safety
    ///
    /// All leaf mappings must already have been removed, and nothing may
    /// use the table afterwards.
    pub unsafe fn free(root: NonNull<PageTable>) {
        let pt = unsafe { root.as_ref() };
        for pte in &pt.0 {
            if pte.is_table() {
                unsafe {
                    Self::free(pte.phys_addr().as_ptr());
                }
            } else {
                assert!(!pte.is_valid(), "freeing page table with live leaf");
            }
        }
        unsafe {
            page::free_page(root.cast());
        }
    }
}
