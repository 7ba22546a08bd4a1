//! User address spaces: growth, duplication, and the user/kernel copy
//! helpers every pointer-taking system call goes through.

use core::{ptr::NonNull, slice};

use dataview::{Pod, PodMethods as _};

use super::{
    PAGE_SIZE, PhysAddr, VirtAddr,
    addr::page_roundup,
    layout::{TRAMPOLINE, TRAPFRAME},
    page,
    page_table::{PageTable, PtEntryFlags},
};
use crate::error::KernelError;

/// An empty user page table.
pub fn create() -> Result<NonNull<PageTable>, KernelError> {
    PageTable::try_alloc()
}

/// Frees a user page table and the `size` bytes of user memory it maps.
///
/// The trampoline and trapframe mappings are removed but their frames
/// are not freed here: the trampoline is shared, the trapframe is owned
/// by the process slot.
///
/// # Safety
///
/// Nothing may use `root` afterwards.
pub unsafe fn free(mut root: NonNull<PageTable>, size: usize) {
    let pt = unsafe { root.as_mut() };
    pt.unmap_pages(TRAMPOLINE, 1, false);
    pt.unmap_pages(TRAPFRAME, 1, false);
    if size > 0 {
        pt.unmap_pages(VirtAddr::new(0), page_roundup(size) / PAGE_SIZE, true);
    }
    unsafe {
        PageTable::free(root);
    }
}

/// Frees a page table that maps nothing yet.
///
/// # Safety
///
/// Every leaf mapping must already have been removed.
pub unsafe fn free_empty(root: NonNull<PageTable>) {
    unsafe {
        PageTable::free(root);
    }
}

/// Loads the very first process's code at address 0. Used only for the
/// embedded initcode, which is smaller than a page.
pub fn first_load(pt: &mut PageTable, code: &[u8]) {
    assert!(code.len() < PAGE_SIZE, "initcode larger than a page");
    let mem = page::alloc_zeroed_page().unwrap();
    pt.map_page(
        VirtAddr::new(0),
        PhysAddr::from_ptr(mem),
        PtEntryFlags::URWX,
    )
    .unwrap();
    unsafe {
        slice::from_raw_parts_mut(mem.as_ptr(), code.len()).copy_from_slice(code);
    }
}

/// Grows user memory from `old_size` to `new_size`, mapping fresh
/// zeroed user pages readable plus `xperm`. Returns the new size.
pub fn alloc(
    pt: &mut PageTable,
    old_size: usize,
    new_size: usize,
    xperm: PtEntryFlags,
) -> Result<usize, KernelError> {
    if new_size <= old_size {
        return Ok(old_size);
    }

    let mut size = page_roundup(old_size);
    while size < new_size {
        let Some(mem) = page::alloc_zeroed_page() else {
            dealloc(pt, size, old_size);
            return Err(KernelError::OutOfMemory);
        };
        if let Err(err) = pt.map_page(
            VirtAddr::new(size),
            PhysAddr::from_ptr(mem),
            PtEntryFlags::UR | xperm,
        ) {
            unsafe {
                page::free_page(mem);
            }
            dealloc(pt, size, old_size);
            return Err(err);
        }
        size += PAGE_SIZE;
    }
    Ok(new_size)
}

/// Shrinks user memory from `old_size` to `new_size`, freeing the pages
/// in between. Returns the new size.
pub fn dealloc(pt: &mut PageTable, old_size: usize, new_size: usize) -> usize {
    if page_roundup(new_size) < page_roundup(old_size) {
        let npages = (page_roundup(old_size) - page_roundup(new_size)) / PAGE_SIZE;
        pt.unmap_pages(VirtAddr::new(page_roundup(new_size)), npages, true);
    }
    new_size
}

/// Duplicates a parent's address space into an empty child table, for
/// fork: same layout, fresh physical pages, same permissions.
pub fn copy(parent: &PageTable, child: &mut PageTable, size: usize) -> Result<(), KernelError> {
    for off in (0..size).step_by(PAGE_SIZE) {
        let va = VirtAddr::new(off);
        let (pa, flags) = parent.leaf(va).expect("fork: parent page missing");

        let res = (|| {
            let mem = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
            unsafe {
                slice::from_raw_parts_mut(mem.as_ptr(), PAGE_SIZE).copy_from_slice(
                    slice::from_raw_parts(pa.as_ptr::<u8>().as_ptr(), PAGE_SIZE),
                );
            }
            if let Err(err) = child.map_page(va, PhysAddr::from_ptr(mem), flags - PtEntryFlags::V) {
                unsafe {
                    page::free_page(mem);
                }
                return Err(err);
            }
            Ok(())
        })();

        if res.is_err() {
            if off > 0 {
                child.unmap_pages(VirtAddr::new(0), off / PAGE_SIZE, true);
            }
            return res;
        }
    }
    Ok(())
}

fn page_bytes<'a>(pa: PhysAddr) -> &'a [u8; PAGE_SIZE] {
    unsafe { pa.as_ptr::<[u8; PAGE_SIZE]>().as_ref() }
}

fn page_bytes_mut<'a>(pa: PhysAddr) -> &'a mut [u8; PAGE_SIZE] {
    unsafe { pa.as_ptr::<[u8; PAGE_SIZE]>().as_mut() }
}

/// Checks that `addr..addr + len` is a plausible user range before any
/// page-table walk; both tests are needed in case of overflow.
fn user_range(addr: usize, len: usize) -> Result<VirtAddr, KernelError> {
    let end = addr.checked_add(len).ok_or(KernelError::BadAddress)?;
    if VirtAddr::checked(end).is_none() {
        return Err(KernelError::BadAddress);
    }
    VirtAddr::checked(addr).ok_or(KernelError::BadAddress)
}

/// Copies `src` to user address `dst`, in page-bounded chunks validated
/// through the page table.
pub fn copy_out_bytes(pt: &PageTable, dst: usize, mut src: &[u8]) -> Result<(), KernelError> {
    let mut dst = user_range(dst, src.len())?;
    while !src.is_empty() {
        let va0 = dst.page_rounddown();
        let offset = dst.addr() - va0.addr();
        let n = usize::min(PAGE_SIZE - offset, src.len());

        let pa = pt.translate(va0, PtEntryFlags::UW)?;
        page_bytes_mut(pa)[offset..][..n].copy_from_slice(&src[..n]);

        src = &src[n..];
        dst = va0.byte_add(PAGE_SIZE);
    }
    Ok(())
}

/// Copies from user address `src` into `dst`.
pub fn copy_in_bytes(pt: &PageTable, mut dst: &mut [u8], src: usize) -> Result<(), KernelError> {
    let mut src = user_range(src, dst.len())?;
    while !dst.is_empty() {
        let va0 = src.page_rounddown();
        let offset = src.addr() - va0.addr();
        let n = usize::min(PAGE_SIZE - offset, dst.len());

        let pa = pt.translate(va0, PtEntryFlags::UR)?;
        dst[..n].copy_from_slice(&page_bytes(pa)[offset..][..n]);

        dst = &mut dst[n..];
        src = va0.byte_add(PAGE_SIZE);
    }
    Ok(())
}

/// Copies a NUL-terminated string from user address `src` into `dst`;
/// returns the string (without the NUL).
pub fn copy_in_str<'a>(
    pt: &PageTable,
    dst: &'a mut [u8],
    src: usize,
) -> Result<&'a [u8], KernelError> {
    let mut filled = 0;
    let mut src = user_range(src, dst.len())?;
    while filled < dst.len() {
        let va0 = src.page_rounddown();
        let offset = src.addr() - va0.addr();
        let n = usize::min(PAGE_SIZE - offset, dst.len() - filled);

        let pa = pt.translate(va0, PtEntryFlags::UR)?;
        let chunk = &page_bytes(pa)[offset..][..n];
        if let Some(len) = chunk.iter().position(|&b| b == 0) {
            dst[filled..][..len].copy_from_slice(&chunk[..len]);
            return Ok(&dst[..filled + len]);
        }
        dst[filled..][..n].copy_from_slice(chunk);

        filled += n;
        src = va0.byte_add(PAGE_SIZE);
    }
    Err(KernelError::UnterminatedString)
}

/// A copy destination that is either a kernel buffer or a user address
/// range behind a page table. Lets the inode and device layers serve
/// both kinds of caller through one code path.
pub enum DstBuf<'a> {
    Kernel(&'a mut [u8]),
    User {
        pt: &'a PageTable,
        addr: usize,
        len: usize,
    },
}

impl DstBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Kernel(buf) => buf.len(),
            Self::User { len, .. } => *len,
        }
    }

    /// Copies `src` into this buffer at byte offset `off`.
    pub fn copy_from(&mut self, off: usize, src: &[u8]) -> Result<(), KernelError> {
        match self {
            Self::Kernel(buf) => {
                buf[off..off + src.len()].copy_from_slice(src);
                Ok(())
            }
            Self::User { pt, addr, len } => {
                assert!(off + src.len() <= *len);
                copy_out_bytes(pt, *addr + off, src)
            }
        }
    }
}

/// The source-side twin of [`DstBuf`].
pub enum SrcBuf<'a> {
    Kernel(&'a [u8]),
    User {
        pt: &'a PageTable,
        addr: usize,
        len: usize,
    },
}

impl SrcBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Kernel(buf) => buf.len(),
            Self::User { len, .. } => *len,
        }
    }

    /// Copies from this buffer at byte offset `off` into `dst`.
    pub fn copy_to(&self, off: usize, dst: &mut [u8]) -> Result<(), KernelError> {
        match self {
            Self::Kernel(buf) => {
                dst.copy_from_slice(&buf[off..off + dst.len()]);
                Ok(())
            }
            Self::User { pt, addr, len } => {
                assert!(off + dst.len() <= *len);
                copy_in_bytes(pt, dst, *addr + off)
            }
        }
    }
}

/// Copies a structure to user space.
pub fn copy_out<T: Pod>(pt: &PageTable, dst: usize, src: &T) -> Result<(), KernelError> {
    copy_out_bytes(pt, dst, src.as_bytes())
}

/// Fetches a structure from user space.
pub fn copy_in<T: Pod>(pt: &PageTable, src: usize) -> Result<T, KernelError> {
    let mut value = T::zeroed();
    copy_in_bytes(pt, value.as_bytes_mut(), src)?;
    Ok(value)
}
