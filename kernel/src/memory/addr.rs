//! Address newtypes and page rounding.

use core::{fmt, ptr::NonNull};

use super::{PAGE_SHIFT, PAGE_SIZE};

pub const fn page_roundup(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn page_rounddown(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// A user or kernel virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl VirtAddr {
    /// One beyond the highest usable virtual address: one bit less than
    /// Sv39 allows, to avoid having to sign-extend addresses with the
    /// high bit set.
    pub const MAX: Self = Self(1 << (9 * 3 + PAGE_SHIFT - 1));

    pub const fn new(addr: usize) -> Self {
        assert!(addr <= Self::MAX.0, "virtual address out of range");
        Self(addr)
    }

    /// Like `new`, but user-supplied addresses get an error instead of a
    /// panic.
    pub const fn checked(addr: usize) -> Option<Self> {
        if addr <= Self::MAX.0 { Some(Self(addr)) } else { None }
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn byte_add(self, offset: usize) -> Self {
        Self::new(self.0 + offset)
    }

    pub const fn byte_sub(self, offset: usize) -> Self {
        Self(self.0 - offset)
    }

    pub const fn page_roundup(self) -> Self {
        Self::new(page_roundup(self.0))
    }

    pub const fn page_rounddown(self) -> Self {
        Self(page_rounddown(self.0))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: NonNull<T>) -> Self {
        Self(ptr.addr().get())
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn byte_add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Physical page number, as stored in PTEs and satp.
    pub const fn page_num(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    pub fn as_ptr<T>(self) -> NonNull<T> {
        NonNull::new(core::ptr::with_exposed_provenance_mut(self.0)).unwrap()
    }
}
