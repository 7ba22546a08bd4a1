pub mod addr;
pub mod layout;
pub mod page;
pub mod page_table;
pub mod vm_kernel;
pub mod vm_user;

pub use self::addr::{PhysAddr, VirtAddr};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
