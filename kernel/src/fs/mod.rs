//! The file system.
//!
//! Five layers, bottom up:
//!
//! * blocks: the buffer cache ([`block_io`]) and allocator
//!   ([`data_block`]) over the virtio disk;
//! * log: crash recovery for multi-step updates ([`log`], over the
//!   generic `wal` crate);
//! * inodes: allocation, reading, writing, metadata ([`inode`]);
//! * directories: inodes whose content is a table of names
//!   ([`inode::directory`]);
//! * names: path resolution ([`path`]) and the link/unlink/create
//!   operations ([`ops`]).
//!
//! System-call implementations sit above all of this in
//! `crate::syscall`.

use fv6_fs_types::{BlockNo, SuperBlock};

use crate::sync::Once;

mod data_block;
pub mod block_io;
pub mod inode;
pub mod log;
pub mod ops;
pub mod path;
mod virtio;
pub mod virtio_disk;

pub use self::{
    inode::{Inode, LockedTxInode, TxInode},
    log::{Tx, begin_readonly_tx, begin_tx},
};

/// A disk device number. The kernel runs with a single disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DeviceNo(u32);

impl DeviceNo {
    pub const ROOT: Self = Self(1);

    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

pub const ROOT_DEV: DeviceNo = DeviceNo::ROOT;

// There should be one superblock per disk device, but we run with only
// one device.
static SUPER_BLOCK: Once<SuperBlock> = Once::new();

pub(crate) fn super_block() -> &'static SuperBlock {
    SUPER_BLOCK.get()
}

/// Mounts the root file system: reads and checks the superblock, then
/// brings up the log (running crash recovery).
///
/// Must run in process context — it sleeps on disk I/O — so the first
/// process does it on its way out of the kernel.
pub fn mount(dev: DeviceNo) {
    let mut buf = block_io::get(dev, BlockNo::SUPER_BLOCK);
    let guard = buf.lock().read().unwrap();
    let sb: &SuperBlock = guard.data();
    assert_eq!(sb.magic, SuperBlock::MAGIC, "invalid file system magic");
    SUPER_BLOCK.init(sb.clone());
    drop(guard);
    drop(buf);

    log::init(super_block());
}

/// A long-term reference to the root directory.
pub fn root_inode() -> Inode {
    Inode::get(ROOT_DEV, fv6_fs_types::InodeNo::ROOT)
}
