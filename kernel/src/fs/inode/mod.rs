//! Inodes.
//!
//! An inode describes one unnamed file: type, size, link count, and the
//! blocks holding its content. On disk they live packed in the inode
//! table; in memory a fixed table of `NINODE` slots caches the ones in
//! use.
//!
//! Each in-memory inode goes through the classic state ladder:
//!
//! * referenced: a slot is free while its reference count is zero;
//!   [`Inode::get`]/[`TxInode::get`] find or claim a slot and bump the
//!   count, dropping a [`TxInode`] lowers it. The count (and the
//!   dev/ino identity) are guarded by the table-wide spin lock.
//! * loaded: the cached copy of the on-disk fields is `Some` only after
//!   the first [`TxInode::lock`]; it is guarded by the per-slot sleep
//!   lock and thrown away when the slot is recycled.
//! * allocated on disk: type non-zero. [`TxInode::alloc`] claims one;
//!   the last in-memory reference to an inode with no links frees it.
//!
//! `get` is separate from `lock` so a path walk can hold at most one
//! inode sleep lock at a time: a directory can be unlocked before its
//! child is locked, while the child's reference keeps it alive. That is
//! what breaks the aliased-path deadlock.
//!
//! Handles:
//!
//! * [`Inode`] — a long-term reference (open file, cwd) outside any
//!   transaction. Must be converted back with [`Inode::into_tx`] to be
//!   released, because releasing may free disk blocks.
//! * [`TxInode`] — a reference inside a transaction; dropping it is
//!   `iput`.
//! * [`LockedTxInode`] — a `TxInode` holding the sleep lock, with the
//!   cached fields loaded; the only way to read or write content.

use fv6_fs_types::{BlockNo, Dinode, InodeBlock, InodeNo, NDIRECT, T_DEVICE, T_DIR};

use crate::{
    error::KernelError,
    param::NINODE,
    println,
    sync::{SleepLock, SleepLockGuard, SpinLock, SpinLockGuard},
};

use super::{DeviceNo, Tx, super_block};

mod content;
pub mod directory;

/// Cached copy of the on-disk fields.
pub(crate) struct InodeData {
    pub(crate) ty: i16,
    pub(crate) major: i16,
    pub(crate) minor: i16,
    pub(crate) nlink: i16,
    size: u32,
    addrs: [Option<BlockNo>; NDIRECT + 1],
}

impl InodeData {
    fn from_repr(d: &Dinode) -> Self {
        let mut addrs = [None; NDIRECT + 1];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = d.addr(i);
        }
        Self {
            ty: d.ty,
            major: d.major,
            minor: d.minor,
            nlink: d.nlink,
            size: d.size,
            addrs,
        }
    }

    fn write_repr(&self, d: &mut Dinode) {
        d.ty = self.ty;
        d.major = self.major;
        d.minor = self.minor;
        d.nlink = self.nlink;
        d.size = self.size;
        for (i, slot) in self.addrs.iter().enumerate() {
            d.set_addr(i, *slot);
        }
    }
}

/// Slot identity; free iff `refcnt == 0`.
struct TableEnt {
    dev: DeviceNo,
    ino: InodeNo,
    refcnt: u32,
}

static TABLE: SpinLock<[TableEnt; NINODE]> = SpinLock::new(
    [const {
        TableEnt {
            dev: DeviceNo::new(0),
            ino: InodeNo::new(0),
            refcnt: 0,
        }
    }; NINODE],
);

/// Cached inode contents, one sleep lock per slot. `None` = not loaded.
static DATA: [SleepLock<Option<InodeData>>; NINODE] =
    [const { SleepLock::new(None) }; NINODE];

/// Finds the slot caching (dev, ino), or claims a free one. Returns the
/// slot index with its reference count bumped.
fn table_get(dev: DeviceNo, ino: InodeNo) -> usize {
    let mut table = TABLE.lock();

    let mut empty = None;
    for (i, ent) in table.iter_mut().enumerate() {
        if ent.refcnt > 0 && ent.dev == dev && ent.ino == ino {
            ent.refcnt += 1;
            return i;
        }
        if empty.is_none() && ent.refcnt == 0 {
            empty = Some(i);
        }
    }

    let Some(slot) = empty else {
        panic!("in-memory inode table exhausted");
    };
    table[slot] = TableEnt {
        dev,
        ino,
        refcnt: 1,
    };
    // The previous tenant's cached fields are stale; with no references
    // there can be no sleep-lock holder, so this cannot block.
    *DATA[slot].try_lock().unwrap() = None;
    slot
}

fn table_dup(slot: usize) {
    TABLE.lock()[slot].refcnt += 1;
}

/// A long-term inode reference held outside any transaction (an open
/// file, a working directory).
pub struct Inode {
    dev: DeviceNo,
    ino: InodeNo,
    slot: usize,
}

impl Inode {
    /// References the inode (dev, ino) without touching the disk and
    /// without locking it.
    pub fn get(dev: DeviceNo, ino: InodeNo) -> Self {
        Self {
            dev,
            ino,
            slot: table_get(dev, ino),
        }
    }

    pub fn dup(&self) -> Self {
        table_dup(self.slot);
        Self { ..*self }
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// Re-enters a transaction, which is the only way to drop the
    /// reference: the drop may have to free the inode on disk.
    pub fn into_tx<'tx, const READ_ONLY: bool>(self, tx: &'tx Tx<READ_ONLY>) -> TxInode<'tx, READ_ONLY> {
        let inode = TxInode {
            tx,
            dev: self.dev,
            ino: self.ino,
            slot: self.slot,
        };
        core::mem::forget(self);
        inode
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.dup()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        panic!("Inode dropped outside a transaction; use into_tx().put()");
    }
}

/// An inode reference inside a transaction. Dropping it releases the
/// reference and, for the last reference to an unlinked inode, frees
/// the inode and its content on disk.
pub struct TxInode<'tx, const READ_ONLY: bool> {
    tx: &'tx Tx<READ_ONLY>,
    dev: DeviceNo,
    ino: InodeNo,
    slot: usize,
}

impl<'tx, const READ_ONLY: bool> TxInode<'tx, READ_ONLY> {
    /// References the inode (dev, ino); no disk access, no lock.
    pub fn get(tx: &'tx Tx<READ_ONLY>, dev: DeviceNo, ino: InodeNo) -> Self {
        Self {
            tx,
            dev,
            ino,
            slot: table_get(dev, ino),
        }
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// A long-term handle on the same inode, for storing in the file
    /// table or as a working directory.
    pub fn unmanaged(&self) -> Inode {
        table_dup(self.slot);
        Inode {
            dev: self.dev,
            ino: self.ino,
            slot: self.slot,
        }
    }

    /// Locks the inode, reading it from disk if this slot has not been
    /// loaded yet.
    pub fn lock<'i>(&'i mut self) -> LockedTxInode<'tx, 'i, READ_ONLY> {
        let guard = DATA[self.slot].lock();
        LockedTxInode::load(self.tx, self.dev, self.ino, self.slot, guard)
    }

    /// Releases the reference (drop does the same; this reads better at
    /// call sites).
    pub fn put(self) {
        drop(self);
    }
}

impl<'tx> TxInode<'tx, false> {
    /// Allocates a free on-disk inode with type `ty` and returns a
    /// reference to it.
    pub fn alloc(tx: &'tx Tx<false>, dev: DeviceNo, ty: i16) -> Result<Self, KernelError> {
        let sb = super_block();
        for ino in 1..sb.ninodes {
            let ino = InodeNo::new(ino);
            let mut buf = tx.get_block(dev, sb.inode_block(ino));
            let mut guard = buf.lock().read().unwrap();
            let dinode = guard.data_mut::<InodeBlock>().inode_mut(ino);
            if dinode.is_free() {
                dinode.allocate(ty);
                tx.write(&mut guard);
                drop(guard);
                return Ok(Self::get(tx, dev, ino));
            }
        }
        println!("out of inodes");
        Err(KernelError::OutOfInodes)
    }
}

impl<const READ_ONLY: bool> Drop for TxInode<'_, READ_ONLY> {
    fn drop(&mut self) {
        let mut table = TABLE.lock();
        if table[self.slot].refcnt > 1 {
            table[self.slot].refcnt -= 1;
            return;
        }

        // Last reference. The sole ref is this unlocked handle, so the
        // sleep lock cannot be held.
        let mut guard = DATA[self.slot].try_lock().unwrap();
        let free_on_disk = guard.as_ref().is_some_and(|data| data.nlink == 0);
        if !free_on_disk {
            drop(guard);
            table[self.slot].refcnt -= 1;
            return;
        }

        // No links and no other references: truncate and free on disk.
        // Safe to drop the table lock for the I/O: nlink == 0 means no
        // directory entry can lead a concurrent get() here.
        drop(table);
        {
            let wtx = self.tx.writable();
            let mut locked = LockedTxInode {
                tx: &wtx,
                dev: self.dev,
                ino: self.ino,
                slot: self.slot,
                guard,
            };
            locked.truncate();
            locked.data_mut().ty = 0;
            locked.update();
            *locked.guard = None;
            drop(locked);
            wtx.end();
        }
        TABLE.lock()[self.slot].refcnt -= 1;
    }
}

/// A locked inode: the sleep lock is held and the cached fields are
/// loaded. All content access goes through this.
pub struct LockedTxInode<'tx, 'i, const READ_ONLY: bool> {
    tx: &'tx Tx<READ_ONLY>,
    dev: DeviceNo,
    ino: InodeNo,
    slot: usize,
    guard: SleepLockGuard<'i, Option<InodeData>>,
}

impl<'tx, 'i, const READ_ONLY: bool> LockedTxInode<'tx, 'i, READ_ONLY> {
    fn load(
        tx: &'tx Tx<READ_ONLY>,
        dev: DeviceNo,
        ino: InodeNo,
        slot: usize,
        mut guard: SleepLockGuard<'i, Option<InodeData>>,
    ) -> Self {
        if guard.is_none() {
            let sb = super_block();
            let mut buf = tx.get_block(dev, sb.inode_block(ino));
            let bg = buf.lock().read().unwrap();
            let dinode = bg.data::<InodeBlock>().inode(ino);
            assert_ne!(dinode.ty, 0, "inode_lock: free inode");
            *guard = Some(InodeData::from_repr(dinode));
        }

        Self {
            tx,
            dev,
            ino,
            slot,
            guard,
        }
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    pub fn ty(&self) -> i16 {
        self.data().ty
    }

    pub fn nlink(&self) -> i16 {
        self.data().nlink
    }

    pub fn size(&self) -> u32 {
        self.data().size
    }

    pub fn major(&self) -> i16 {
        self.data().major
    }

    pub fn is_dir(&self) -> bool {
        self.ty() == T_DIR
    }

    pub fn is_device(&self) -> bool {
        self.ty() == T_DEVICE
    }

    /// A long-term handle on the same inode.
    pub fn unmanaged(&self) -> Inode {
        table_dup(self.slot);
        Inode {
            dev: self.dev,
            ino: self.ino,
            slot: self.slot,
        }
    }

    pub(crate) fn data(&self) -> &InodeData {
        self.guard.as_ref().unwrap()
    }

    pub(crate) fn data_mut(&mut self) -> &mut InodeData {
        self.guard.as_mut().unwrap()
    }

    /// Unlocks the inode (drop does the same; this reads better at call
    /// sites).
    pub fn unlock(self) {
        drop(self);
    }
}

impl LockedTxInode<'_, '_, false> {
    /// Copies the cached inode fields back to disk.
    ///
    /// Must be called after every change to a field that lives on disk.
    pub fn update(&mut self) {
        let sb = super_block();
        let mut buf = self.tx.get_block(self.dev, sb.inode_block(self.ino));
        let mut guard = buf.lock().read().unwrap();
        self.data().write_repr(guard.data_mut::<InodeBlock>().inode_mut(self.ino));
        self.tx.write(&mut guard);
    }
}
