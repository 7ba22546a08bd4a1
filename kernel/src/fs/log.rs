//! File-system transactions over the write-ahead log.
//!
//! Most of the mechanism — group commit, absorption, recovery — lives
//! in the `wal` crate; this module instantiates it with kernel lock
//! types and wraps `begin_op`/`end_op` in typestate transaction
//! handles. A [`Tx<false>`] can stage block writes; a [`Tx<true>`]
//! (read-only) cannot, and costs no log reservation.

use fv6_fs_types::{BlockNo, SuperBlock};
use wal::{LogState, Wal};

use crate::{
    param::{MAX_OP_BLOCKS, NBUF},
    sync::{Once, SpinLock, SpinLockCondVar},
};

use super::{
    DeviceNo,
    block_io::{self, BufGuard, BufRef, CacheMutex, DataMutex, VirtioDisk},
};

type KernelWal =
    Wal<'static, VirtioDisk, CacheMutex, DataMutex, SpinLock<LogState>, SpinLockCondVar, NBUF>;

static LOG: Once<KernelWal> = Once::new();

/// Brings up the log over the mounted superblock's log region and
/// replays anything a crash left committed but not installed.
pub(super) fn init(sb: &SuperBlock) {
    LOG.init(Wal::new(
        block_io::cache(),
        sb.logstart as usize,
        sb.nlog as usize,
        MAX_OP_BLOCKS,
    ));
    LOG.get().recover();
}

fn log() -> &'static KernelWal {
    LOG.get()
}

/// A file-system transaction.
///
/// All multi-block updates happen between `begin_tx` and `end` (or
/// drop); the group commits when the last overlapping transaction
/// finishes.
pub struct Tx<const READ_ONLY: bool> {
    owns_op: bool,
}

/// Opens a writing transaction; may sleep until log space is available.
pub fn begin_tx() -> Tx<false> {
    log().begin_op();
    Tx { owns_op: true }
}

/// Opens a read-only transaction: no log reservation, no commit.
pub fn begin_readonly_tx() -> Tx<true> {
    Tx { owns_op: false }
}

impl<const READ_ONLY: bool> Drop for Tx<READ_ONLY> {
    fn drop(&mut self) {
        if self.owns_op {
            log().end_op();
        }
    }
}

impl<const READ_ONLY: bool> Tx<READ_ONLY> {
    /// A referenced buffer for `block_no`, tied to this transaction.
    pub fn get_block(&self, dev: DeviceNo, block_no: BlockNo) -> BufRef {
        block_io::get(dev, block_no)
    }

    /// Closes the transaction (drop does the same; this reads better at
    /// call sites).
    pub fn end(self) {
        drop(self);
    }

    /// A writable transaction for freeing paths reached from generic
    /// code: piggybacks on `self` when already writable, otherwise
    /// opens a fresh one.
    pub fn writable(&self) -> Tx<false> {
        if READ_ONLY {
            begin_tx()
        } else {
            Tx { owns_op: false }
        }
    }
}

impl Tx<false> {
    /// Stages `guard`'s block in this transaction instead of writing it
    /// to disk. Repeated writes of one block absorb into a single log
    /// slot.
    pub fn write<'r>(&self, guard: &mut BufGuard<'r, true>) {
        log().write(guard);
    }
}
