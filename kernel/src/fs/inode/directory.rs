//! Directories: inodes whose content is a packed table of
//! `(inode number, name)` entries.

use dataview::PodMethods as _;
use fv6_fs_types::{DirEntry, InodeNo, T_DIR};

use crate::error::KernelError;

use super::{LockedTxInode, TxInode};

impl<'tx, 'i, const READ_ONLY: bool> LockedTxInode<'tx, 'i, READ_ONLY> {
    /// Views this inode as a directory, if it is one.
    pub fn as_dir<'l>(&'l mut self) -> Option<DirInode<'tx, 'i, 'l, READ_ONLY>> {
        (self.ty() == T_DIR).then_some(DirInode(self))
    }
}

/// A locked inode known to be a directory.
pub struct DirInode<'tx, 'i, 'l, const READ_ONLY: bool>(
    &'l mut LockedTxInode<'tx, 'i, READ_ONLY>,
);

impl<'tx, 'i, 'l, const READ_ONLY: bool> DirInode<'tx, 'i, 'l, READ_ONLY> {
    pub fn inner(&mut self) -> &mut LockedTxInode<'tx, 'i, READ_ONLY> {
        self.0
    }

    pub fn ino(&self) -> InodeNo {
        self.0.ino()
    }

    /// Looks a name up; returns the referenced inode and the entry's
    /// byte offset.
    pub fn lookup(&mut self, name: &[u8]) -> Option<(TxInode<'tx, READ_ONLY>, usize)> {
        let size = self.0.size() as usize;
        for off in (0..size).step_by(size_of::<DirEntry>()) {
            let entry = self.0.read_as::<DirEntry>(off).unwrap();
            let Some(ino) = entry.ino() else { continue };
            if !entry.name_matches(name) {
                continue;
            }
            return Some((TxInode::get(self.0.tx, self.0.dev(), ino), off));
        }
        None
    }

    /// Whether the directory holds nothing but "." and "..".
    pub fn is_empty(&mut self) -> bool {
        let entry_size = size_of::<DirEntry>();
        let size = self.0.size() as usize;
        // The first two entries are "." and "..".
        for off in (2 * entry_size..size).step_by(entry_size) {
            let entry = self.0.read_as::<DirEntry>(off).unwrap();
            if entry.ino().is_some() {
                return false;
            }
        }
        true
    }
}

impl DirInode<'_, '_, '_, false> {
    /// Adds the entry (`name`, `ino`), reusing the first free slot or
    /// growing the directory by one entry.
    pub fn link(&mut self, name: &[u8], ino: InodeNo) -> Result<(), KernelError> {
        // The name must not be present yet.
        if let Some((found, _off)) = self.lookup(name) {
            found.put();
            return Err(KernelError::AlreadyExists);
        }

        let size = self.0.size() as usize;
        assert_eq!(size % size_of::<DirEntry>(), 0, "odd directory size");

        // First free slot, or append.
        let (mut entry, off) = (0..size)
            .step_by(size_of::<DirEntry>())
            .map(|off| (self.0.read_as::<DirEntry>(off).unwrap(), off))
            .find(|(entry, _)| entry.ino().is_none())
            .unwrap_or((DirEntry::zeroed(), size));

        entry.set_name(name);
        entry.set_ino(Some(ino));
        self.0.write_as(off, &entry)
    }

    /// Clears the entry at byte offset `off`.
    pub fn unlink_at(&mut self, off: usize) -> Result<(), KernelError> {
        self.0.write_as(off, &DirEntry::zeroed())
    }
}
