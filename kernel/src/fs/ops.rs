//! Multi-step name-space operations: create, link, unlink.

use fv6_fs_types::{NAME_LEN, T_DEVICE, T_DIR, T_FILE};

use crate::error::KernelError;

use super::{Inode, Tx, TxInode, path};

/// Creates `path` as an inode of type `ty` (file, directory or device
/// node). Open-with-create maps onto this: creating an existing file is
/// fine, any other collision is an error.
pub fn create<'tx>(
    tx: &'tx Tx<false>,
    cwd: &Inode,
    path: &[u8],
    ty: i16,
    major: i16,
    minor: i16,
) -> Result<TxInode<'tx, false>, KernelError> {
    let mut name = [0; NAME_LEN];
    let (mut parent_ip, name) = path::resolve_parent(tx, cwd, path, &mut name)?;

    let mut parent_locked = parent_ip.lock();
    let Some(mut parent_dir) = parent_locked.as_dir() else {
        return Err(KernelError::NotADirectory);
    };

    if let Some((mut child_ip, _off)) = parent_dir.lookup(name) {
        // Already exists; opening an existing file is not an error.
        drop(parent_dir);
        drop(parent_locked);
        let child_locked = child_ip.lock();
        if ty == T_FILE && (child_locked.ty() == T_FILE || child_locked.ty() == T_DEVICE) {
            drop(child_locked);
            return Ok(child_ip);
        }
        return Err(KernelError::AlreadyExists);
    }

    let mut child_ip = TxInode::alloc(tx, parent_dir.inner().dev(), ty)?;
    let mut child_locked = child_ip.lock();
    child_locked.data_mut().major = major;
    child_locked.data_mut().minor = minor;
    child_locked.data_mut().nlink = 1;
    child_locked.update();

    let res = (|| {
        if let Some(mut child_dir) = child_locked.as_dir() {
            // "." and ".."; the ".." link on the parent is counted once
            // success is certain.
            child_dir.link(b".", child_dir.ino())?;
            let parent_ino = parent_dir.ino();
            child_dir.link(b"..", parent_ino)?;
        }

        parent_dir.link(name, child_locked.ino())?;

        if child_locked.is_dir() {
            // Now that success is guaranteed: ".." refers to the parent.
            parent_dir.inner().data_mut().nlink += 1;
            parent_dir.inner().update();
        }
        Ok(())
    })();

    if let Err(err) = res {
        // Undo the allocation: dropping the zero-linked inode frees it.
        child_locked.data_mut().nlink = 0;
        child_locked.update();
        drop(child_locked);
        child_ip.put();
        return Err(err);
    }

    drop(child_locked);
    Ok(child_ip)
}

/// Creates `new_path` as another name for the inode at `old_path`.
/// Directories cannot be linked.
pub fn link(tx: &Tx<false>, cwd: &Inode, old_path: &[u8], new_path: &[u8]) -> Result<(), KernelError> {
    let mut old_ip = path::resolve(tx, cwd, old_path)?;
    let mut old_locked = old_ip.lock();

    if old_locked.is_dir() {
        return Err(KernelError::LinkToDirectory);
    }

    // Bump the link count first; undone below if the new name cannot be
    // created.
    old_locked.data_mut().nlink += 1;
    old_locked.update();
    let dev = old_locked.dev();
    let ino = old_locked.ino();
    drop(old_locked);

    let res = (|| {
        let mut name = [0; NAME_LEN];
        let (mut parent_ip, name) = path::resolve_parent(tx, cwd, new_path, &mut name)?;
        let mut parent_locked = parent_ip.lock();
        if parent_locked.dev() != dev {
            return Err(KernelError::CrossesDevices);
        }
        let Some(mut parent_dir) = parent_locked.as_dir() else {
            return Err(KernelError::NotADirectory);
        };
        parent_dir.link(name, ino)
    })();

    if res.is_err() {
        let mut old_locked = old_ip.lock();
        old_locked.data_mut().nlink -= 1;
        old_locked.update();
    }
    res
}

/// Removes the directory entry at `path`. Directories must be empty;
/// "." and ".." cannot be unlinked.
pub fn unlink(tx: &Tx<false>, cwd: &Inode, path: &[u8]) -> Result<(), KernelError> {
    let mut name = [0; NAME_LEN];
    let (mut parent_ip, name) = path::resolve_parent(tx, cwd, path, &mut name)?;

    if name == b"." || name == b".." {
        return Err(KernelError::InvalidArgument);
    }

    let mut parent_locked = parent_ip.lock();
    let Some(mut parent_dir) = parent_locked.as_dir() else {
        return Err(KernelError::NotADirectory);
    };

    let Some((mut child_ip, off)) = parent_dir.lookup(name) else {
        return Err(KernelError::NoSuchEntry);
    };
    let mut child_locked = child_ip.lock();

    assert!(child_locked.nlink() > 0, "unlink: nlink < 1");
    if let Some(mut child_dir) = child_locked.as_dir() {
        if !child_dir.is_empty() {
            return Err(KernelError::DirectoryNotEmpty);
        }
    }

    parent_dir.unlink_at(off)?;
    if child_locked.is_dir() {
        // The child's ".." no longer refers to the parent.
        parent_dir.inner().data_mut().nlink -= 1;
        parent_dir.inner().update();
    }
    drop(parent_dir);
    drop(parent_locked);
    parent_ip.put();

    child_locked.data_mut().nlink -= 1;
    child_locked.update();
    drop(child_locked);
    child_ip.put();

    Ok(())
}
