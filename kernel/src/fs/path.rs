//! Path resolution.

use fv6_fs_types::{InodeNo, NAME_LEN};

use crate::error::KernelError;

use super::{Inode, ROOT_DEV, Tx, TxInode};

/// Splits off the first path element.
///
/// Returns the element and the remainder with leading slashes removed,
/// or `None` when nothing is left:
///
/// ```text
/// skip_elem(b"a/bb/c")  == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")       == Some((b"a", b""))
/// skip_elem(b"///")     == None
/// ```
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let (elem, path) = path.split_at(end);
    let next = path.iter().position(|&c| c != b'/').unwrap_or(path.len());
    Some((elem, &path[next..]))
}

/// Walks `path` and returns its inode.
///
/// Relative paths start at `cwd`. Must run inside a transaction, since
/// releasing intermediate inodes may free them.
pub fn resolve<'tx, const READ_ONLY: bool>(
    tx: &'tx Tx<READ_ONLY>,
    cwd: &Inode,
    path: &[u8],
) -> Result<TxInode<'tx, READ_ONLY>, KernelError> {
    resolve_impl(tx, cwd, path, false, &mut [0; NAME_LEN]).map(|(ip, _)| ip)
}

/// Walks `path` up to its final element; returns the parent directory
/// and the final name. `nameiparent("/")` is an error.
pub fn resolve_parent<'tx, 'n, const READ_ONLY: bool>(
    tx: &'tx Tx<READ_ONLY>,
    cwd: &Inode,
    path: &[u8],
    name_out: &'n mut [u8; NAME_LEN],
) -> Result<(TxInode<'tx, READ_ONLY>, &'n [u8]), KernelError> {
    let (ip, name_len) = resolve_impl(tx, cwd, path, true, name_out)?;
    Ok((ip, &name_out[..name_len]))
}

fn resolve_impl<'tx, const READ_ONLY: bool>(
    tx: &'tx Tx<READ_ONLY>,
    cwd: &Inode,
    path: &[u8],
    want_parent: bool,
    name_out: &mut [u8; NAME_LEN],
) -> Result<(TxInode<'tx, READ_ONLY>, usize), KernelError> {
    let mut ip = if path.first() == Some(&b'/') {
        TxInode::get(tx, ROOT_DEV, InodeNo::ROOT)
    } else {
        cwd.dup().into_tx(tx)
    };
    let mut name_len = 0;

    let mut rest = path;
    while let Some((name, after)) = skip_elem(rest) {
        rest = after;
        name_len = usize::min(name.len(), NAME_LEN);
        name_out[..name_len].copy_from_slice(&name[..name_len]);
        name_out[name_len..].fill(0);

        let mut locked = ip.lock();
        let Some(mut dir) = locked.as_dir() else {
            return Err(KernelError::NotADirectory);
        };

        if want_parent && rest.is_empty() {
            // Stop one level early, unlocked.
            drop(dir);
            drop(locked);
            return Ok((ip, name_len));
        }

        let Some((next, _off)) = dir.lookup(name) else {
            return Err(KernelError::NoSuchEntry);
        };

        // Release the directory after obtaining the child's reference
        // but before locking the child: with aliased paths (".", double
        // entries) the child may be this very directory.
        drop(dir);
        drop(locked);
        ip.put();
        ip = next;
    }

    if want_parent {
        return Err(KernelError::NoSuchEntry);
    }
    Ok((ip, name_len))
}
