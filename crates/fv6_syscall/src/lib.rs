//! The fv6 system-call ABI, shared by the kernel and user space.
//!
//! A system call is a synchronous trap: the number goes in `a7`, up to six
//! integer/pointer arguments in `a0`..`a5`, and the result comes back in
//! `a0`. Non-negative results are success values; small negative results
//! encode a [`SyscallError`].
#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use dataview::Pod;
use strum::FromRepr;

/// System call numbers (`a7`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum SyscallCode {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
}

bitflags! {
    /// `open(2)` mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: usize {
        const READ_ONLY = 0x000;
        const WRITE_ONLY = 0x001;
        const READ_WRITE = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

/// Errors surfaced to user space, encoded as `-(err as isize)` in `a0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum SyscallError {
    /// Path or directory entry does not exist.
    NoSuchFile = 1,
    /// A non-directory appeared where a directory was required.
    NotADirectory = 2,
    /// Entry already exists (create/link collisions).
    Exists = 3,
    /// Out of disk blocks or on-disk inodes.
    NoSpace = 4,
    /// Out of memory (pages, process slots, table entries).
    NoMemory = 5,
    /// File descriptor is out of range, closed, or opened the wrong way.
    BadFileDescriptor = 6,
    /// A user pointer did not survive page-table validation.
    Fault = 7,
    /// `wait` with nothing to wait for.
    NoChildren = 8,
    /// The calling process has been killed.
    Killed = 9,
    /// Invalid argument (bad exec image, bad pid, directory misuse, ...).
    Invalid = 10,
    /// Write to a pipe with no readers.
    BrokenPipe = 11,
    /// File grew past `MAX_FILE_BLOCKS`.
    FileTooLarge = 12,
}

impl SyscallError {
    /// The in-register encoding, e.g. `NoSuchFile` -> `-1usize` pattern.
    #[must_use]
    pub fn encode(self) -> usize {
        (-(self as isize)) as usize
    }

    /// Recovers an error from a raw syscall return value.
    #[must_use]
    pub fn decode(raw: usize) -> Option<Self> {
        let signed = raw as isize;
        if signed >= 0 {
            return None;
        }
        Self::from_repr(signed.unsigned_abs())
    }
}

/// Conventional exit status of a killed process.
pub const KILLED_EXIT_STATUS: i32 = -1;

/// File kinds reported by `fstat`.
pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEVICE: i16 = 3;

/// `fstat(2)` result, copied out through the user page table.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct Stat {
    /// Device the file lives on.
    pub dev: u32,
    /// Inode number.
    pub ino: u32,
    /// File type (`T_DIR` / `T_FILE` / `T_DEVICE`).
    pub ty: i16,
    /// Link count.
    pub nlink: i16,
    _pad: u32,
    /// Size in bytes.
    pub size: u64,
}
const _: () = assert!(size_of::<Stat>() == 24);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_encoding_round_trips() {
        for err in [
            SyscallError::NoSuchFile,
            SyscallError::NoChildren,
            SyscallError::FileTooLarge,
        ] {
            let raw = err.encode();
            assert!((raw as isize) < 0);
            assert_eq!(SyscallError::decode(raw), Some(err));
        }
    }

    #[test]
    fn success_values_are_not_errors() {
        assert_eq!(SyscallError::decode(0), None);
        assert_eq!(SyscallError::decode(42), None);
    }

    #[test]
    fn syscall_code_round_trips() {
        assert_eq!(SyscallCode::from_repr(1), Some(SyscallCode::Fork));
        assert_eq!(SyscallCode::from_repr(7), Some(SyscallCode::Exec));
        assert_eq!(SyscallCode::from_repr(21), Some(SyscallCode::Close));
        assert_eq!(SyscallCode::from_repr(22), None);
        assert_eq!(SyscallCode::from_repr(0), None);
    }
}
