//! Kernel-internal errors and their user-visible encodings.

use fv6_syscall::SyscallError;

/// Everything that can go wrong inside a system call.
///
/// Invariant violations are not errors — they panic (see the design
/// notes): silent corruption in a kernel is worse than halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no free process slot")]
    NoFreeProcess,
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("no child process")]
    NoChildren,
    #[error("no such process")]
    ProcessNotFound,
    #[error("bad user address")]
    BadAddress,
    #[error("unterminated user string")]
    UnterminatedString,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file not readable")]
    FileNotReadable,
    #[error("file not writable")]
    FileNotWritable,
    #[error("not a directory")]
    NotADirectory,
    #[error("no such file or directory")]
    NoSuchEntry,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("link crosses devices")]
    CrossesDevices,
    #[error("cannot link a directory")]
    LinkToDirectory,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("file too large")]
    FileTooLarge,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("system file table full")]
    FileTableFull,
    #[error("out of data blocks")]
    OutOfBlocks,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("in-memory inode table full")]
    InodeTableFull,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("invalid executable")]
    InvalidExecutable,
    #[error("process killed")]
    Killed,
    #[error("invalid argument")]
    InvalidArgument,
}

impl From<KernelError> for SyscallError {
    fn from(err: KernelError) -> Self {
        use KernelError as E;
        match err {
            E::NoSuchEntry => Self::NoSuchFile,
            E::NotADirectory => Self::NotADirectory,
            E::AlreadyExists => Self::Exists,
            E::OutOfBlocks | E::OutOfInodes => Self::NoSpace,
            E::NoFreeProcess
            | E::OutOfMemory
            | E::TooManyOpenFiles
            | E::FileTableFull
            | E::InodeTableFull => Self::NoMemory,
            E::BadFileDescriptor | E::FileNotReadable | E::FileNotWritable => {
                Self::BadFileDescriptor
            }
            E::BadAddress | E::UnterminatedString => Self::Fault,
            E::NoChildren => Self::NoChildren,
            E::Killed => Self::Killed,
            E::BrokenPipe => Self::BrokenPipe,
            E::FileTooLarge => Self::FileTooLarge,
            E::ProcessNotFound
            | E::DirectoryNotEmpty
            | E::CrossesDevices
            | E::LinkToDirectory
            | E::ArgumentListTooLong
            | E::InvalidExecutable
            | E::InvalidArgument => Self::Invalid,
        }
    }
}
