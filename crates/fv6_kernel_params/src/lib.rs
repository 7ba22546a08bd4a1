//! Compile-time configuration shared by the kernel, mkfs and the tests.
#![no_std]

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum number of blocks any single FS operation writes.
pub const MAX_OP_BLOCKS: usize = 10;

/// Maximum data blocks in the on-disk log.
pub const LOG_SIZE: usize = MAX_OP_BLOCKS * 3;

/// Size of the disk block cache.
pub const NBUF: usize = MAX_OP_BLOCKS * 3;

/// Maximum length of a file path.
pub const MAX_PATH: usize = 128;

/// Maximum number of `exec` arguments.
pub const MAX_ARG: usize = 32;

/// Size of the file-system image in blocks.
pub const FS_SIZE: usize = 2000;

/// Number of inodes in the file-system image.
pub const NUM_FS_INODES: usize = 200;
