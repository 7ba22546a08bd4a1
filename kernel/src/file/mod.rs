//! Open files: a fixed table of reference-counted open-file objects
//! shared across fork and dup.

use core::{
    cell::UnsafeCell,
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use fv6_fs_types::{BLOCK_SIZE, T_DEVICE, T_DIR, T_FILE};
use fv6_syscall::Stat;

use crate::{
    error::KernelError,
    fs::{self, Inode},
    memory::vm_user::{self, DstBuf, SrcBuf},
    param::{MAX_OP_BLOCKS, NFILE},
    proc::ProcPrivateData,
    sync::SpinLock,
};

pub mod device;
mod pipe;

pub use self::device::{Device, register_device};

use self::pipe::Pipe;

/// What an open file refers to.
enum FileKind {
    None,
    Pipe {
        pipe: NonNull<Pipe>,
        write_end: bool,
    },
    Inode {
        inode: Inode,
    },
    Device {
        major: i16,
        inode: Inode,
    },
}

unsafe impl Send for FileKind {}

/// One open-file object. `readable`/`writable`/`kind` are fixed at
/// open; `off` is shared by every descriptor that refers here (that
/// sharing is the point of the table).
struct FilePayload {
    readable: bool,
    writable: bool,
    kind: FileKind,
    off: AtomicUsize,
}

struct Payloads([UnsafeCell<FilePayload>; NFILE]);

// Payload slots are written only at allocation and release, both under
// the reference-count lock with the count at zero; in between they are
// only read.
unsafe impl Sync for Payloads {}

static PAYLOADS: Payloads = Payloads(
    [const {
        UnsafeCell::new(FilePayload {
            readable: false,
            writable: false,
            kind: FileKind::None,
            off: AtomicUsize::new(0),
        })
    }; NFILE],
);

static REFCNT: SpinLock<[u32; NFILE]> = SpinLock::new([0; NFILE]);

fn alloc(readable: bool, writable: bool, kind: FileKind) -> Result<File, KernelError> {
    let mut refcnt = REFCNT.lock();
    let Some(slot) = refcnt.iter().position(|&c| c == 0) else {
        // The caller still owns whatever `kind` refers to; hand it back
        // through the normal release path.
        drop(refcnt);
        release_kind(kind);
        return Err(KernelError::FileTableFull);
    };
    refcnt[slot] = 1;
    // Safety: count was zero, so no other reference to this payload
    // exists.
    unsafe {
        *PAYLOADS.0[slot].get() = FilePayload {
            readable,
            writable,
            kind,
            off: AtomicUsize::new(0),
        };
    }
    Ok(File { slot })
}

fn release_kind(kind: FileKind) {
    match kind {
        FileKind::None => {}
        FileKind::Pipe { pipe, write_end } => pipe::close(pipe, write_end),
        FileKind::Inode { inode } | FileKind::Device { inode, .. } => {
            let tx = fs::begin_tx();
            inode.into_tx(&tx).put();
            tx.end();
        }
    }
}

/// A counted handle on an open-file object.
pub struct File {
    slot: usize,
}

impl File {
    /// Two connected pipe ends: (read, write).
    pub fn new_pipe() -> Result<(File, File), KernelError> {
        pipe::new_pair()
    }

    pub fn new_inode(inode: Inode, readable: bool, writable: bool) -> Result<File, KernelError> {
        alloc(readable, writable, FileKind::Inode { inode })
    }

    pub fn new_device(
        major: i16,
        inode: Inode,
        readable: bool,
        writable: bool,
    ) -> Result<File, KernelError> {
        alloc(readable, writable, FileKind::Device { major, inode })
    }

    fn payload(&self) -> &FilePayload {
        // Safety: holding a File keeps the count positive, so the
        // payload is read-only.
        unsafe { &*PAYLOADS.0[self.slot].get() }
    }

    /// Takes another reference to the same open file.
    pub fn dup(&self) -> File {
        REFCNT.lock()[self.slot] += 1;
        File { slot: self.slot }
    }

    /// Releases this reference (drop does the same; this reads better
    /// at call sites).
    pub fn close(self) {
        drop(self);
    }

    /// Reads up to `n` bytes into user memory at `addr`.
    pub fn read(
        &self,
        private: &mut ProcPrivateData,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let payload = self.payload();
        if !payload.readable {
            return Err(KernelError::FileNotReadable);
        }

        match &payload.kind {
            FileKind::Pipe { pipe, .. } => unsafe { pipe.as_ref() }.read(private, addr, n),
            FileKind::Inode { inode } => {
                let tx = fs::begin_readonly_tx();
                let mut ip = inode.dup().into_tx(&tx);
                let mut locked = ip.lock();
                let off = payload.off.load(Ordering::Relaxed);
                let read = locked.read(
                    &mut DstBuf::User {
                        pt: private.pagetable(),
                        addr,
                        len: n,
                    },
                    off,
                    n,
                )?;
                payload.off.fetch_add(read, Ordering::Relaxed);
                Ok(read)
            }
            FileKind::Device { major, .. } => (device::get(*major)?.read)(private, addr, n),
            FileKind::None => unreachable!("read on a free file slot"),
        }
    }

    /// Writes `n` bytes from user memory at `addr`.
    pub fn write(
        &self,
        private: &mut ProcPrivateData,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let payload = self.payload();
        if !payload.writable {
            return Err(KernelError::FileNotWritable);
        }

        match &payload.kind {
            FileKind::Pipe { pipe, .. } => unsafe { pipe.as_ref() }.write(private, addr, n),
            FileKind::Inode { inode } => {
                // Write a few blocks at a time so a single huge write
                // cannot overrun the log's per-operation budget:
                // inode + indirect + allocation bitmap, plus two blocks
                // of slop for unaligned ends.
                let max = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BLOCK_SIZE;
                let mut done = 0;
                while done < n {
                    let chunk = usize::min(n - done, max);

                    let tx = fs::begin_tx();
                    let mut ip = inode.dup().into_tx(&tx);
                    let mut locked = ip.lock();
                    let off = payload.off.load(Ordering::Relaxed);
                    let written = locked.write(
                        &SrcBuf::User {
                            pt: private.pagetable(),
                            addr: addr + done,
                            len: chunk,
                        },
                        off,
                        chunk,
                    )?;
                    payload.off.fetch_add(written, Ordering::Relaxed);
                    drop(locked);
                    ip.put();
                    tx.end();

                    done += written;
                    if written < chunk {
                        // Out of space; report the short count.
                        break;
                    }
                }
                Ok(done)
            }
            FileKind::Device { major, .. } => (device::get(*major)?.write)(private, addr, n),
            FileKind::None => unreachable!("write on a free file slot"),
        }
    }

    /// Copies file metadata to user memory at `addr`.
    pub fn stat(&self, private: &mut ProcPrivateData, addr: usize) -> Result<(), KernelError> {
        let inode = match &self.payload().kind {
            FileKind::Inode { inode } | FileKind::Device { inode, .. } => inode,
            _ => return Err(KernelError::InvalidArgument),
        };

        let tx = fs::begin_readonly_tx();
        let mut ip = inode.dup().into_tx(&tx);
        let locked = ip.lock();
        let mut st = <Stat as dataview::PodMethods>::zeroed();
        st.dev = locked.dev().value();
        st.ino = locked.ino().value();
        st.ty = match locked.ty() {
            T_DIR => fv6_syscall::T_DIR,
            T_FILE => fv6_syscall::T_FILE,
            T_DEVICE => fv6_syscall::T_DEVICE,
            _ => return Err(KernelError::InvalidArgument),
        };
        st.nlink = locked.nlink();
        st.size = u64::from(locked.size());
        drop(locked);
        ip.put();
        tx.end();

        vm_user::copy_out(private.pagetable(), addr, &st)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let mut refcnt = REFCNT.lock();
        assert!(refcnt[self.slot] > 0);
        refcnt[self.slot] -= 1;
        if refcnt[self.slot] > 0 {
            return;
        }

        // Last reference: pull the payload's resources out under the
        // lock (the slot may be re-allocated the moment it is dropped),
        // release them after.
        let kind = unsafe {
            mem::replace(&mut (*PAYLOADS.0[self.slot].get()).kind, FileKind::None)
        };
        drop(refcnt);

        release_kind(kind);
    }
}
