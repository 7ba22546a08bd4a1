//! Pipes.
//!
//! Each pipe lives in one page from the page allocator, freed when both
//! ends are closed. Readers and writers block on two condition
//! variables over the pipe's spin lock; a killed process backs out of
//! either loop with an error.

use core::ptr::{self, NonNull};

use char_io::ByteRing;

use crate::{
    error::KernelError,
    memory::{page, vm_user},
    proc::{Proc, ProcPrivateData},
    sync::{SpinLock, SpinLockCondVar},
};

use super::{File, FileKind, alloc};

const PIPE_SIZE: usize = 512;

pub(super) struct Pipe {
    data: SpinLock<PipeData>,
    /// Signalled when bytes (or EOF) become available.
    readable: SpinLockCondVar,
    /// Signalled when buffer space (or reader loss) becomes visible.
    writable: SpinLockCondVar,
}

struct PipeData {
    ring: ByteRing<PIPE_SIZE>,
    /// The read end is still open.
    read_open: bool,
    /// The write end is still open.
    write_open: bool,
}

const _: () = assert!(size_of::<Pipe>() <= crate::memory::PAGE_SIZE);

/// Creates a connected (read, write) pair of files.
pub(super) fn new_pair() -> Result<(File, File), KernelError> {
    let page = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
    let pipe: NonNull<Pipe> = page.cast();
    unsafe {
        pipe.write(Pipe {
            data: SpinLock::new(PipeData {
                ring: ByteRing::new(),
                read_open: true,
                write_open: true,
            }),
            readable: SpinLockCondVar::new(),
            writable: SpinLockCondVar::new(),
        });
    }

    // On failure `alloc` has already closed the end it was given; the
    // page is freed once the other end is closed too — explicitly for
    // the first slot, by dropping `read_file` for the second.
    let read_file = match alloc(true, false, FileKind::Pipe {
        pipe,
        write_end: false,
    }) {
        Ok(file) => file,
        Err(err) => {
            close(pipe, true);
            return Err(err);
        }
    };
    let write_file = alloc(false, true, FileKind::Pipe {
        pipe,
        write_end: true,
    })?;
    Ok((read_file, write_file))
}

/// Closes one end; frees the pipe page once both ends are gone.
pub(super) fn close(pipe: NonNull<Pipe>, write_end: bool) {
    let p = unsafe { pipe.as_ref() };
    let both_closed = {
        let mut data = p.data.lock();
        if write_end {
            data.write_open = false;
            // Readers must observe EOF.
            p.readable.notify();
        } else {
            data.read_open = false;
            // Writers must observe the broken pipe.
            p.writable.notify();
        }
        !data.read_open && !data.write_open
    };

    if both_closed {
        // No file references either end, so no reader or writer can be
        // inside the pipe.
        unsafe {
            ptr::drop_in_place(pipe.as_ptr());
            page::free_page(pipe.cast());
        }
    }
}

impl Pipe {
    pub(super) fn read(
        &self,
        private: &mut ProcPrivateData,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut data = self.data.lock();
        while data.ring.is_empty() && data.write_open {
            if Proc::current().shared().lock().killed() {
                return Err(KernelError::Killed);
            }
            data = self.readable.wait(data);
        }

        let mut done = 0;
        while done < n && !data.ring.is_empty() {
            let byte = [data.ring.pop()];
            if vm_user::copy_out_bytes(private.pagetable(), addr + done, &byte).is_err() {
                break;
            }
            done += 1;
        }
        self.writable.notify();
        Ok(done)
    }

    pub(super) fn write(
        &self,
        private: &mut ProcPrivateData,
        addr: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let mut done = 0;
        let mut data = self.data.lock();
        while done < n {
            if !data.read_open {
                return Err(KernelError::BrokenPipe);
            }
            if Proc::current().shared().lock().killed() {
                return Err(KernelError::Killed);
            }
            if data.ring.is_full() {
                self.readable.notify();
                data = self.writable.wait(data);
                continue;
            }

            let mut byte = [0u8];
            if vm_user::copy_in_bytes(private.pagetable(), &mut byte, addr + done).is_err() {
                break;
            }
            data.ring.push(byte[0]);
            done += 1;
        }
        self.readable.notify();
        Ok(done)
    }
}
