//! File-system and file-descriptor system calls.

use core::ptr::NonNull;

use fv6_fs_types::{T_DEVICE, T_DIR, T_FILE};
use fv6_syscall::OpenFlags;

use crate::{
    error::KernelError,
    file::File,
    fs,
    memory::{PAGE_SIZE, page, vm_user},
    param::{MAX_ARG, MAX_PATH},
    proc::{Proc, ProcPrivateData, exec},
    syscall::{arg_addr, arg_int, arg_str, fetch_addr},
};

/// The `n`th argument as a file descriptor.
fn arg_fd(private: &ProcPrivateData, n: usize) -> Result<(usize, File), KernelError> {
    let fd = arg_int(private, n);
    let file = private.ofile(fd)?.dup();
    Ok((fd, file))
}

pub fn sys_dup(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let (_fd, file) = arg_fd(private, 0)?;
    private.add_ofile(file)
}

pub fn sys_read(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1);
    let n = arg_int(private, 2);
    let (_fd, file) = arg_fd(private, 0)?;
    file.read(private, addr, n)
}

pub fn sys_write(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1);
    let n = arg_int(private, 2);
    let (_fd, file) = arg_fd(private, 0)?;
    file.write(private, addr, n)
}

pub fn sys_close(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let fd = arg_int(private, 0);
    let file = private.take_ofile(fd)?;
    file.close();
    Ok(0)
}

pub fn sys_fstat(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1);
    let (_fd, file) = arg_fd(private, 0)?;
    file.stat(private, addr)?;
    Ok(0)
}

/// Creates `new` as another name for the file at `old`.
pub fn sys_link(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut old_buf = [0; MAX_PATH];
    let mut new_buf = [0; MAX_PATH];
    let old = arg_str(private, 0, &mut old_buf)?;
    let new = arg_str(private, 1, &mut new_buf)?;

    let tx = fs::begin_tx();
    fs::ops::link(&tx, private.cwd(), old, new)?;
    Ok(0)
}

pub fn sys_unlink(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::begin_tx();
    fs::ops::unlink(&tx, private.cwd(), path)?;
    Ok(0)
}

pub fn sys_open(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mode = OpenFlags::from_bits_retain(arg_int(private, 1));
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::begin_tx();
    let mut ip = if mode.contains(OpenFlags::CREATE) {
        fs::ops::create(&tx, private.cwd(), path, T_FILE, 0, 0)?
    } else {
        let mut ip = fs::path::resolve(&tx, private.cwd(), path)?;
        let locked = ip.lock();
        if locked.is_dir() && mode != OpenFlags::READ_ONLY {
            return Err(KernelError::InvalidArgument);
        }
        drop(locked);
        ip
    };

    let mut locked = ip.lock();

    let readable = !mode.contains(OpenFlags::WRITE_ONLY);
    let writable = mode.contains(OpenFlags::WRITE_ONLY) || mode.contains(OpenFlags::READ_WRITE);
    let file = if locked.is_device() {
        File::new_device(locked.major(), locked.unmanaged(), readable, writable)?
    } else {
        File::new_inode(locked.unmanaged(), readable, writable)?
    };

    if mode.contains(OpenFlags::TRUNC) && locked.ty() == T_FILE {
        locked.truncate();
    }

    private.add_ofile(file)
}

pub fn sys_mkdir(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::begin_tx();
    let ip = fs::ops::create(&tx, private.cwd(), path, T_DIR, 0, 0)?;
    ip.put();
    Ok(0)
}

pub fn sys_mknod(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;
    let major = arg_int(private, 1) as i16;
    let minor = arg_int(private, 2) as i16;

    let tx = fs::begin_tx();
    let ip = fs::ops::create(&tx, private.cwd(), path, T_DEVICE, major, minor)?;
    ip.put();
    Ok(0)
}

pub fn sys_chdir(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::begin_tx();
    let mut ip = fs::path::resolve(&tx, private.cwd(), path)?;
    let locked = ip.lock();
    if !locked.is_dir() {
        return Err(KernelError::NotADirectory);
    }
    let new_cwd = locked.unmanaged();
    drop(locked);
    ip.put();

    let old_cwd = private.update_cwd(new_cwd);
    old_cwd.into_tx(&tx).put();
    Ok(0)
}

pub fn sys_pipe(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let fd_array = arg_addr(private, 0);

    let (read_file, write_file) = File::new_pipe()?;

    let read_fd = private.add_ofile(read_file)?;
    let write_fd = match private.add_ofile(write_file) {
        Ok(fd) => fd,
        Err(err) => {
            private.take_ofile(read_fd)?.close();
            return Err(err);
        }
    };

    let fds = [read_fd as i32, write_fd as i32];
    if let Err(err) = vm_user::copy_out(private.pagetable(), fd_array, &fds) {
        private.take_ofile(read_fd)?.close();
        private.take_ofile(write_fd)?.close();
        return Err(err);
    }
    Ok(0)
}

pub fn sys_exec(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;
    let uargv = arg_addr(private, 1);

    // Copy the argument strings into kernel pages.
    let mut argv: [Option<NonNull<u8>>; MAX_ARG] = [None; MAX_ARG];
    let res = (|| {
        for i in 0.. {
            if i >= argv.len() {
                return Err(KernelError::ArgumentListTooLong);
            }
            let uarg = fetch_addr(private, uargv + i * size_of::<usize>())?;
            if uarg == 0 {
                break;
            }
            let page = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
            argv[i] = Some(page);
            let buf = unsafe { core::slice::from_raw_parts_mut(page.as_ptr(), PAGE_SIZE) };
            let len = vm_user::copy_in_str(private.pagetable(), &mut buf[..PAGE_SIZE - 1], uarg)?
                .len();
            buf[len] = 0;
        }
        Ok(())
    })();

    let ret = res.and_then(|()| exec::exec(p, private, path, &argv));

    for page in argv.into_iter().flatten() {
        unsafe {
            page::free_page(page);
        }
    }
    ret
}
