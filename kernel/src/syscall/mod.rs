//! System-call dispatch.
//!
//! The number arrives in a7, arguments in a0..a5, and the result goes
//! back in a0; errors are encoded as small negative values. Pointer
//! arguments are never trusted: every access goes through the user
//! page table.

use fv6_syscall::{SyscallCode, SyscallError};

use crate::{
    error::KernelError,
    memory::vm_user,
    println,
    proc::{Proc, ProcPrivateData},
};

mod file;
mod proc;

/// The `n`th raw system-call argument.
fn arg_raw(private: &ProcPrivateData, n: usize) -> usize {
    let tf = private.trapframe();
    let value = match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("syscall argument index out of range"),
    };
    value as usize
}

fn arg_int(private: &ProcPrivateData, n: usize) -> usize {
    arg_raw(private, n)
}

fn arg_addr(private: &ProcPrivateData, n: usize) -> usize {
    arg_raw(private, n)
}

/// The `n`th argument as a NUL-terminated user string, copied into
/// `buf`.
fn arg_str<'a>(
    private: &ProcPrivateData,
    n: usize,
    buf: &'a mut [u8],
) -> Result<&'a [u8], KernelError> {
    let addr = arg_addr(private, n);
    vm_user::copy_in_str(private.pagetable(), buf, addr)
}

/// Fetches a word from user memory (for argv walking).
fn fetch_addr(private: &ProcPrivateData, addr: usize) -> Result<usize, KernelError> {
    let word: u64 = vm_user::copy_in(private.pagetable(), addr)?;
    Ok(word as usize)
}

/// Decodes and runs one system call; stores the result in a0.
pub fn syscall(p: &'static Proc, private: &mut ProcPrivateData) {
    let n = private.trapframe().a7 as usize;
    let Some(code) = SyscallCode::from_repr(n) else {
        let shared = p.shared().lock();
        println!("{} {}: unknown syscall {n}", shared.pid(), shared.name());
        drop(shared);
        private.trapframe_mut().a0 = SyscallError::Invalid.encode() as u64;
        return;
    };

    let result: Result<usize, KernelError> = match code {
        SyscallCode::Fork => self::proc::sys_fork(p, private),
        SyscallCode::Exit => self::proc::sys_exit(p, private),
        SyscallCode::Wait => self::proc::sys_wait(p, private),
        SyscallCode::Pipe => self::file::sys_pipe(private),
        SyscallCode::Read => self::file::sys_read(private),
        SyscallCode::Kill => self::proc::sys_kill(private),
        SyscallCode::Exec => self::file::sys_exec(p, private),
        SyscallCode::Fstat => self::file::sys_fstat(private),
        SyscallCode::Chdir => self::file::sys_chdir(private),
        SyscallCode::Dup => self::file::sys_dup(private),
        SyscallCode::Getpid => self::proc::sys_getpid(p),
        SyscallCode::Sbrk => self::proc::sys_sbrk(private),
        SyscallCode::Sleep => self::proc::sys_sleep(p, private),
        SyscallCode::Uptime => self::proc::sys_uptime(),
        SyscallCode::Open => self::file::sys_open(private),
        SyscallCode::Write => self::file::sys_write(private),
        SyscallCode::Mknod => self::file::sys_mknod(private),
        SyscallCode::Unlink => self::file::sys_unlink(private),
        SyscallCode::Link => self::file::sys_link(private),
        SyscallCode::Mkdir => self::file::sys_mkdir(private),
        SyscallCode::Close => self::file::sys_close(private),
    };

    let ret = match result {
        Ok(value) => value,
        Err(err) => SyscallError::from(err).encode(),
    };
    private.trapframe_mut().a0 = ret as u64;
}
