//! Process-related system calls.

use crate::{
    error::KernelError,
    interrupt::timer::{TICKS, TICKS_UPDATED},
    proc::{self, Proc, ProcId, ProcPrivateData},
    syscall::{arg_addr, arg_int},
};

pub fn sys_fork(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let pid = proc::fork(p, private)?;
    Ok(pid.get() as usize)
}

pub fn sys_exit(p: &'static Proc, private: &mut ProcPrivateData) -> ! {
    let status = arg_int(private, 0) as i32;
    proc::exit(p, private, status)
}

pub fn sys_wait(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 0);
    let pid = proc::wait(p, private, addr)?;
    Ok(pid.get() as usize)
}

pub fn sys_kill(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let pid = arg_int(private, 0) as i32;
    proc::kill(ProcId::new(pid))?;
    Ok(0)
}

pub fn sys_getpid(p: &'static Proc) -> Result<usize, KernelError> {
    Ok(p.shared().lock().pid().get() as usize)
}

pub fn sys_sbrk(private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let n = arg_int(private, 0) as isize;
    let old_size = private.size();
    proc::grow(private, n)?;
    Ok(old_size)
}

/// Sleeps for n timer ticks.
pub fn sys_sleep(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let n = arg_int(private, 0) as u64;
    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < n {
        if p.shared().lock().killed() {
            return Err(KernelError::Killed);
        }
        ticks = TICKS_UPDATED.wait(ticks);
    }
    Ok(0)
}

pub fn sys_uptime() -> Result<usize, KernelError> {
    Ok(*TICKS.lock() as usize)
}
