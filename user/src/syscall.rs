//! Raw system-call stubs: load the number into a7, ecall, return a0.

use core::arch::naked_asm;

pub use fv6_syscall::{OpenFlags, Stat, SyscallCode, SyscallError};

macro_rules! syscall {
    ($code:expr => $(#[$attr:meta])* fn $name:ident($($params:tt)*) -> $ret:ty) => {
        $(#[$attr])*
        #[unsafe(naked)]
        pub extern "C" fn $name($($params)*) -> $ret {
            naked_asm!(
                "li a7, {code}",
                "ecall",
                "ret",
                code = const $code as usize,
            )
        }
    };
    ($code:expr => $(#[$attr:meta])* unsafe fn $name:ident($($params:tt)*) -> $ret:ty) => {
        $(#[$attr])*
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name($($params)*) -> $ret {
            naked_asm!(
                "li a7, {code}",
                "ecall",
                "ret",
                code = const $code as usize,
            )
        }
    };
}

syscall!(SyscallCode::Fork => fn fork() -> isize);
syscall!(SyscallCode::Exit => fn exit(status: i32) -> !);
syscall!(
    SyscallCode::Wait =>
    /// # Safety
    ///
    /// `wstatus` must be null or a valid pointer to an `i32`.
    unsafe fn wait(wstatus: *mut i32) -> isize
);
syscall!(
    SyscallCode::Pipe =>
    /// # Safety
    ///
    /// `pipefd` must be a valid pointer to an array of two `i32`s.
    unsafe fn pipe(pipefd: *mut i32) -> isize
);
syscall!(
    SyscallCode::Read =>
    /// # Safety
    ///
    /// `buf` must be valid for writes of `count` bytes.
    unsafe fn read(fd: i32, buf: *mut u8, count: usize) -> isize
);
syscall!(SyscallCode::Kill => fn kill(pid: i32) -> isize);
syscall!(
    SyscallCode::Exec =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string and `argv` to a
    /// null-terminated array of NUL-terminated strings.
    unsafe fn exec(path: *const u8, argv: *const *const u8) -> isize
);
syscall!(
    SyscallCode::Fstat =>
    /// # Safety
    ///
    /// `stat` must be a valid pointer to a `Stat`.
    unsafe fn fstat(fd: i32, stat: *mut Stat) -> isize
);
syscall!(
    SyscallCode::Chdir =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string.
    unsafe fn chdir(path: *const u8) -> isize
);
syscall!(SyscallCode::Dup => fn dup(fd: i32) -> isize);
syscall!(SyscallCode::Getpid => fn getpid() -> isize);
syscall!(SyscallCode::Sbrk => fn sbrk(increment: isize) -> isize);
syscall!(SyscallCode::Sleep => fn sleep(ticks: i32) -> isize);
syscall!(SyscallCode::Uptime => fn uptime() -> isize);
syscall!(
    SyscallCode::Open =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string.
    unsafe fn open(path: *const u8, flags: OpenFlags) -> isize
);
syscall!(
    SyscallCode::Write =>
    /// # Safety
    ///
    /// `buf` must be valid for reads of `count` bytes.
    unsafe fn write(fd: i32, buf: *const u8, count: usize) -> isize
);
syscall!(
    SyscallCode::Mknod =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string.
    unsafe fn mknod(path: *const u8, major: i16, minor: i16) -> isize
);
syscall!(
    SyscallCode::Unlink =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string.
    unsafe fn unlink(path: *const u8) -> isize
);
syscall!(
    SyscallCode::Link =>
    /// # Safety
    ///
    /// `oldpath` and `newpath` must point to NUL-terminated strings.
    unsafe fn link(oldpath: *const u8, newpath: *const u8) -> isize
);
syscall!(
    SyscallCode::Mkdir =>
    /// # Safety
    ///
    /// `path` must point to a NUL-terminated string.
    unsafe fn mkdir(path: *const u8) -> isize
);
syscall!(SyscallCode::Close => fn close(fd: i32) -> isize);
