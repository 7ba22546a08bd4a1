//! Kernel behavior tests run from user space.
//!
//! Each test must leave the file system the way it found it; the suite
//! prints `ALL TESTS PASSED` only if every test survives.
#![no_std]
#![no_main]

use core::ptr;

use fv6_user::{println, syscall};
use syscall::{OpenFlags, SyscallError};

#[unsafe(no_mangle)]
fn main(_argc: i32, _argv: *const *const u8) {
    let tests: &[(&str, fn())] = &[
        ("pipe_producer_consumer", pipe_producer_consumer),
        ("fork_race", fork_race),
        ("wait_without_children", wait_without_children),
        ("create_write_read", create_write_read),
        ("link_preserves_inode", link_preserves_inode),
        ("directory_slot_reuse", directory_slot_reuse),
        ("concurrent_link_unlink", concurrent_link_unlink),
        ("file_size_limit", file_size_limit),
        ("kill_sleeping_process", kill_sleeping_process),
        ("sbrk_grows_and_shrinks", sbrk_grows_and_shrinks),
    ];

    for (name, test) in tests {
        println!("usertests: {name}");
        run(*test);
    }
    println!("ALL TESTS PASSED");
}

/// Runs one test in a child so a failing test's exit(1) doesn't take
/// the suite down silently.
fn run(test: fn()) {
    let pid = syscall::fork();
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        test();
        syscall::exit(0);
    }
    let mut status = 0;
    let reaped = unsafe { syscall::wait(&mut status) };
    assert_eq!(reaped, pid, "wrong child reaped");
    if status != 0 {
        println!("FAILED (status {status})");
        syscall::exit(1);
    }
}

fn check(cond: bool, msg: &str) {
    if !cond {
        println!("check failed: {msg}");
        syscall::exit(1);
    }
}

fn open(path: &core::ffi::CStr, flags: OpenFlags) -> i32 {
    let fd = unsafe { syscall::open(path.as_ptr().cast(), flags) };
    fd as i32
}

fn write_all(fd: i32, buf: &[u8]) {
    let n = unsafe { syscall::write(fd, buf.as_ptr(), buf.len()) };
    check(n == buf.len() as isize, "short write");
}

fn read_exact(fd: i32, buf: &mut [u8]) {
    let mut done = 0;
    while done < buf.len() {
        let n = unsafe { syscall::read(fd, buf[done..].as_mut_ptr(), buf.len() - done) };
        check(n > 0, "short read");
        done += n as usize;
    }
}

/// A writes 0..=99 into a pipe (blocking when it fills); B reads
/// exactly those bytes back in order.
fn pipe_producer_consumer() {
    let mut fds = [0i32; 2];
    check(unsafe { syscall::pipe(fds.as_mut_ptr()) } == 0, "pipe");
    let (rd, wr) = (fds[0], fds[1]);

    let pid = syscall::fork();
    check(pid >= 0, "fork");
    if pid == 0 {
        // producer: the ordered bytes, then enough filler to fill the
        // 512-byte pipe and block until the consumer catches up.
        syscall::close(rd);
        let data: [u8; 100] = core::array::from_fn(|i| i as u8);
        write_all(wr, &data);
        let filler: [u8; 1024] = core::array::from_fn(|i| (i % 13) as u8);
        write_all(wr, &filler);
        syscall::close(wr);
        syscall::exit(0);
    }

    // consumer
    syscall::close(wr);
    let mut got = [0u8; 100];
    read_exact(rd, &mut got);
    for (i, &b) in got.iter().enumerate() {
        check(b == i as u8, "byte out of order");
    }
    let mut filler = [0u8; 1024];
    read_exact(rd, &mut filler);
    for (i, &b) in filler.iter().enumerate() {
        check(b == (i % 13) as u8, "filler byte lost or reordered");
    }
    // The producer closed its end; the next read reports end of file.
    let n = unsafe { syscall::read(rd, got.as_mut_ptr(), got.len()) };
    check(n == 0, "expected EOF on drained pipe");
    syscall::close(rd);

    let mut status = 0;
    check(unsafe { syscall::wait(&mut status) } == pid, "wait");
    check(status == 0, "producer failed");
}

/// Four concurrent forkers; after everything is reaped exactly once,
/// no zombies remain (a second wait has nothing to return).
fn fork_race() {
    for _ in 0..4 {
        let pid = syscall::fork();
        check(pid >= 0, "fork");
        if pid == 0 {
            let inner = syscall::fork();
            check(inner >= 0, "inner fork");
            if inner == 0 {
                syscall::exit(0);
            }
            let mut status = 0;
            check(unsafe { syscall::wait(&mut status) } == inner, "inner wait");
            check(unsafe { syscall::wait(&mut status) } < 0, "stray child");
            syscall::exit(0);
        }
    }

    for _ in 0..4 {
        let mut status = 0;
        check(unsafe { syscall::wait(&mut status) } > 0, "outer wait");
        check(status == 0, "forker failed");
    }
    check(
        unsafe { syscall::wait(ptr::null_mut()) } < 0,
        "zombie left behind"
    );
}

fn wait_without_children() {
    let ret = unsafe { syscall::wait(ptr::null_mut()) };
    check(
        SyscallError::decode(ret as usize) == Some(SyscallError::NoChildren),
        "wait should report no children"
    );
}

/// create, write, close, open, read round trip.
fn create_write_read() {
    let fd = open(c"rtfile", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    check(fd >= 0, "create");
    let data: [u8; 1024 + 17] = core::array::from_fn(|i| (i % 251) as u8);
    write_all(fd, &data);
    syscall::close(fd);

    let fd = open(c"rtfile", OpenFlags::READ_ONLY);
    check(fd >= 0, "open");
    let mut got = [0u8; 1024 + 17];
    read_exact(fd, &mut got);
    check(got == data, "data mismatch");
    let n = unsafe { syscall::read(fd, got.as_mut_ptr(), 1) };
    check(n == 0, "expected EOF");
    syscall::close(fd);

    check(unsafe { syscall::unlink(c"rtfile".as_ptr().cast()) } == 0, "unlink");
}

/// link(a, b); unlink(a): b still reaches the original bytes.
fn link_preserves_inode() {
    let fd = open(c"lnka", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    check(fd >= 0, "create");
    write_all(fd, b"alias me");
    syscall::close(fd);

    check(
        unsafe { syscall::link(c"lnka".as_ptr().cast(), c"lnkb".as_ptr().cast()) } == 0,
        "link"
    );
    check(unsafe { syscall::unlink(c"lnka".as_ptr().cast()) } == 0, "unlink a");

    let fd = open(c"lnkb", OpenFlags::READ_ONLY);
    check(fd >= 0, "open b");
    let mut got = [0u8; 8];
    read_exact(fd, &mut got);
    check(&got == b"alias me", "bytes lost across link/unlink");
    syscall::close(fd);

    check(unsafe { syscall::unlink(c"lnkb".as_ptr().cast()) } == 0, "unlink b");
}

/// Deleting a directory entry leaves a free slot that the next create
/// reuses.
fn directory_slot_reuse() {
    for name in [c"slot1", c"slot2", c"slot3"] {
        let fd = open(name, OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
        check(fd >= 0, "create");
        syscall::close(fd);
    }
    check(unsafe { syscall::unlink(c"slot2".as_ptr().cast()) } == 0, "unlink");

    let fd = open(c"slot4", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    check(fd >= 0, "create into freed slot");
    syscall::close(fd);

    for name in [c"slot1", c"slot3", c"slot4"] {
        check(unsafe { syscall::unlink(name.as_ptr().cast()) } == 0, "cleanup");
    }
}

/// Two unlinkers race a linker over the same names; whatever wins, the
/// kernel must neither deadlock nor leave dangling entries.
fn concurrent_link_unlink() {
    check(unsafe { syscall::mkdir(c"cdir".as_ptr().cast()) } == 0, "mkdir");
    let fd = open(c"cdir/t", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    check(fd >= 0, "create");
    write_all(fd, b"contested");
    syscall::close(fd);

    let mut pids = [0isize; 3];
    for (i, pid) in pids.iter_mut().enumerate() {
        *pid = syscall::fork();
        check(*pid >= 0, "fork");
        if *pid == 0 {
            for _ in 0..20 {
                if i < 2 {
                    unsafe {
                        syscall::unlink(c"cdir/t".as_ptr().cast());
                    }
                } else {
                    unsafe {
                        syscall::link(c"cdir/t".as_ptr().cast(), c"cdir/u".as_ptr().cast());
                        syscall::unlink(c"cdir/u".as_ptr().cast());
                    }
                }
                // Recreate so the race keeps going.
                let fd = open(c"cdir/t", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
                if fd >= 0 {
                    syscall::close(fd);
                }
            }
            syscall::exit(0);
        }
    }
    for _ in 0..3 {
        let mut status = 0;
        check(unsafe { syscall::wait(&mut status) } > 0, "wait");
        check(status == 0, "racer failed");
    }

    // Whatever survived must be unlinkable exactly once, and the
    // directory must end up removable.
    unsafe {
        syscall::unlink(c"cdir/t".as_ptr().cast());
        syscall::unlink(c"cdir/u".as_ptr().cast());
    }
    check(
        unsafe { syscall::unlink(c"cdir".as_ptr().cast()) } == 0,
        "directory not empty after races"
    );
}

/// Writing past the maximum file size fails; the file is usable up to
/// the boundary.
fn file_size_limit() {
    // MAX_FILE_BLOCKS = NDIRECT (12) + NINDIRECT (256) blocks of 1024.
    const MAX_BLOCKS: usize = 12 + 256;
    let fd = open(c"bigfile", OpenFlags::CREATE | OpenFlags::WRITE_ONLY);
    check(fd >= 0, "create");

    let block = [0x42u8; 1024];
    for _ in 0..MAX_BLOCKS {
        write_all(fd, &block);
    }
    // One more byte must not fit.
    let n = unsafe { syscall::write(fd, block.as_ptr(), 1) };
    check(n < 0, "write past max file size should fail");
    syscall::close(fd);

    let fd = open(c"bigfile", OpenFlags::READ_ONLY);
    check(fd >= 0, "reopen");
    let mut st: syscall::Stat = unsafe { core::mem::zeroed() };
    check(unsafe { syscall::fstat(fd, &mut st) } == 0, "fstat");
    check(st.size == (MAX_BLOCKS * 1024) as u64, "size at boundary");
    syscall::close(fd);

    check(unsafe { syscall::unlink(c"bigfile".as_ptr().cast()) } == 0, "unlink");
}

/// Killing a process blocked in sleep() makes it exit; wait() reaps it
/// with the killed status.
fn kill_sleeping_process() {
    let pid = syscall::fork();
    check(pid >= 0, "fork");
    if pid == 0 {
        syscall::sleep(1000);
        // Should never get here.
        syscall::exit(7);
    }

    syscall::sleep(2);
    check(syscall::kill(pid as i32) == 0, "kill");
    let mut status = 0;
    check(unsafe { syscall::wait(&mut status) } == pid, "wait");
    check(status == -1, "killed process should exit with -1");
}

fn sbrk_grows_and_shrinks() {
    let base = syscall::sbrk(0);
    check(base > 0, "sbrk query");

    let grown = syscall::sbrk(4096 * 4);
    check(grown == base, "sbrk should return the old break");

    // Touch the new memory.
    let p = base as *mut u8;
    for i in 0..4096 * 4 {
        unsafe {
            p.add(i).write(0xab);
        }
    }
    check(unsafe { p.add(123).read() } == 0xab, "new pages usable");

    let shrunk = syscall::sbrk(-(4096 * 4));
    check(shrunk == base + 4096 * 4, "sbrk shrink");
    check(syscall::sbrk(0) == base, "break restored");
}
