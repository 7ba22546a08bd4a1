//! The first user program: set up the console, run the test suite, and
//! reap orphans forever.
#![no_std]
#![no_main]

use fv6_user::{println, syscall};
use syscall::OpenFlags;

/// Console device major number; must match the kernel's device table.
const CONSOLE_MAJOR: i16 = 1;

#[unsafe(no_mangle)]
fn main(_argc: i32, _argv: *const *const u8) {
    // Stdin/stdout/stderr on the console device, creating it on first
    // boot.
    if unsafe { syscall::open(c"console".as_ptr().cast(), OpenFlags::READ_WRITE) } < 0 {
        unsafe {
            syscall::mknod(c"console".as_ptr().cast(), CONSOLE_MAJOR, 0);
            syscall::open(c"console".as_ptr().cast(), OpenFlags::READ_WRITE);
        }
    }
    syscall::dup(0); // stdout
    syscall::dup(0); // stderr

    println!("init: starting");

    let pid = syscall::fork();
    if pid < 0 {
        println!("init: fork failed");
        syscall::exit(1);
    }
    if pid == 0 {
        let argv: [*const u8; 2] = [c"usertests".as_ptr().cast(), core::ptr::null()];
        unsafe {
            syscall::exec(c"usertests".as_ptr().cast(), argv.as_ptr());
        }
        println!("init: exec usertests failed");
        syscall::exit(1);
    }

    // Adopt and reap orphans for the rest of time.
    loop {
        unsafe {
            syscall::wait(core::ptr::null_mut());
        }
    }
}
