#![no_std]
#![no_main]

use core::slice;

use fv6_user::{STDIN_FD, io::Fd, println, syscall};

fn cat(fd: Fd) {
    let mut buf = [0u8; 512];
    loop {
        let n = fd.read(&mut buf);
        if n < 0 {
            println!("cat: read error");
            syscall::exit(1);
        }
        if n == 0 {
            return;
        }
        if fv6_user::io::stdout().write_all(&buf[..n as usize]).is_err() {
            println!("cat: write error");
            syscall::exit(1);
        }
    }
}

#[unsafe(no_mangle)]
fn main(argc: i32, argv: *const *const u8) {
    if argc <= 1 {
        cat(Fd(STDIN_FD));
        return;
    }

    let args = unsafe { slice::from_raw_parts(argv, argc as usize) };
    for &arg in &args[1..] {
        let fd = unsafe { syscall::open(arg, syscall::OpenFlags::READ_ONLY) };
        if fd < 0 {
            println!("cat: cannot open file");
            syscall::exit(1);
        }
        cat(Fd(fd as i32));
        syscall::close(fd as i32);
    }
}
