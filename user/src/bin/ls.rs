#![no_std]
#![no_main]

use core::slice;

use fv6_fs_types::DirEntry;
use fv6_user::{io::Fd, println, syscall};
use syscall::{OpenFlags, Stat};

fn ls(path: &[u8]) {
    let fd = unsafe { syscall::open(path.as_ptr(), OpenFlags::READ_ONLY) };
    if fd < 0 {
        println!("ls: cannot open path");
        return;
    }
    let fd = Fd(fd as i32);

    let mut st: Stat = unsafe { core::mem::zeroed() };
    if unsafe { syscall::fstat(fd.0, &mut st) } < 0 {
        println!("ls: cannot stat path");
        syscall::close(fd.0);
        return;
    }

    if st.ty != fv6_syscall::T_DIR {
        println!("{} {} {}", st.ty, st.ino, st.size);
        syscall::close(fd.0);
        return;
    }

    let mut entry = [0u8; size_of::<DirEntry>()];
    while fd.read(&mut entry) == entry.len() as isize {
        let name_bytes = &entry[2..];
        let ino = u16::from_le_bytes([entry[0], entry[1]]);
        if ino == 0 {
            continue;
        }
        let len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = core::str::from_utf8(&name_bytes[..len]).unwrap_or("?");
        println!("{name} {ino}");
    }
    syscall::close(fd.0);
}

#[unsafe(no_mangle)]
fn main(argc: i32, argv: *const *const u8) {
    if argc <= 1 {
        ls(b".\0");
        return;
    }
    let args = unsafe { slice::from_raw_parts(argv, argc as usize) };
    for &arg in &args[1..] {
        let len = unsafe { core::ffi::CStr::from_ptr(arg.cast()) }
            .to_bytes_with_nul()
            .len();
        ls(unsafe { slice::from_raw_parts(arg, len) });
    }
}
