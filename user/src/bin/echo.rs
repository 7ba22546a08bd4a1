#![no_std]
#![no_main]

use core::{ffi::CStr, slice};

use fv6_user::{print, println};

#[unsafe(no_mangle)]
fn main(argc: i32, argv: *const *const u8) {
    let args = unsafe { slice::from_raw_parts(argv, argc as usize) };
    for (i, &arg) in args.iter().enumerate().skip(1) {
        let arg = unsafe { CStr::from_ptr(arg.cast()) };
        if i > 1 {
            print!(" ");
        }
        print!("{}", arg.to_str().unwrap_or("?"));
    }
    println!();
}
