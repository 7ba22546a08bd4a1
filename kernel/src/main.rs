//! fv6 — a small teaching operating system for RISC-V.
#![no_std]
#![no_main]

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

use fv6_kernel_params as param;

mod console;
mod cpu;
mod entry;
mod error;
mod file;
mod fs;
mod interrupt;
mod memory;
mod print;
mod proc;
mod start;
mod sync;
mod syscall;

static STARTED: AtomicBool = AtomicBool::new(false);

/// `start()` jumps here in supervisor mode on all CPUs.
extern "C" fn main() -> ! {
    if cpu::id() == 0 {
        console::init();
        println!();
        println!("fv6 kernel is booting");
        println!();
        memory::page::init(); // physical page allocator
        memory::vm_kernel::init(); // create the kernel page table
        memory::vm_kernel::init_hart(); // turn on paging
        proc::init(); // process table
        interrupt::trap::init_hart(); // install kernel trap vector
        interrupt::plic::init(); // set up the interrupt controller
        interrupt::plic::init_hart(); // ask the PLIC for device interrupts
        fs::block_io::init(); // buffer cache
        fs::virtio_disk::init(); // emulated hard disk
        proc::user_init(); // first user process

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        println!("hart {} starting", cpu::id());
        memory::vm_kernel::init_hart(); // turn on paging
        interrupt::trap::init_hart(); // install kernel trap vector
        interrupt::plic::init_hart(); // ask the PLIC for device interrupts
    }

    proc::scheduler::schedule()
}
