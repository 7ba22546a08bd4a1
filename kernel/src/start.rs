//! Machine-mode boot: drop to supervisor mode and jump to `main`.

use core::arch::asm;

use riscv::register::{
    mcounteren,
    medeleg::{self, Medeleg},
    mepc, mhartid,
    mideleg::{self, Mideleg},
    mie, mstatus, pmpaddr0, pmpcfg0,
    satp::{self, Satp},
    scounteren, sie,
};

use crate::{cpu, main, param::NCPU};

/// Boot stack; entry.rs carves one slice per CPU out of it.
pub const STACK_SIZE: usize = 4096;
pub static mut STACK0: [u8; STACK_SIZE * NCPU] = [0; STACK_SIZE * NCPU];

/// entry.rs jumps here in machine mode on every hart.
pub extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    unsafe {
        mstatus::set_mpp(mstatus::MPP::Supervisor);
    }

    // set M Exception Program Counter to main, for mret.
    unsafe {
        mepc::write(main as usize);
    }

    // disable paging for now.
    unsafe {
        satp::write(Satp::from_bits(0));
    }

    // delegate all interrupts and exceptions to supervisor mode.
    unsafe {
        medeleg::write(Medeleg::from_bits(0xffff));
        mideleg::write(Mideleg::from_bits(0xffff));
        let mut s = sie::read();
        s.set_sext(true);
        s.set_stimer(true);
        s.set_ssoft(true);
        sie::write(s);
    }

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    unsafe {
        pmpaddr0::write(0x3f_ffff_ffff_ffff);
        pmpcfg0::write(0xf);
    }

    // ask for clock interrupts.
    timer_init();

    // keep each CPU's hartid in its tp register, for cpu::id().
    let id = mhartid::read();
    unsafe {
        cpu::set_id(id);
    }

    // switch to supervisor mode and jump to main().
    unsafe {
        asm!("mret", options(noreturn));
    }
}

/// Arranges for each hart to take timer interrupts directly in
/// supervisor mode via the sstc extension.
fn timer_init() {
    // enable supervisor-mode timer interrupts.
    unsafe {
        mie::set_stimer();
    }

    // enable the sstc extension (i.e. stimecmp).
    unsafe {
        asm!("csrs menvcfg, {}", in(reg) 1_u64 << 63);
    }

    // allow supervisor to use stimecmp and time.
    unsafe {
        mcounteren::set_tm();
    }
    // allow user to read time.
    unsafe {
        scounteren::set_tm();
    }

    // ask for the very first timer interrupt.
    unsafe {
        let time: u64;
        asm!("csrr {}, time", out(reg) time);
        asm!("csrw stimecmp, {}", in(reg) time);
    }
}
