//! Timer ticks.

use core::arch::asm;

use crate::{
    cpu,
    sync::{SpinLock, SpinLockCondVar},
};

/// Global tick counter, advanced by hart 0.
pub static TICKS: SpinLock<u64> = SpinLock::new(0);
pub static TICKS_UPDATED: SpinLockCondVar = SpinLockCondVar::new();

/// About a tenth of a second on qemu's virt machine.
const TICK_INTERVAL: u64 = 1_000_000;

pub(super) fn handle_interrupt() {
    if cpu::id() == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        TICKS_UPDATED.notify();
        drop(ticks);
    }

    // Ask for the next timer interrupt; this also clears the current
    // interrupt request.
    unsafe {
        let time: u64;
        asm!("csrr {}, time", out(reg) time);
        asm!("csrw stimecmp, {}", in(reg) time + TICK_INTERVAL);
    }
}
