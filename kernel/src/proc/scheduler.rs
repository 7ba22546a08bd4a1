//! The per-CPU scheduler loop and its entry point, `sched`.

use core::arch::asm;

use crate::{
    cpu::Cpu,
    interrupt,
    sync::SpinLockGuard,
};

use super::{PROC, ProcSharedData, ProcState, switch::switch};

pub use super::switch::Context;

/// The per-CPU scheduler.
///
/// Each CPU calls this once set up, and never returns. It loops:
/// pick a runnable process, switch to it, and take back over when that
/// process switches back.
pub fn schedule() -> ! {
    let cpu = Cpu::current();
    cpu.set_proc(None);

    loop {
        // The most recent process to run may have had interrupts turned
        // off; enable them to avoid deadlock if every process is waiting.
        interrupt::enable();

        let mut found = false;
        for p in &PROC {
            let mut shared = p.shared().lock();
            if shared.state != ProcState::Runnable {
                continue;
            }

            // Switch to the chosen process. It is the process's job to
            // release its lock and then reacquire it before jumping back
            // to us.
            shared.state = ProcState::Running;
            cpu.set_proc(Some(p.into()));
            unsafe {
                switch(cpu.context.get(), &shared.context);
            }

            // Process is done running for now; it changed its state
            // before coming back.
            cpu.set_proc(None);
            found = true;
            drop(shared);
        }

        if !found {
            // Nothing to run; wait for an interrupt.
            interrupt::enable();
            unsafe {
                asm!("wfi");
            }
        }
    }
}

/// Switches to the scheduler.
///
/// The caller must hold exactly its own slot lock and nothing else,
/// with the process state already changed away from `Running`.
///
/// Saves and restores the interrupts-were-enabled flag because it is a
/// property of this kernel thread's critical-section chain, not of the
/// CPU; the thread may resume on a different CPU.
pub(super) fn sched(shared: &mut SpinLockGuard<'_, ProcSharedData>) {
    assert_eq!(interrupt::disabled_depth(), 1, "sched with locks held");
    assert!(!interrupt::is_enabled());
    assert_ne!(shared.state, ProcState::Running);

    let was_enabled = interrupt::is_enabled_before_push();
    unsafe {
        switch(&mut shared.context, Cpu::current().context.get());
    }
    unsafe {
        interrupt::force_set_before_push(was_enabled);
    }
}
