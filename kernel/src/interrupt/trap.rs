//! Trap dispatch: one entry for traps from user space, one for traps
//! taken while already in the kernel.

use core::mem;

use riscv::{
    interrupt::{
        Trap,
        supervisor::{Exception, Interrupt},
    },
    register::{
        scause, sepc,
        sstatus::{self, SPP},
        stval,
        stvec::{self, Stvec, TrapMode},
    },
};

use fv6_syscall::KILLED_EXIT_STATUS;

use super::{kernel_vec, plic, timer, trampoline};
use crate::{
    console::uart,
    cpu, fs, interrupt,
    memory::PAGE_SIZE,
    println,
    proc::{self, Proc},
    syscall,
};

pub fn init_hart() {
    let mut stvec = Stvec::from_bits(0);
    stvec.set_address(kernel_vec::kernel_vec as usize);
    stvec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(stvec);
    }
}

/// Handles an interrupt, exception or system call from user space.
/// Reached from the trampoline.
extern "C" fn trap_user() -> ! {
    assert_eq!(sstatus::read().spp(), SPP::User, "trap_user from supervisor");

    // We are in the kernel now; send further traps to trap_kernel().
    init_hart();

    let p = Proc::current();
    // Safety: this is the process's own trap path.
    let private = unsafe { p.private_mut() };

    // Save the user program counter.
    private.trapframe_mut().epc = sepc::read() as u64;

    let scause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();
    let mut timer_tick = false;
    match scause {
        Trap::Exception(Exception::UserEnvCall) => {
            // system call
            if p.shared().lock().killed() {
                proc::exit(p, private, KILLED_EXIT_STATUS);
            }

            // sepc points to the ecall; return to the next instruction.
            private.trapframe_mut().epc += 4;

            // an interrupt would clobber sepc/scause/sstatus, so enable
            // only now that we are done with them.
            interrupt::enable();

            syscall::syscall(p, private);
        }
        Trap::Exception(e) => {
            let shared = p.shared().lock();
            println!(
                "trap_user: exception {e:?} pid={} name={}",
                shared.pid(),
                shared.name()
            );
            println!(
                "           sepc={:#x} stval={:#x}",
                sepc::read(),
                stval::read()
            );
            drop(shared);
            p.shared().lock().kill();
        }
        Trap::Interrupt(int) => match handle_dev_interrupt(int) {
            IntrKind::Timer => timer_tick = true,
            IntrKind::Device => {}
            IntrKind::NotRecognized => {
                let shared = p.shared().lock();
                println!(
                    "trap_user: unexpected interrupt {int:?} pid={} name={}",
                    shared.pid(),
                    shared.name()
                );
                drop(shared);
                p.shared().lock().kill();
            }
        },
    }

    if p.shared().lock().killed() {
        proc::exit(p, private, KILLED_EXIT_STATUS);
    }

    // Give up the CPU on a timer tick.
    if timer_tick {
        proc::yield_(p);
    }

    trap_user_ret(p)
}

/// Returns to user space through the trampoline.
pub fn trap_user_ret(p: &'static Proc) -> ! {
    // About to switch the trap destination from trap_kernel() to
    // user_vec; keep interrupts off until we are back in user space.
    interrupt::disable();

    let private = unsafe { p.private_mut() };

    let mut stvec = Stvec::from_bits(0);
    stvec.set_address(trampoline::user_vec_addr());
    stvec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(stvec);
    }

    // Fields user_vec will need on the next trap into the kernel.
    let kstack_top = (private.kstack().addr() + PAGE_SIZE) as u64;
    let kernel_satp = riscv::register::satp::read().bits() as u64;
    let tf = private.trapframe_mut();
    tf.kernel_satp = kernel_satp;
    tf.kernel_sp = kstack_top;
    tf.kernel_trap = trap_user as usize as u64;
    tf.kernel_hartid = cpu::id() as u64;

    // Set up what sret will use to get to user space.
    unsafe {
        sstatus::set_spp(SPP::User);
        sstatus::set_spie();
        sepc::write(private.trapframe().epc as usize);
    }

    // Jump to user_ret in the trampoline, which switches to the user
    // page table, restores the user registers, and srets.
    let satp = private.pagetable().satp();
    let user_ret = trampoline::user_ret_addr();
    unsafe {
        let f: extern "C" fn(usize) -> ! = mem::transmute(user_ret);
        f(satp)
    }
}

/// Interrupts and exceptions from kernel code come here via kernel_vec,
/// on the current kernel stack. Must be entered with interrupts
/// disabled.
pub extern "C" fn trap_kernel() {
    // yield_() may cause traps that overwrite these; save them now.
    let sepc_saved = sepc::read();
    let sstatus_saved = sstatus::read();

    assert_eq!(sstatus_saved.spp(), SPP::Supervisor, "not from supervisor");
    assert!(!interrupt::is_enabled());

    let scause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();
    match scause {
        Trap::Exception(e) => {
            println!("trap_kernel: exception {e:?}");
            println!(
                "             sepc={sepc_saved:#x} stval={:#x}",
                stval::read()
            );
            panic!("unexpected trap from kernel");
        }
        Trap::Interrupt(int) => match handle_dev_interrupt(int) {
            IntrKind::Timer => {
                // Yield on a timer tick — unless this CPU is running its
                // scheduler, whose context must not be overwritten.
                if let Some(p) = Proc::try_current() {
                    proc::yield_(p);
                }
            }
            IntrKind::Device => {}
            IntrKind::NotRecognized => {
                println!("trap_kernel: unexpected interrupt {int:?}");
                panic!("unexpected interrupt from kernel");
            }
        },
    }

    // Restore the trap registers for kernel_vec's sret.
    unsafe {
        sepc::write(sepc_saved);
        sstatus::write(sstatus_saved);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntrKind {
    Timer,
    Device,
    NotRecognized,
}

/// Identifies and handles one device interrupt or timer tick.
fn handle_dev_interrupt(int: Interrupt) -> IntrKind {
    match int {
        Interrupt::SupervisorTimer => {
            timer::handle_interrupt();
            IntrKind::Timer
        }
        Interrupt::SupervisorExternal => {
            // A device interrupt via the PLIC; irq says which device.
            let irq = plic::claim();

            use crate::memory::layout::{UART0_IRQ, VIRTIO0_IRQ};
            if irq == UART0_IRQ {
                uart::handle_interrupt();
            } else if irq == VIRTIO0_IRQ {
                fs::virtio_disk::handle_interrupt();
            } else if irq > 0 {
                println!("unexpected interrupt irq={irq}");
            }

            // The PLIC lets each device raise at most one interrupt at a
            // time; mark it served so it may raise another.
            if irq > 0 {
                plic::complete(irq);
            }
            IntrKind::Device
        }
        Interrupt::SupervisorSoft => IntrKind::NotRecognized,
    }
}
