//! Console input and output, over the UART.
//!
//! Reads return a line at a time. Input characters get the usual
//! editing treatment on the way in:
//!
//! * newline / carriage return -- end of line
//! * control-h (or delete) -- backspace
//! * control-u -- kill line
//! * control-d -- end of file
//! * control-p -- print the process list
//!
//! The editing state machine itself is `char_io::LineDiscipline`; this
//! module wires it to the UART, the blocking read side, and the device
//! table.

use char_io::{CTRL_D, Input, LineDiscipline};

use crate::{
    error::KernelError,
    file::{Device, device::CONSOLE_MAJOR, register_device},
    memory::vm_user,
    proc::{self, Proc, ProcPrivateData},
    sync::{SpinLock, SpinLockCondVar},
};

pub mod uart;

const CTRL_P: u8 = b'P' - b'@';

/// Sends one byte to the UART, synchronously. Used by `println!` and to
/// echo input, but not by write().
pub fn put_char(c: u8) {
    uart::putc_sync(c);
}

/// Erases one echoed character.
fn put_backspace() {
    uart::putc_sync(0x08);
    uart::putc_sync(b' ');
    uart::putc_sync(0x08);
}

static LINE: SpinLock<LineDiscipline<128>> = SpinLock::new(LineDiscipline::new());
static LINE_READY: SpinLockCondVar = SpinLockCondVar::new();

/// Console write(): feed user bytes to the UART, blocking as needed.
fn write(private: &mut ProcPrivateData, addr: usize, n: usize) -> Result<usize, KernelError> {
    for i in 0..n {
        let mut byte = [0u8];
        if vm_user::copy_in_bytes(private.pagetable(), &mut byte, addr + i).is_err() {
            if i > 0 {
                return Ok(i);
            }
            return Err(KernelError::BadAddress);
        }
        uart::putc(byte[0]);
    }
    Ok(n)
}

/// Console read(): up to one whole input line. A return of zero bytes
/// is end of file.
fn read(private: &mut ProcPrivateData, addr: usize, n: usize) -> Result<usize, KernelError> {
    let mut line = LINE.lock();
    let mut done = 0;
    while done < n {
        // Wait for the interrupt handler to commit a line.
        while !line.has_input() {
            if Proc::current().shared().lock().killed() {
                return Err(KernelError::Killed);
            }
            line = LINE_READY.wait(line);
        }

        let c = line.getc().unwrap();

        if c == CTRL_D {
            // End of file. If some bytes were already consumed, hand
            // those out and save the ^D for the next read.
            if done > 0 && done < n {
                line.ungetc();
            }
            break;
        }

        let byte = [c];
        if vm_user::copy_out_bytes(private.pagetable(), addr + done, &byte).is_err() {
            if done > 0 {
                break;
            }
            return Err(KernelError::BadAddress);
        }
        done += 1;

        if c == b'\n' {
            // A whole line has arrived; return to the user-level read.
            break;
        }
    }
    Ok(done)
}

/// Handles one input byte from the UART interrupt handler: line
/// editing, echo, and waking readers when a line is complete.
pub fn handle_interrupt(c: u8) {
    if c == CTRL_P {
        proc::dump();
        return;
    }

    let mut line = LINE.lock();
    match line.input(c) {
        Input::Ignored => {}
        Input::Erased(n) => {
            for _ in 0..n {
                put_backspace();
            }
        }
        Input::Queued { echo, line_ready } => {
            put_char(echo);
            if line_ready {
                LINE_READY.notify();
            }
        }
    }
}

pub fn init() {
    uart::init();

    register_device(
        CONSOLE_MAJOR,
        Device {
            read,
            write,
        },
    );
}
