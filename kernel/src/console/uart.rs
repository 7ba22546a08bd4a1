//! Low-level driver for the 16550a UART.

use core::{hint, ptr, sync::atomic::Ordering};

use char_io::ByteRing;

use crate::{
    console, interrupt,
    memory::layout::UART0,
    print::PANICKED,
    sync::{SpinLock, SpinLockCondVar},
};

const unsafe fn reg(offset: usize) -> *mut u8 {
    unsafe { ptr::without_provenance_mut::<u8>(UART0).byte_add(offset) }
}

// The UART control registers; some mean different things for read vs
// write. See http://byterunner.com/16550.html

/// Receive holding register (input bytes).
const RHR: usize = 0;
/// Transmit holding register (output bytes).
const THR: usize = 0;
/// Interrupt enable register.
const IER: usize = 1;
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
/// FIFO control register.
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clears the content of both FIFOs.
const FCR_FIFO_CLEAR: u8 = 3 << 1;
/// Interrupt status register.
const ISR: usize = 2;
/// Line control register.
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
/// Special mode to set the baud rate.
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Line status register.
const LSR: usize = 5;
/// Input is waiting to be read from RHR.
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character.
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn read_reg(offset: usize) -> u8 {
    unsafe { reg(offset).read_volatile() }
}

unsafe fn write_reg(offset: usize, data: u8) {
    unsafe { reg(offset).write_volatile(data) }
}

static TX_BUFFER: SpinLock<ByteRing<32>> = SpinLock::new(ByteRing::new());
static TX_SPACE: SpinLockCondVar = SpinLockCondVar::new();

pub fn init() {
    unsafe {
        // disable interrupts.
        write_reg(IER, 0x00);

        // special mode to set the baud rate.
        write_reg(LCR, LCR_BAUD_LATCH);

        // LSB then MSB for a baud rate of 38.4K.
        write_reg(0, 0x03);
        write_reg(1, 0x00);

        // leave set-baud mode and set word length to 8 bits, no parity.
        write_reg(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs.
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // enable transmit and receive interrupts.
        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }
}

/// Queues one output byte, telling the UART to start sending if it is
/// idle. Blocks while the buffer is full, so it cannot be used from
/// interrupt context; this is the write() path.
pub fn putc(c: u8) {
    let mut buffer = TX_BUFFER.lock();

    if PANICKED.load(Ordering::Relaxed) {
        loop {
            hint::spin_loop();
        }
    }

    while buffer.is_full() {
        // Wait for start() to open up space.
        buffer = TX_SPACE.wait(buffer);
    }
    buffer.push(c);
    start(&mut buffer);
}

/// Sends one byte synchronously, spinning on the UART; for the kernel's
/// own printing and for echoing, which must work from interrupt context
/// and during panics.
pub fn putc_sync(c: u8) {
    interrupt::with_push_disabled(|| {
        if PANICKED.load(Ordering::Relaxed) {
            loop {
                hint::spin_loop();
            }
        }

        // wait for the transmit holding register to empty.
        while unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            hint::spin_loop();
        }
        unsafe {
            write_reg(THR, c);
        }
    });
}

/// Drains the output buffer into the UART for as long as it will take
/// bytes. Called from both the top half (putc) and the bottom half
/// (interrupt); the caller holds the buffer lock.
fn start(buffer: &mut ByteRing<32>) {
    loop {
        if buffer.is_empty() {
            unsafe {
                read_reg(ISR);
            }
            return;
        }

        if unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            // The holding register is full; the UART will interrupt
            // when it is ready for another byte.
            return;
        }

        let c = buffer.pop();

        // putc() may be waiting for space.
        TX_SPACE.notify();

        unsafe {
            write_reg(THR, c);
        }
    }
}

/// Reads one waiting input byte, if any.
fn getc() -> Option<u8> {
    if unsafe { read_reg(LSR) } & LSR_RX_READY != 0 {
        Some(unsafe { read_reg(RHR) })
    } else {
        None
    }
}

/// Handles a UART interrupt: input has arrived, the transmitter is
/// ready for more output, or both.
pub fn handle_interrupt() {
    // read and process incoming bytes.
    while let Some(c) = getc() {
        console::handle_interrupt(c);
    }

    // send buffered output.
    let mut buffer = TX_BUFFER.lock();
    start(&mut buffer);
    drop(buffer);
}
