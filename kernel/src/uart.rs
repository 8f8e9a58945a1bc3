//! 16550a UART driver.
//!
//! Grounded directly in `examples/original_source/kernel/uart.c`: a 32-byte
//! software transmit ring buffer (so `putc` from `write()` can block instead
//! of spinning), plus a lock-free synchronous path for `printf`/panic output
//! and character echo.

use crate::lock::Spinlock;
use crate::memlayout::UART0;
use crate::proc::WaitChannel;
use core::sync::atomic::{AtomicBool, Ordering};

const RHR: usize = 0;
const THR: usize = 0;
const IER: usize = 1;
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7;
const LSR: usize = 5;
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn read_reg(reg: usize) -> u8 {
    unsafe { core::ptr::read_volatile((UART0 + reg) as *const u8) }
}

unsafe fn write_reg(reg: usize, v: u8) {
    unsafe { core::ptr::write_volatile((UART0 + reg) as *mut u8, v) };
}

pub static PANICKED: AtomicBool = AtomicBool::new(false);

const TX_BUF_SIZE: usize = 32;

struct TxState {
    buf: [u8; TX_BUF_SIZE],
    w: usize,
    r: usize,
}

static TX_LOCK: Spinlock<TxState> = Spinlock::new("uart", TxState { buf: [0; TX_BUF_SIZE], w: 0, r: 0 });
static TX_CHAN: WaitChannel = WaitChannel::new();

pub fn init() {
    unsafe {
        write_reg(IER, 0x00);
        write_reg(LCR, LCR_BAUD_LATCH);
        write_reg(0, 0x03);
        write_reg(1, 0x00);
        write_reg(LCR, LCR_EIGHT_BITS);
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }
}

/// Queues `c` for transmission, blocking if the ring buffer is full. Must
/// not be called from an interrupt handler.
pub fn putc(c: u8) {
    let mut s = TX_LOCK.lock();
    if PANICKED.load(Ordering::Relaxed) {
        loop {
            core::hint::spin_loop();
        }
    }
    while s.w == s.r + TX_BUF_SIZE {
        s = TX_CHAN.sleep(s);
    }
    let idx = s.w % TX_BUF_SIZE;
    s.buf[idx] = c;
    s.w += 1;
    start_locked(&mut s);
}

/// Writes directly to the UART, polling for the transmit register to empty.
/// Used by `printf`/panic output and character echo, which must work even
/// with interrupts off.
pub fn putc_sync(c: u8) {
    unsafe { crate::lock::push_off() };
    if PANICKED.load(Ordering::Relaxed) {
        loop {
            core::hint::spin_loop();
        }
    }
    unsafe {
        while read_reg(LSR) & LSR_TX_IDLE == 0 {}
        write_reg(THR, c);
    }
    unsafe { crate::lock::pop_off() };
}

fn start_locked(s: &mut TxState) {
    loop {
        if s.w == s.r {
            return;
        }
        if unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            return;
        }
        let c = s.buf[s.r % TX_BUF_SIZE];
        s.r += 1;
        TX_CHAN.wakeup();
        unsafe { write_reg(THR, c) };
    }
}

/// Reads one buffered input byte, or `None` if none is waiting.
fn getc() -> Option<u8> {
    if unsafe { read_reg(LSR) } & LSR_RX_READY != 0 {
        Some(unsafe { read_reg(RHR) })
    } else {
        None
    }
}

/// UART interrupt handler: drains received characters into the console line
/// discipline, then drains any pending output.
pub fn intr() {
    while let Some(c) = getc() {
        crate::console::intr(c);
    }
    let mut s = TX_LOCK.lock();
    start_locked(&mut s);
}
