//! Line-buffered console input/output over the UART, dispatched by device
//! major number from `file::FileKind::Device`.
//!
//! Grounded directly in `examples/original_source/kernel/console.c`: a
//! 128-byte input ring with separate read/write/edit indices so backspace
//! and line-kill can rewind unconsumed edits without disturbing bytes a
//! `read()` has already claimed.

#[cfg(not(test))]
use crate::lock::Spinlock;
#[cfg(not(test))]
use crate::proc::{self, WaitChannel};
#[cfg(not(test))]
use crate::uart;

pub const CONSOLE_MAJOR: u16 = 1;

#[cfg(not(test))]
const INPUT_BUF_SIZE: usize = 128;
#[cfg(not(test))]
const BACKSPACE: u8 = 0x7f;

#[cfg(not(test))]
fn ctrl(c: u8) -> u8 {
    c - b'@'
}

#[cfg(not(test))]
struct Input {
    buf: [u8; INPUT_BUF_SIZE],
    /// Next index `read()` will consume.
    r: usize,
    /// Next index a completed line extends to (set by the interrupt handler
    /// once `\n`/^D/a full buffer arrives).
    w: usize,
    /// Next index the interrupt handler will fill; `e - r` is unconsumed,
    /// not-yet-delivered edits, so backspace/^U can rewind it.
    e: usize,
}

#[cfg(not(test))]
static INPUT: Spinlock<Input> = Spinlock::new("cons", Input { buf: [0; INPUT_BUF_SIZE], r: 0, w: 0, e: 0 });
#[cfg(not(test))]
static CHAN: WaitChannel = WaitChannel::new();

#[cfg(not(test))]
fn putc(c: u8) {
    if c == BACKSPACE {
        uart::putc_sync(0x08);
        uart::putc_sync(b' ');
        uart::putc_sync(0x08);
    } else {
        uart::putc_sync(c);
    }
}

/// Called by `uart::intr` for each received byte: handles editing keys,
/// echoes the result, and wakes a blocked `read` once a full line (or EOF)
/// has accumulated.
#[cfg(not(test))]
pub fn intr(c: u8) {
    let mut s = INPUT.lock();
    match c {
        _ if c == ctrl(b'U') => {
            while s.e != s.w && s.buf[(s.e - 1) % INPUT_BUF_SIZE] != b'\n' {
                s.e -= 1;
                putc(BACKSPACE);
            }
        }
        _ if c == ctrl(b'H') || c == BACKSPACE => {
            if s.e != s.w {
                s.e -= 1;
                putc(BACKSPACE);
            }
        }
        0 => {}
        _ => {
            if s.e - s.r < INPUT_BUF_SIZE {
                let c = if c == b'\r' { b'\n' } else { c };
                putc(c);
                let idx = s.e % INPUT_BUF_SIZE;
                s.buf[idx] = c;
                s.e += 1;
                if c == b'\n' || c == ctrl(b'D') || s.e - s.r == INPUT_BUF_SIZE {
                    s.w = s.e;
                    CHAN.wakeup();
                }
            }
        }
    }
}

/// Reads one line (or up to EOF) into `dst`. Blocks until at least a
/// newline or ^D has been typed.
#[cfg(not(test))]
pub fn read(dst: &mut [u8], major: u16) -> Result<usize, ()> {
    assert_eq!(major, CONSOLE_MAJOR, "console::read: unexpected major");
    let target = dst.len();
    let mut n = dst.len();
    let mut out = 0;
    let mut s = INPUT.lock();
    while n > 0 {
        while s.r == s.w {
            if proc::myproc().map(proc::killed).unwrap_or(false) {
                return Err(());
            }
            s = CHAN.sleep(s);
        }
        let c = s.buf[s.r % INPUT_BUF_SIZE];
        s.r += 1;
        if c == ctrl(b'D') {
            if n < target {
                s.r -= 1;
            }
            break;
        }
        dst[out] = c;
        out += 1;
        n -= 1;
        if c == b'\n' {
            break;
        }
    }
    Ok(target - n)
}

/// Writes `src` to the console, one byte at a time, via the blocking
/// (ring-buffered) UART path.
#[cfg(not(test))]
pub fn write(src: &[u8], major: u16) -> Result<usize, ()> {
    assert_eq!(major, CONSOLE_MAJOR, "console::write: unexpected major");
    for &b in src {
        uart::putc(b);
    }
    Ok(src.len())
}

#[cfg(not(test))]
pub fn init() {
    uart::init();
}

/// Host stand-ins: `file::FileRef::read`/`write` call these unconditionally
/// for `FileKind::Device`, so they must exist (but needn't do anything
/// meaningful) on a host target.
#[cfg(test)]
pub fn read(_dst: &mut [u8], _major: u16) -> Result<usize, ()> {
    Ok(0)
}
#[cfg(test)]
pub fn write(src: &[u8], _major: u16) -> Result<usize, ()> {
    Ok(src.len())
}
