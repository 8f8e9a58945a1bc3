//! A bounded, in-memory ring buffer connecting a reader and a writer
//! through the open-file abstraction.
//!
//! Grounded in `examples/original_source/kernel/pipe.c`'s design: one
//! spinlock, sleep-on-full for writers and sleep-on-empty for readers, and
//! open-end counts so each side can detect the other hanging up.

use crate::lock::Spinlock;
use crate::param::PIPESIZE;
use crate::proc::{self, WaitChannel};

struct PipeState {
    data: [u8; PIPESIZE],
    /// Total bytes ever written / read; `write - read` is bytes buffered.
    nwrite: usize,
    nread: usize,
    readers: u32,
    writers: u32,
}

pub struct Pipe {
    state: Spinlock<PipeState>,
    chan: WaitChannel,
}

impl Pipe {
    const fn new() -> Self {
        Pipe {
            state: Spinlock::new(
                "pipe",
                PipeState { data: [0; PIPESIZE], nwrite: 0, nread: 0, readers: 0, writers: 0 },
            ),
            chan: WaitChannel::new(),
        }
    }

    /// Drops one reader (or writer) end. Frees the slot back to the pool
    /// once both ends have been closed by every holder.
    fn close_end(&self, index: usize, is_reader: bool) {
        let free = {
            let mut s = self.state.lock();
            if is_reader {
                s.readers -= 1;
            } else {
                s.writers -= 1;
            }
            s.readers == 0 && s.writers == 0
        };
        self.chan.wakeup();
        if free {
            PIPE_INUSE.lock()[index] = false;
        }
    }

    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut written = 0;
        let mut s = self.state.lock();
        while written < src.len() {
            if s.readers == 0 || proc::myproc().map(proc::killed).unwrap_or(false) {
                return Err(());
            }
            if s.nwrite == s.nread + PIPESIZE {
                self.chan.wakeup();
                s = self.chan.sleep(s);
                continue;
            }
            let idx = s.nwrite % PIPESIZE;
            s.data[idx] = src[written];
            s.nwrite += 1;
            written += 1;
        }
        self.chan.wakeup();
        Ok(written)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut s = self.state.lock();
        while s.nread == s.nwrite && s.writers > 0 {
            if proc::myproc().map(proc::killed).unwrap_or(false) {
                return Err(());
            }
            s = self.chan.sleep(s);
        }
        let mut n = 0;
        while n < dst.len() && s.nread < s.nwrite {
            dst[n] = s.data[s.nread % PIPESIZE];
            s.nread += 1;
            n += 1;
        }
        self.chan.wakeup();
        Ok(n)
    }
}

use crate::param::NFILE;

/// Fixed pool of pipes, one per open `pipe()` syscall currently alive.
static PIPES: [Pipe; NFILE] = array_macro::array![_ => Pipe::new(); NFILE];

static PIPE_INUSE: Spinlock<[bool; NFILE]> = Spinlock::new("pipe.inuse", [false; NFILE]);

/// One end (read or write) of a pipe; closing it is distinct from closing
/// the other end, matching a `struct file`'s half-duplex view in the
/// original.
pub struct PipeEnd {
    index: usize,
    is_reader: bool,
}

impl PipeEnd {
    pub fn pipe(&self) -> &'static Pipe {
        &PIPES[self.index]
    }
}

impl Clone for PipeEnd {
    fn clone(&self) -> Self {
        let mut s = self.pipe().state.lock();
        if self.is_reader {
            s.readers += 1;
        } else {
            s.writers += 1;
        }
        PipeEnd { index: self.index, is_reader: self.is_reader }
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        self.pipe().close_end(self.index, self.is_reader);
    }
}

/// Allocates a fresh pipe, returning its read and write ends.
pub fn alloc() -> Option<(PipeEnd, PipeEnd)> {
    let mut inuse = PIPE_INUSE.lock();
    for i in 0..NFILE {
        if !inuse[i] {
            inuse[i] = true;
            let mut s = PIPES[i].state.lock();
            s.nread = 0;
            s.nwrite = 0;
            s.readers = 1;
            s.writers = 1;
            return Some((PipeEnd { index: i, is_reader: true }, PipeEnd { index: i, is_reader: false }));
        }
    }
    None
}
