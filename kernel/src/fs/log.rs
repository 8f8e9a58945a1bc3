//! Write-ahead log for crash-consistent multi-block filesystem writes:
//! group commit across concurrently-running syscalls, with
//! the on-disk header write as the single commit point.
//!
//! Grounded directly in `examples/original_source/kernel/log.c`; the
//! `begin_op`/`end_op`/`commit`/`recover_from_log` sequencing here is a
//! line-for-line port of that file's control flow.

use crate::bio::{self, BufRef};
use crate::lock::Spinlock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use crate::proc::WaitChannel;
use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy)]
#[repr(C)]
struct LogHeaderRepr {
    n: u32,
    block: [u32; LOGSIZE],
}

static_assertions::const_assert!(core::mem::size_of::<LogHeaderRepr>() < BSIZE);

struct LogState {
    dev: u32,
    start: u32,
    size: u32,
    /// Number of FS syscalls currently between `begin_op`/`end_op`.
    outstanding: u32,
    /// Set while `commit()` is running, to block new transactions.
    committing: bool,
    /// Block numbers of the modified blocks recorded so far this transaction.
    blocks: ArrayVec<u32, LOGSIZE>,
}

pub struct Log {
    state: Spinlock<LogState>,
    chan: WaitChannel,
}

pub static LOG: Log = Log {
    state: Spinlock::new(
        "log",
        LogState { dev: 0, start: 0, size: 0, outstanding: 0, committing: false, blocks: ArrayVec::new_const() },
    ),
    chan: WaitChannel::new(),
};

/// RAII guard for one FS syscall's logged transaction: `begin_op` on
/// creation, `end_op` on drop.
pub struct LogOp;

impl Drop for LogOp {
    fn drop(&mut self) {
        LOG.end_op();
    }
}

impl Log {
    /// Must run once at boot, after the superblock has been read, and before
    /// any `begin_op`. Replays any committed-but-not-yet-installed
    /// transaction left over from an unclean shutdown.
    pub fn init(&self, dev: u32, logstart: u32, nlog: u32) {
        {
            let mut s = self.state.lock();
            s.dev = dev;
            s.start = logstart;
            s.size = nlog;
        }
        self.recover_from_log();
    }

    /// Runs once, right after the first process is scheduled, since
    /// `fsinit`/recovery needs `bread`, which in turn needs a runnable
    /// process to sleep on the buffer cache if contended -- `main` itself
    /// runs before any process exists.
    pub fn init_after_first_boot(&self) {
        crate::fs::read_superblock(crate::param::ROOTDEV);
        let sb = crate::fs::superblock();
        self.init(crate::param::ROOTDEV, sb.logstart, sb.nlog);
    }

    fn read_head(&self) -> LogHeaderRepr {
        let start = self.state.lock().start;
        let buf = bio::bread(self.state.lock().dev, start);
        let guard = buf.lock();
        LogHeaderRepr::read_from_prefix(guard.data()).expect("log: corrupt header")
    }

    fn write_head(&self) {
        let (dev, start, n, blocks) = {
            let s = self.state.lock();
            (s.dev, s.start, s.blocks.len() as u32, s.blocks.clone())
        };
        let buf = bio::bread(dev, start);
        let mut guard = buf.lock();
        let mut repr = LogHeaderRepr { n, block: [0; LOGSIZE] };
        repr.block[..blocks.len()].copy_from_slice(&blocks);
        guard.data_mut()[..core::mem::size_of::<LogHeaderRepr>()].copy_from_slice(repr.as_bytes());
        guard.write_through();
    }

    fn recover_from_log(&self) {
        let head = self.read_head();
        self.install_trans(&head, true);
        self.state.lock().blocks.clear();
        self.write_head();
    }

    /// Copies every logged block from the log region to its home location.
    fn install_trans(&self, head: &LogHeaderRepr, recovering: bool) {
        let (dev, start) = {
            let s = self.state.lock();
            (s.dev, s.start)
        };
        for tail in 0..head.n as usize {
            let logbuf = bio::bread(dev, start + 1 + tail as u32);
            let dstbuf = bio::bread(dev, head.block[tail]);
            {
                let logguard = logbuf.lock();
                let mut dstguard = dstbuf.lock();
                *dstguard.data_mut() = *logguard.data();
                dstguard.write_through();
            }
            if !recovering {
                dstbuf.unpin();
            }
        }
    }

    /// Marks the start of an FS syscall's transaction. Blocks if a commit is
    /// in progress, or if admitting this call could overflow the log.
    pub fn begin_op(&self) -> LogOp {
        loop {
            let mut s = self.state.lock();
            if s.committing {
                s = self.chan.sleep(s);
                continue;
            }
            if s.blocks.len() as u32 + (s.outstanding + 1) * MAXOPBLOCKS as u32 > s.size {
                s = self.chan.sleep(s);
                continue;
            }
            s.outstanding += 1;
            break;
        }
        LogOp
    }

    fn end_op(&self) {
        let do_commit;
        {
            let mut s = self.state.lock();
            s.outstanding -= 1;
            assert!(!s.committing, "log: committing during end_op");
            if s.outstanding == 0 {
                do_commit = true;
                s.committing = true;
            } else {
                do_commit = false;
                self.chan.wakeup();
            }
        }

        if do_commit {
            self.commit();
            let mut s = self.state.lock();
            s.committing = false;
            self.chan.wakeup();
        }
    }

    /// Copies every `log_write`-recorded block from the cache into the log
    /// region.
    fn write_log(&self) {
        let (dev, start, blocks) = {
            let s = self.state.lock();
            (s.dev, s.start, s.blocks.clone())
        };
        for (tail, &blockno) in blocks.iter().enumerate() {
            let to = bio::bread(dev, start + 1 + tail as u32);
            let from = bio::bread(dev, blockno);
            let mut toguard = to.lock();
            let fromguard = from.lock();
            *toguard.data_mut() = *fromguard.data();
            toguard.write_through();
        }
    }

    /// Commits the current transaction: writes the log, then the header
    /// (the real commit point), then installs to home locations, then clears
    /// the header again. Must not be called while holding `self.state`.
    fn commit(&self) {
        let n = self.state.lock().blocks.len();
        if n == 0 {
            return;
        }
        self.write_log();
        self.write_head();
        let head = self.read_head();
        self.install_trans(&head, false);
        self.state.lock().blocks.clear();
        self.write_head();
    }

    /// Records that `buf` was modified by the current transaction, pinning
    /// it in the cache until the transaction commits (`log_write`).
    pub fn write(&self, buf: &BufRef) {
        let mut s = self.state.lock();
        assert!(s.outstanding >= 1, "log_write: outside of transaction");
        let blockno = buf.blockno();
        if !s.blocks.contains(&blockno) {
            assert!((s.blocks.len() as u32) < s.size - 1, "log_write: transaction too big");
            s.blocks.push(blockno);
            buf.pin();
        }
    }
}
