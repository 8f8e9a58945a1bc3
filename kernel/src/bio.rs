//! Buffered block I/O: a fixed pool of `NBUF` cache slots, LRU
//! eviction among slots with no outstanding reference, and a per-buffer
//! sleeplock so only one thread at a time touches a given block's data.
//!
//! Grounded in `examples/original_source/kernel/bio.c`: a doubly linked list
//! threaded through the fixed array, most-recently-used at the head, so
//! `bget` always evicts from the tail.

use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NBUF};
use crate::virtio;

struct BufMeta {
    valid: bool,
    dev: u32,
    blockno: u32,
    refcnt: u32,
    /// Index of the previous (more recently used) slot, or `usize::MAX`.
    prev: usize,
    /// Index of the next (less recently used) slot, or `usize::MAX`.
    next: usize,
}

const NIL: usize = usize::MAX;

struct BufData {
    bytes: [u8; BSIZE],
}

/// One cache slot. `meta` (refcount, LRU links, identity) is owned by the
/// cache's single spinlock; `data` is owned by the slot's own sleeplock,
/// since disk I/O can block while holding it.
struct Slot {
    data: Sleeplock<BufData>,
}

struct Bcache {
    meta: Spinlock<[BufMeta; NBUF]>,
}

static SLOTS: [Slot; NBUF] = array_macro::array![_ => Slot {
    data: Sleeplock::new("buf", BufData { bytes: [0; BSIZE] }),
}; NBUF];

static BCACHE: Bcache = Bcache {
    meta: Spinlock::new(
        "bcache",
        array_macro::array![i => BufMeta {
            valid: false,
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: if i == 0 { NIL } else { i - 1 },
            next: if i + 1 == NBUF { NIL } else { i + 1 },
        }; NBUF],
    ),
};

static HEAD: Spinlock<usize> = Spinlock::new("bcache.head", 0);

/// A pinned reference to one cached block. Dropping it decrements the
/// refcount (`brelse`); it does not release the per-block sleeplock, which
/// callers take separately via `lock()`.
pub struct BufRef {
    index: usize,
}

impl BufRef {
    pub fn blockno(&self) -> u32 {
        BCACHE.meta.lock()[self.index].blockno
    }

    /// Locks this block's contents and, if not already valid, reads it from
    /// disk first (`bread`).
    pub fn lock(&self) -> BufGuard<'_> {
        let mut guard = SLOTS[self.index].data.lock();
        if !BCACHE.meta.lock()[self.index].valid {
            let (dev, blockno) = {
                let meta = BCACHE.meta.lock();
                (meta[self.index].dev, meta[self.index].blockno)
            };
            virtio::disk_rw(dev, blockno, &mut guard.bytes, false);
            BCACHE.meta.lock()[self.index].valid = true;
        }
        BufGuard { buf: self, guard }
    }

    /// Increments the refcount without acquiring the lock (`bpin`), keeping
    /// the slot from being recycled while the log holds a reference to it.
    pub fn pin(&self) {
        BCACHE.meta.lock()[self.index].refcnt += 1;
    }

    pub fn unpin(&self) {
        BCACHE.meta.lock()[self.index].refcnt -= 1;
    }
}

impl Clone for BufRef {
    fn clone(&self) -> Self {
        BCACHE.meta.lock()[self.index].refcnt += 1;
        BufRef { index: self.index }
    }
}

impl Drop for BufRef {
    fn drop(&mut self) {
        let mut meta = BCACHE.meta.lock();
        meta[self.index].refcnt -= 1;
        if meta[self.index].refcnt == 0 {
            move_to_head(&mut meta, self.index);
        }
    }
}

pub struct BufGuard<'a> {
    buf: &'a BufRef,
    guard: SleeplockGuard<'static, BufData>,
}

impl BufGuard<'_> {
    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard.bytes
    }

    /// Writes this block to disk synchronously (`bwrite`). Callers that log
    /// a write should call `log::Log::write` instead of this directly.
    pub fn write_through(&mut self) {
        let dev = BCACHE.meta.lock()[self.buf.index].dev;
        let blockno = self.buf.blockno();
        virtio::disk_rw(dev, blockno, &mut self.guard.bytes, true);
    }
}

fn move_to_head(meta: &mut [BufMeta; NBUF], index: usize) {
    let (prev, next) = (meta[index].prev, meta[index].next);
    if prev != NIL {
        meta[prev].next = next;
    }
    if next != NIL {
        meta[next].prev = prev;
    }
    let mut head = HEAD.lock();
    meta[index].prev = NIL;
    meta[index].next = *head;
    if *head != NIL {
        meta[*head].prev = index;
    }
    *head = index;
}

/// Returns a reference to the cached block `(dev, blockno)`, reusing an
/// existing cached copy or evicting the least-recently-used unreferenced
/// slot. Panics if every slot is pinned (the working set must never
/// exceed `NBUF`).
pub fn bread(dev: u32, blockno: u32) -> BufRef {
    let mut meta = BCACHE.meta.lock();

    for i in 0..NBUF {
        if meta[i].valid && meta[i].dev == dev && meta[i].blockno == blockno {
            meta[i].refcnt += 1;
            return BufRef { index: i };
        }
    }

    // Walk the LRU list from the head to find its tail (least recently
    // used), then scan back toward the head for the first free slot.
    let head = *HEAD.lock();
    assert_ne!(head, NIL, "bread: no buffers");
    let mut i = head;
    while meta[i].next != NIL {
        i = meta[i].next;
    }
    loop {
        if meta[i].refcnt == 0 {
            meta[i].dev = dev;
            meta[i].blockno = blockno;
            meta[i].valid = false;
            meta[i].refcnt = 1;
            return BufRef { index: i };
        }
        if meta[i].prev == NIL {
            panic!("bread: no buffers");
        }
        i = meta[i].prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_blocks_get_distinct_slots() {
        let a = bread(1, 0);
        let b = bread(1, 1);
        assert_ne!(a.index, b.index);
    }
}
