//! On-disk layout types and a thin in-memory inode cache.
//!
//! Deliberately not a full path-lookup/directory layer: just enough of
//! `iget`/`ilock`/`iunlock`/`iput` (grounded in
//! `examples/original_source/kernel/fs.c`) to give the syscall layer and
//! `exec` a file to open and read.

pub mod log;

use crate::bio;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NINODE, ROOTDEV};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const ROOTINO: u32 = 1;
pub const FSMAGIC: u32 = 0x1020_3040;
pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct Superblock {
    pub magic: u32,
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

/// The on-disk inode format (`struct dinode`).
#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct Dinode {
    pub kind: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

static_assertions::const_assert!(core::mem::size_of::<Dinode>() <= BSIZE);

pub const T_UNUSED: u16 = 0;
pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEVICE: u16 = 3;

fn dinode_per_block() -> u32 {
    (BSIZE / core::mem::size_of::<Dinode>()) as u32
}

fn inode_block(sb: &Superblock, inum: u32) -> u32 {
    inum / dinode_per_block() + sb.inodestart
}

static SB: Spinlock<Option<Superblock>> = Spinlock::new("sb", None);

/// Reads the superblock from block 1 of `dev`. Must run before any inode
/// operation.
pub fn read_superblock(dev: u32) {
    let buf = bio::bread(dev, 1);
    let guard = buf.lock();
    let sb = Superblock::read_from_prefix(guard.data()).expect("fs: corrupt superblock");
    assert_eq!(sb.magic, FSMAGIC, "fs: bad magic");
    *SB.lock() = Some(sb);
}

pub fn superblock() -> Superblock {
    SB.lock().expect("fs: superblock not read")
}

struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
    valid: bool,
    kind: u16,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

struct Slot {
    meta: Spinlock<InodeMeta>,
    /// Guards reads/writes of this inode's content against concurrent I/O;
    /// `meta` is the identity/refcount half, `lock` the data half, exactly
    /// as in the original's split between `ip->ref`/`ip->lock`.
    lock: Sleeplock<()>,
}

static SLOTS: [Slot; NINODE] = array_macro::array![_ => Slot {
    meta: Spinlock::new("inode.meta", InodeMeta {
        dev: 0, inum: 0, refcnt: 0, valid: false,
        kind: T_UNUSED, major: 0, minor: 0, nlink: 0, size: 0,
        addrs: [0; NDIRECT + 1],
    }),
    lock: Sleeplock::new("inode", ()),
}; NINODE];

/// A refcounted handle to a cached in-memory inode.
pub struct InodeRef {
    index: usize,
}

impl InodeRef {
    pub fn dup(&self) -> InodeRef {
        SLOTS[self.index].meta.lock().refcnt += 1;
        InodeRef { index: self.index }
    }

    pub fn dev(&self) -> u32 {
        SLOTS[self.index].meta.lock().dev
    }

    pub fn inum(&self) -> u32 {
        SLOTS[self.index].meta.lock().inum
    }

    pub fn kind(&self) -> u16 {
        SLOTS[self.index].meta.lock().kind
    }

    pub fn size(&self) -> u32 {
        SLOTS[self.index].meta.lock().size
    }

    pub fn nlink(&self) -> u16 {
        SLOTS[self.index].meta.lock().nlink
    }

    /// The device major number, for `T_DEVICE` inodes. Loads the on-disk
    /// inode first if it hasn't been read yet.
    pub fn device_major(&self) -> u16 {
        let _guard = self.lock();
        SLOTS[self.index].meta.lock().major
    }

    /// Locks the inode's content, reading it from disk on first access
    /// (`ilock`).
    pub fn lock(&self) -> InodeGuard<'_> {
        let guard = SLOTS[self.index].lock.lock();
        if !SLOTS[self.index].meta.lock().valid {
            let sb = superblock();
            let (dev, inum) = (self.dev(), self.inum());
            let buf = bio::bread(dev, inode_block(&sb, inum));
            let bguard = buf.lock();
            let off = (inum % dinode_per_block()) as usize * core::mem::size_of::<Dinode>();
            let dinode =
                Dinode::read_from_prefix(&bguard.data()[off..]).expect("fs: corrupt dinode");
            let mut meta = SLOTS[self.index].meta.lock();
            meta.kind = dinode.kind;
            meta.major = dinode.major;
            meta.minor = dinode.minor;
            meta.nlink = dinode.nlink;
            meta.size = dinode.size;
            meta.addrs = dinode.addrs;
            meta.valid = true;
            assert_ne!(meta.kind, T_UNUSED, "fs: ilock of unallocated inode");
        }
        InodeGuard { inode: self, _guard: guard }
    }

    /// Drops one reference. If it reaches zero and the inode still has
    /// cached disk content, the slot is simply left `valid` for reuse
    /// (truncation-on-unlink is out of scope here).
    pub fn put(self) {
        drop(self);
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        SLOTS[self.index].meta.lock().refcnt -= 1;
    }
}

pub struct InodeGuard<'a> {
    inode: &'a InodeRef,
    _guard: SleeplockGuard<'static, ()>,
}

impl InodeGuard<'_> {
    /// Reads up to `dst.len()` bytes starting at `off` into `dst`, following
    /// direct and first-level indirect block pointers. Returns the number of
    /// bytes actually read.
    pub fn read(&self, dst: &mut [u8], off: u32) -> usize {
        let (dev, size, addrs) = {
            let meta = SLOTS[self.inode.index].meta.lock();
            (meta.dev, meta.size, meta.addrs)
        };
        if off >= size {
            return 0;
        }
        let n = core::cmp::min(dst.len(), (size - off) as usize);
        let mut done = 0usize;
        while done < n {
            let file_block = (off as usize + done) / BSIZE;
            let blockno = resolve_block(dev, &addrs, file_block);
            let buf = bio::bread(dev, blockno);
            let bguard = buf.lock();
            let block_off = (off as usize + done) % BSIZE;
            let take = core::cmp::min(BSIZE - block_off, n - done);
            dst[done..done + take].copy_from_slice(&bguard.data()[block_off..block_off + take]);
            done += take;
        }
        done
    }
}

fn resolve_block(dev: u32, addrs: &[u32; NDIRECT + 1], file_block: usize) -> u32 {
    if file_block < NDIRECT {
        return addrs[file_block];
    }
    let indirect_block = addrs[NDIRECT];
    let buf = bio::bread(dev, indirect_block);
    let guard = buf.lock();
    let idx = file_block - NDIRECT;
    let off = idx * core::mem::size_of::<u32>();
    u32::from_ne_bytes(guard.data()[off..off + 4].try_into().unwrap())
}

/// Looks up (or loads) the cached inode for `(dev, inum)` (`iget`).
pub fn iget(dev: u32, inum: u32) -> InodeRef {
    for (i, slot) in SLOTS.iter().enumerate() {
        let mut meta = slot.meta.lock();
        if meta.refcnt > 0 && meta.dev == dev && meta.inum == inum {
            meta.refcnt += 1;
            return InodeRef { index: i };
        }
    }
    for (i, slot) in SLOTS.iter().enumerate() {
        let mut meta = slot.meta.lock();
        if meta.refcnt == 0 {
            meta.dev = dev;
            meta.inum = inum;
            meta.refcnt = 1;
            meta.valid = false;
            return InodeRef { index: i };
        }
    }
    panic!("iget: no inodes");
}

pub fn root_inode() -> Option<InodeRef> {
    Some(iget(ROOTDEV, ROOTINO))
}
