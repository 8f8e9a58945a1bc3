//! The open-file table: per-process file descriptors are
//! indices into each process's `ofile` array, which holds `FileRef`s into
//! this system-wide, refcounted table.
//!
//! Grounded in `examples/original_source/kernel/file.c`'s `struct file`
//! union of inode/pipe/device, widened only to own a `PipeEnd` instead of a
//! bare pipe pointer (our `pipe` module tracks open ends itself).

use crate::fs::{self, InodeRef};
use crate::lock::Spinlock;
use crate::param::NFILE;
use crate::pipe::PipeEnd;

pub enum FileKind {
    Inode { inode: InodeRef, off: Spinlock<u32> },
    Pipe(PipeEnd),
    Device { inode: InodeRef, major: u16 },
}

struct Slot {
    kind: Option<FileKind>,
    refcnt: u32,
    readable: bool,
    writable: bool,
}

static TABLE: [Spinlock<Slot>; NFILE] = array_macro::array![_ => Spinlock::new("file", Slot {
    kind: None, refcnt: 0, readable: false, writable: false,
}); NFILE];

/// A refcounted handle to one open-file-table entry (an xv6 `struct file *`).
/// Move-only, like `Rc`: duplicating a descriptor (`dup`, `fork`) always
/// goes through `dup`/`Clone`, never an implicit bitwise copy.
pub struct FileRef(usize);

impl Clone for FileRef {
    fn clone(&self) -> Self {
        TABLE[self.0].lock().refcnt += 1;
        FileRef(self.0)
    }
}

impl FileRef {
    pub fn dup(&self) -> FileRef {
        self.clone()
    }

    pub fn readable(&self) -> bool {
        TABLE[self.0].lock().readable
    }

    pub fn writable(&self) -> bool {
        TABLE[self.0].lock().writable
    }

    /// Drops one reference; on the last one, releases the underlying
    /// resource.
    pub fn close(self) {
        let last = {
            let mut slot = TABLE[self.0].lock();
            slot.refcnt -= 1;
            slot.refcnt == 0
        };
        if last {
            let kind = TABLE[self.0].lock().kind.take();
            match kind {
                Some(FileKind::Inode { inode, .. }) | Some(FileKind::Device { inode, .. }) => inode.put(),
                // A `FileKind::Pipe`'s `PipeEnd` releases its end when dropped here.
                _ => {}
            }
        }
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let slot = TABLE[self.0].lock();
        if !slot.readable {
            return Err(());
        }
        match slot.kind.as_ref().expect("read: closed file") {
            FileKind::Pipe(end) => {
                let pipe = end.pipe();
                drop(slot);
                pipe.read(dst)
            }
            FileKind::Inode { inode, off } => {
                let guard = inode.lock();
                let mut o = off.lock();
                let n = guard.read(dst, *o);
                *o += n as u32;
                Ok(n)
            }
            FileKind::Device { major, .. } => {
                let major = *major;
                drop(slot);
                crate::console::read(dst, major)
            }
        }
    }

    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let slot = TABLE[self.0].lock();
        if !slot.writable {
            return Err(());
        }
        match slot.kind.as_ref().expect("write: closed file") {
            FileKind::Pipe(end) => {
                let pipe = end.pipe();
                drop(slot);
                pipe.write(src)
            }
            FileKind::Inode { .. } => {
                // Inode writes go through the log; out of scope for the
                // thin inode surface this kernel implements.
                Err(())
            }
            FileKind::Device { major, .. } => {
                let major = *major;
                drop(slot);
                crate::console::write(src, major)
            }
        }
    }
}

/// `fstat`'s payload, grounded in `examples/original_source/kernel/stat.h`.
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub kind: u16,
    pub nlink: u16,
    pub size: u32,
}

impl FileRef {
    /// Inode/device metadata for `fstat`. `None` for a pipe, which the
    /// original's `filestat` also refuses.
    pub fn stat(&self) -> Option<Stat> {
        let slot = TABLE[self.0].lock();
        match slot.kind.as_ref()? {
            FileKind::Inode { inode, .. } | FileKind::Device { inode, .. } => {
                let _guard = inode.lock();
                Some(Stat {
                    dev: inode.dev(),
                    ino: inode.inum(),
                    kind: inode.kind(),
                    nlink: inode.nlink(),
                    size: inode.size(),
                })
            }
            FileKind::Pipe(_) => None,
        }
    }
}

fn alloc_slot(kind: FileKind, readable: bool, writable: bool) -> Option<FileRef> {
    for (i, slot) in TABLE.iter().enumerate() {
        let mut s = slot.lock();
        if s.refcnt == 0 {
            s.kind = Some(kind);
            s.refcnt = 1;
            s.readable = readable;
            s.writable = writable;
            return Some(FileRef(i));
        }
        drop(s);
    }
    None
}

pub fn open_pipe() -> Option<(FileRef, FileRef)> {
    let (rend, wend) = crate::pipe::alloc()?;
    let r = alloc_slot(FileKind::Pipe(rend), true, false)?;
    let w = match alloc_slot(FileKind::Pipe(wend), false, true) {
        Some(w) => w,
        None => {
            r.close();
            return None;
        }
    };
    Some((r, w))
}

pub fn open_inode(inode: InodeRef, readable: bool, writable: bool) -> Option<FileRef> {
    if inode.kind() == fs::T_DEVICE {
        let major = inode.device_major();
        return alloc_slot(FileKind::Device { inode, major }, readable, writable);
    }
    alloc_slot(FileKind::Inode { inode, off: Spinlock::new("file.off", 0) }, readable, writable)
}
