//! Compile-time configuration.
//!
//! Everything here is a `const`, not a runtime flag: a kernel's "config" is
//! board and topology selection, fixed at build time.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs (harts).
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size, in bytes.
pub const BSIZE: usize = 1024;

/// Max number of distinct blocks any single FS syscall writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the disk block cache, in buffers.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path length, in bytes.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name, in bytes.
pub const MAXPROCNAME: usize = 16;

/// Size of a process's kernel stack, in pages.
pub const KSTACK_PAGES: usize = 1;

/// Pipe buffer capacity, in bytes.
pub const PIPESIZE: usize = 512;
