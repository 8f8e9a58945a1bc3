//! On-disk layout types, duplicated from `rvkernel::fs` rather than
//! depended on directly: that crate is `no_std`/`no_main` and its
//! `global_asm!` boot stub only assembles for the riscv64 target, so it
//! can't be linked into a host-architecture binary. Grounded in
//! `examples/LENSHOOD-xv6-rust/mkfs/src/deps.rs`, which duplicates the same
//! kernel types for the same reason; the field layout itself must match
//! `rvkernel::fs::{Superblock, Dinode}` byte-for-byte.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const MAXOPBLOCKS: u32 = 10;
pub const LOGSIZE: u32 = MAXOPBLOCKS * 3;

pub const BSIZE: usize = 1024;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

pub const ROOTINO: u32 = 1;
pub const FSMAGIC: u32 = 0x1020_3040;

pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;

pub const DIRSIZ: usize = 14;

#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy)]
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

#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct Dinode {
    pub kind: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

pub fn dinode_per_block() -> u32 {
    (BSIZE / core::mem::size_of::<Dinode>()) as u32
}

pub fn inode_block(sb: &Superblock, inum: u32) -> u32 {
    inum / dinode_per_block() + sb.inodestart
}

#[derive(FromBytes, FromZeroes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}
