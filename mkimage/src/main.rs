//! Builds a bootable disk image for `rvkernel`: zeroed boot block,
//! superblock, write-ahead log region, inode blocks, a one-block free
//! bitmap, and data blocks holding a root directory plus whatever input
//! files are given on the command line.
//!
//! Grounded in `examples/LENSHOOD-xv6-rust/mkfs/src/main.rs`; the layout
//! (`[boot | sb | log | inodes | bitmap | data]`) and the
//! alloc/append/bitmap sequencing are a direct port of that file's control
//! flow onto `rvkernel`'s own `Superblock`/`Dinode` layout ([`layout`]).

mod layout;

use clap::Parser;
use layout::{
    dinode_per_block, inode_block, Dinode, Dirent, Superblock, BSIZE, DIRSIZ, FSMAGIC, LOGSIZE,
    MAXFILE, NDIRECT, NINDIRECT, ROOTINO, T_DIR, T_FILE,
};
use std::fs::File;
use std::io::{Read, Result, Seek, SeekFrom, Write};
use zerocopy::{AsBytes, FromBytes};

const NINODES: u32 = 200;

#[derive(Parser, Debug)]
#[command(about = "Build an rvkernel disk image")]
struct Args {
    /// Path of the image file to create.
    #[arg(short, long)]
    output: String,

    /// Total size of the image, in blocks.
    #[arg(long, default_value_t = 2000)]
    size_blocks: u32,

    /// Files to place in the image's root directory.
    #[arg(short, long)]
    files: Vec<String>,
}

/// Tracks the next unused inode number and the next unallocated data block,
/// threaded through every allocation call instead of kept as statics (this
/// tool runs single-threaded, start to finish, once).
struct Builder {
    img: File,
    sb: Superblock,
    next_inode: u32,
    next_block: u32,
}

fn main() -> Result<()> {
    assert_eq!(BSIZE % core::mem::size_of::<Dinode>(), 0, "Dinode doesn't divide BSIZE evenly");
    assert_eq!(BSIZE % core::mem::size_of::<Dirent>(), 0, "Dirent doesn't divide BSIZE evenly");

    let args = Args::parse();

    let nbitmap = args.size_blocks / (BSIZE as u32 * 8) + 1;
    let ninodeblocks = NINODES / dinode_per_block() + 1;
    let nlog = LOGSIZE;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    let nblocks = args.size_blocks - nmeta;

    println!(
        "nmeta {} (boot, super, log blocks {}, inode blocks {}, bitmap blocks {}) blocks {} total {}",
        nmeta, nlog, ninodeblocks, nbitmap, nblocks, args.size_blocks
    );

    let img = File::options().read(true).write(true).create(true).truncate(true).open(&args.output)?;

    let sb = Superblock {
        magic: FSMAGIC,
        size: args.size_blocks,
        nblocks,
        ninodes: NINODES,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };

    let mut b = Builder { img, sb, next_inode: 1, next_block: nmeta };

    for i in 0..args.size_blocks {
        b.wsect(i, &[0u8; BSIZE])?;
    }
    let mut sb_block = [0u8; BSIZE];
    sb_block[..core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    b.wsect(1, &sb_block)?;

    let rootino = b.ialloc(T_DIR)?;
    assert_eq!(rootino, ROOTINO);

    b.append_dirent(rootino, rootino, ".")?;
    b.append_dirent(rootino, rootino, "..")?;

    for path in &args.files {
        let short_name = root_relative_name(path);
        assert!(!short_name.contains('/'), "mkimage: {} must be a bare filename", short_name);

        let inum = b.ialloc(T_FILE)?;
        b.append_dirent(rootino, inum, &short_name)?;

        let mut file = File::open(path)?;
        let mut buf = [0u8; BSIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            b.iappend(inum, &buf[..n])?;
        }
    }

    // Round the root directory's size up to a whole block, as the kernel's
    // directory reader will expect.
    let mut din = b.rinode(rootino);
    din.size = (((din.size as usize / BSIZE) + 1) * BSIZE) as u32;
    b.winode(rootino, &din)?;

    b.balloc()?;
    Ok(())
}

/// Strips a leading `user/` directory and a leading `_` (xv6's convention
/// for naming host-built binaries so the build doesn't shadow a build-time
/// command of the same name).
fn root_relative_name(path: &str) -> String {
    let stripped = path.strip_prefix("user/").unwrap_or(path);
    stripped.strip_prefix('_').unwrap_or(stripped).to_string()
}

impl Builder {
    fn wsect(&mut self, sector: u32, buf: &[u8; BSIZE]) -> Result<()> {
        self.img.seek(SeekFrom::Start(sector as u64 * BSIZE as u64))?;
        self.img.write_all(buf)
    }

    fn rsect(&mut self, sector: u32, buf: &mut [u8; BSIZE]) -> Result<()> {
        self.img.seek(SeekFrom::Start(sector as u64 * BSIZE as u64))?;
        self.img.read_exact(buf)
    }

    fn winode(&mut self, inum: u32, ip: &Dinode) -> Result<()> {
        let bn = inode_block(&self.sb, inum);
        let mut buf = [0u8; BSIZE];
        self.rsect(bn, &mut buf)?;
        let off = (inum % dinode_per_block()) as usize * core::mem::size_of::<Dinode>();
        buf[off..off + core::mem::size_of::<Dinode>()].copy_from_slice(ip.as_bytes());
        self.wsect(bn, &buf)
    }

    fn rinode(&mut self, inum: u32) -> Dinode {
        let bn = inode_block(&self.sb, inum);
        let mut buf = [0u8; BSIZE];
        self.rsect(bn, &mut buf).expect("mkimage: read inode block");
        let off = (inum % dinode_per_block()) as usize * core::mem::size_of::<Dinode>();
        Dinode::read_from_prefix(&buf[off..]).expect("mkimage: corrupt dinode")
    }

    fn ialloc(&mut self, kind: u16) -> Result<u32> {
        let inum = self.next_inode;
        self.next_inode += 1;
        let din = Dinode { kind, major: 0, minor: 0, nlink: 1, size: 0, addrs: [0; NDIRECT + 1] };
        self.winode(inum, &din)?;
        Ok(inum)
    }

    fn alloc_block(&mut self) -> u32 {
        let b = self.next_block;
        self.next_block += 1;
        b
    }

    fn append_dirent(&mut self, dir_inum: u32, inum: u32, name: &str) -> Result<()> {
        assert!(name.len() <= DIRSIZ, "mkimage: name too long: {}", name);
        let mut de = Dirent { inum: inum as u16, name: [0; DIRSIZ] };
        de.name[..name.len()].copy_from_slice(name.as_bytes());
        self.iappend(dir_inum, de.as_bytes())
    }

    /// Appends `data` to inode `inum`'s content, walking/allocating direct
    /// and first-level-indirect block pointers as needed.
    fn iappend(&mut self, inum: u32, data: &[u8]) -> Result<()> {
        let mut din = self.rinode(inum);
        let mut off = din.size as usize;
        let mut pos = 0usize;

        while pos < data.len() {
            let fbn = off / BSIZE;
            assert!(fbn < MAXFILE, "mkimage: file too large");

            let blockno = if fbn < NDIRECT {
                if din.addrs[fbn] == 0 {
                    din.addrs[fbn] = self.alloc_block();
                }
                din.addrs[fbn]
            } else {
                if din.addrs[NDIRECT] == 0 {
                    din.addrs[NDIRECT] = self.alloc_block();
                }
                let mut indirect = [0u32; NINDIRECT];
                self.read_indirect(din.addrs[NDIRECT], &mut indirect)?;
                let idx = fbn - NDIRECT;
                if indirect[idx] == 0 {
                    indirect[idx] = self.alloc_block();
                    self.write_indirect(din.addrs[NDIRECT], &indirect)?;
                }
                indirect[idx]
            };

            let n1 = core::cmp::min(data.len() - pos, (fbn + 1) * BSIZE - off);
            let mut buf = [0u8; BSIZE];
            self.rsect(blockno, &mut buf)?;
            let start = off - fbn * BSIZE;
            buf[start..start + n1].copy_from_slice(&data[pos..pos + n1]);
            self.wsect(blockno, &buf)?;

            off += n1;
            pos += n1;
        }

        din.size = off as u32;
        self.winode(inum, &din)
    }

    fn read_indirect(&mut self, blockno: u32, out: &mut [u32; NINDIRECT]) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        self.rsect(blockno, &mut buf)?;
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            out[i] = u32::from_ne_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    fn write_indirect(&mut self, blockno: u32, data: &[u32; NINDIRECT]) -> Result<()> {
        let mut buf = [0u8; BSIZE];
        for (i, &v) in data.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        self.wsect(blockno, &buf)
    }

    /// Marks every block already handed out by `alloc_block` as used in the
    /// single free bitmap block (this image is small enough that one block
    /// of bitmap always covers it, per [`layout`]'s `nbitmap` sizing).
    fn balloc(&mut self) -> Result<()> {
        let used = self.next_block;
        println!("balloc: first {} blocks have been allocated", used);
        assert!((used as usize) < BSIZE * 8, "mkimage: free bitmap needs more than one block");

        let mut buf = [0u8; BSIZE];
        for i in 0..used as usize {
            buf[i / 8] |= 1 << (i % 8);
        }
        self.wsect(self.sb.bmapstart, &buf)
    }
}
