//! virtio-mmio block device driver (qemu's `virtio-blk-device`).
//!
//! Grounded directly in `examples/original_source/kernel/virtio.h` and
//! `virtio_disk.c`: a single legacy split virtqueue of `NUM` descriptors,
//! three descriptors per request (header, data, 1-byte status), with
//! completion delivered through the used ring and a per-disk spinlock
//! guarding the whole thing including the in-flight sleep.

use crate::param::BSIZE;

#[cfg(not(test))]
mod imp {
    use crate::kalloc::KMEM;
    use crate::lock::{Spinlock, SpinlockGuard};
    use crate::memlayout::VIRTIO0;
    use crate::param::BSIZE;
    use crate::proc::WaitChannel;
    use crate::riscv::PGSIZE;

    const MAGIC_VALUE: usize = 0x000;
    const VERSION: usize = 0x004;
    const DEVICE_ID: usize = 0x008;
    const VENDOR_ID: usize = 0x00c;
    const DEVICE_FEATURES: usize = 0x010;
    const DRIVER_FEATURES: usize = 0x020;
    const QUEUE_SEL: usize = 0x030;
    const QUEUE_NUM_MAX: usize = 0x034;
    const QUEUE_NUM: usize = 0x038;
    const QUEUE_READY: usize = 0x044;
    const QUEUE_NOTIFY: usize = 0x050;
    const INTERRUPT_STATUS: usize = 0x060;
    const INTERRUPT_ACK: usize = 0x064;
    const STATUS: usize = 0x070;
    const QUEUE_DESC_LOW: usize = 0x080;
    const QUEUE_DESC_HIGH: usize = 0x084;
    const DRIVER_DESC_LOW: usize = 0x090;
    const DRIVER_DESC_HIGH: usize = 0x094;
    const DEVICE_DESC_LOW: usize = 0x0a0;
    const DEVICE_DESC_HIGH: usize = 0x0a4;

    const CONFIG_S_ACKNOWLEDGE: u32 = 1;
    const CONFIG_S_DRIVER: u32 = 2;
    const CONFIG_S_DRIVER_OK: u32 = 4;
    const CONFIG_S_FEATURES_OK: u32 = 8;

    const BLK_F_RO: u32 = 5;
    const BLK_F_SCSI: u32 = 7;
    const BLK_F_CONFIG_WCE: u32 = 11;
    const BLK_F_MQ: u32 = 12;
    const F_ANY_LAYOUT: u32 = 27;
    const RING_F_INDIRECT_DESC: u32 = 28;
    const RING_F_EVENT_IDX: u32 = 29;

    /// Number of descriptors in the virtqueue; must be a power of two.
    const NUM: usize = 8;

    const DESC_F_NEXT: u16 = 1;
    const DESC_F_WRITE: u16 = 2;

    const BLK_T_IN: u32 = 0;
    const BLK_T_OUT: u32 = 1;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct VirtqDesc {
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    }

    #[repr(C)]
    struct VirtqAvail {
        flags: u16,
        idx: u16,
        ring: [u16; NUM],
        unused: u16,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct VirtqUsedElem {
        id: u32,
        len: u32,
    }

    #[repr(C)]
    struct VirtqUsed {
        flags: u16,
        idx: u16,
        ring: [VirtqUsedElem; NUM],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct VirtioBlkReq {
        kind: u32,
        reserved: u32,
        sector: u64,
    }

    unsafe fn reg(r: usize) -> *mut u32 {
        (VIRTIO0 + r) as *mut u32
    }

    unsafe fn read_reg(r: usize) -> u32 {
        unsafe { core::ptr::read_volatile(reg(r)) }
    }

    unsafe fn write_reg(r: usize, v: u32) {
        unsafe { core::ptr::write_volatile(reg(r), v) };
    }

    /// Per-request bookkeeping, indexed by the chain's head descriptor.
    struct Info {
        /// Set while the device owns the request; cleared by `intr`.
        in_flight: bool,
        status: u8,
    }

    struct Disk {
        desc: *mut VirtqDesc,
        avail: *mut VirtqAvail,
        used: *mut VirtqUsed,
        free: [bool; NUM],
        used_idx: u16,
        info: [Info; NUM],
        ops: [VirtioBlkReq; NUM],
    }

    // SAFETY: all access to `Disk` goes through `DISK_LOCK`.
    unsafe impl Send for Disk {}

    static DISK_LOCK: Spinlock<Disk> = Spinlock::new(
        "virtio_disk",
        Disk {
            desc: core::ptr::null_mut(),
            avail: core::ptr::null_mut(),
            used: core::ptr::null_mut(),
            free: [false; NUM],
            used_idx: 0,
            info: [const { Info { in_flight: false, status: 0 } }; NUM],
            ops: [const {
                VirtioBlkReq { kind: 0, reserved: 0, sector: 0 }
            }; NUM],
        },
    );
    static FREE_CHAN: WaitChannel = WaitChannel::new();
    static DONE_CHAN: WaitChannel = WaitChannel::new();

    pub fn init() {
        let mut status: u32 = 0;
        unsafe {
            assert_eq!(read_reg(MAGIC_VALUE), 0x7472_6976, "virtio disk not found");
            assert_eq!(read_reg(VERSION), 2, "virtio disk version mismatch");
            assert_eq!(read_reg(DEVICE_ID), 2, "virtio disk not a block device");
            assert_eq!(read_reg(VENDOR_ID), 0x554d_4551, "virtio disk vendor mismatch");

            write_reg(STATUS, 0);
            status |= CONFIG_S_ACKNOWLEDGE;
            write_reg(STATUS, status);
            status |= CONFIG_S_DRIVER;
            write_reg(STATUS, status);

            let mut features = read_reg(DEVICE_FEATURES);
            features &= !(1 << BLK_F_RO);
            features &= !(1 << BLK_F_SCSI);
            features &= !(1 << BLK_F_CONFIG_WCE);
            features &= !(1 << BLK_F_MQ);
            features &= !(1 << F_ANY_LAYOUT);
            features &= !(1 << RING_F_EVENT_IDX);
            features &= !(1 << RING_F_INDIRECT_DESC);
            write_reg(DRIVER_FEATURES, features);

            status |= CONFIG_S_FEATURES_OK;
            write_reg(STATUS, status);
            assert_ne!(read_reg(STATUS) & CONFIG_S_FEATURES_OK, 0, "virtio disk FEATURES_OK unset");

            write_reg(QUEUE_SEL, 0);
            assert_eq!(read_reg(QUEUE_READY), 0, "virtio disk should not be ready");
            let max = read_reg(QUEUE_NUM_MAX);
            assert_ne!(max, 0, "virtio disk has no queue 0");
            assert!(max as usize >= NUM, "virtio disk max queue too short");

            let desc_page = KMEM.alloc().expect("virtio disk kalloc (desc)").into_usize();
            let avail_page = KMEM.alloc().expect("virtio disk kalloc (avail)").into_usize();
            let used_page = KMEM.alloc().expect("virtio disk kalloc (used)").into_usize();
            core::ptr::write_bytes(desc_page as *mut u8, 0, PGSIZE);
            core::ptr::write_bytes(avail_page as *mut u8, 0, PGSIZE);
            core::ptr::write_bytes(used_page as *mut u8, 0, PGSIZE);

            write_reg(QUEUE_NUM, NUM as u32);
            write_reg(QUEUE_DESC_LOW, desc_page as u32);
            write_reg(QUEUE_DESC_HIGH, (desc_page as u64 >> 32) as u32);
            write_reg(DRIVER_DESC_LOW, avail_page as u32);
            write_reg(DRIVER_DESC_HIGH, (avail_page as u64 >> 32) as u32);
            write_reg(DEVICE_DESC_LOW, used_page as u32);
            write_reg(DEVICE_DESC_HIGH, (used_page as u64 >> 32) as u32);

            write_reg(QUEUE_READY, 1);

            let mut d = DISK_LOCK.lock();
            d.desc = desc_page as *mut VirtqDesc;
            d.avail = avail_page as *mut VirtqAvail;
            d.used = used_page as *mut VirtqUsed;
            for f in d.free.iter_mut() {
                *f = true;
            }
            drop(d);

            status |= CONFIG_S_DRIVER_OK;
            write_reg(STATUS, status);
        }
        // The PLIC is configured to route VIRTIO0_IRQ to us separately.
    }

    fn alloc_desc(d: &mut Disk) -> Option<usize> {
        for i in 0..NUM {
            if d.free[i] {
                d.free[i] = false;
                return Some(i);
            }
        }
        None
    }

    fn free_desc(d: &mut Disk, i: usize) {
        assert!(!d.free[i], "virtio free_desc: already free");
        unsafe {
            (*d.desc.add(i)).addr = 0;
            (*d.desc.add(i)).len = 0;
            (*d.desc.add(i)).flags = 0;
            (*d.desc.add(i)).next = 0;
        }
        d.free[i] = true;
        FREE_CHAN.wakeup();
    }

    fn free_chain(d: &mut Disk, mut i: usize) {
        loop {
            let (flags, next) = unsafe { ((*d.desc.add(i)).flags, (*d.desc.add(i)).next) };
            free_desc(d, i);
            if flags & DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    fn alloc3_desc(d: &mut Disk) -> Option<[usize; 3]> {
        let mut idx = [0usize; 3];
        for slot in 0..3 {
            match alloc_desc(d) {
                Some(i) => idx[slot] = i,
                None => {
                    for j in idx.iter().take(slot) {
                        free_desc(d, *j);
                    }
                    return None;
                }
            }
        }
        Some(idx)
    }

    /// Performs one synchronous (from the caller's point of view) block read
    /// or write through the device; blocks the calling process until the
    /// device signals completion via interrupt.
    pub fn disk_rw(_dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        let sector = blockno as u64 * (BSIZE as u64 / 512);

        let mut d = DISK_LOCK.lock();
        let idx = loop {
            if let Some(idx) = alloc3_desc(&mut d) {
                break idx;
            }
            d = FREE_CHAN.sleep(d);
        };

        d.ops[idx[0]] = VirtioBlkReq {
            kind: if write { BLK_T_OUT } else { BLK_T_IN },
            reserved: 0,
            sector,
        };

        unsafe {
            let req_addr = &d.ops[idx[0]] as *const VirtioBlkReq as u64;
            *d.desc.add(idx[0]) = VirtqDesc {
                addr: req_addr,
                len: core::mem::size_of::<VirtioBlkReq>() as u32,
                flags: DESC_F_NEXT,
                next: idx[1] as u16,
            };

            *d.desc.add(idx[1]) = VirtqDesc {
                addr: data.as_mut_ptr() as u64,
                len: BSIZE as u32,
                flags: DESC_F_NEXT | if write { 0 } else { DESC_F_WRITE },
                next: idx[2] as u16,
            };

            d.info[idx[0]].status = 0xff;
            d.info[idx[0]].in_flight = true;
            *d.desc.add(idx[2]) = VirtqDesc {
                addr: &d.info[idx[0]].status as *const u8 as u64,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };

            let avail_idx = (*d.avail).idx;
            (*d.avail).ring[(avail_idx as usize) % NUM] = idx[0] as u16;
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            (*d.avail).idx = avail_idx.wrapping_add(1);
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            write_reg(QUEUE_NOTIFY, 0);
        }

        while d.info[idx[0]].in_flight {
            d = DONE_CHAN.sleep(d);
        }

        free_chain(&mut d, idx[0]);
        drop(d);
    }

    /// Completion interrupt: drains the used ring, marking each finished
    /// request done and waking whoever is sleeping on `DONE_CHAN`.
    pub fn intr() {
        let mut d = DISK_LOCK.lock();

        unsafe {
            write_reg(INTERRUPT_ACK, read_reg(INTERRUPT_STATUS) & 0x3);
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        unsafe {
            while d.used_idx != (*d.used).idx {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
                let id = (*d.used).ring[(d.used_idx as usize) % NUM].id as usize;
                assert_eq!(d.info[id].status, 0, "virtio disk_intr: bad status");
                d.info[id].in_flight = false;
                d.used_idx = d.used_idx.wrapping_add(1);
            }
        }
        DONE_CHAN.wakeup();
        drop(d);
    }
}

#[cfg(not(test))]
pub use imp::{disk_rw, init, intr};

/// Host stand-in: `bio::bread`/`BufGuard::write_through` call this
/// unconditionally, so it must exist (doing nothing) on a host target.
#[cfg(test)]
pub fn disk_rw(_dev: u32, _blockno: u32, _data: &mut [u8; BSIZE], _write: bool) {}
