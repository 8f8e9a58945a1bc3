//! A small multiprocessor RISC-V 64-bit (Sv39) kernel: page tables, a
//! preemptive round-robin scheduler, spinlocks/sleeplocks, buffered block
//! I/O backed by an LRU cache and write-ahead log, and a virtio-mmio block
//! driver. Grounded throughout in `examples/original_source` (xv6-riscv).
//!
//! `#![no_std]` except under `cfg(test)`, where `std` comes back so the
//! pure-logic modules (`kalloc`, `bio`, `vm`'s allocator-facing pieces,
//! `proc`) can be exercised on the host; everything that needs real
//! hardware is `#[cfg(not(test))]`.

#![no_std]
#![cfg_attr(not(test), no_main)]

#[cfg(test)]
extern crate std;

#[cfg(not(test))]
use core::sync::atomic::{AtomicBool, Ordering};

pub mod bio;
pub mod console;
pub mod cpu;
pub mod exec;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod lock;
pub mod memlayout;
pub mod page;
pub mod panic;
pub mod param;
pub mod pipe;
#[cfg(not(test))]
pub mod plic;
#[cfg(not(test))]
pub mod printf;
pub mod proc;
pub mod riscv;
#[cfg(not(test))]
pub mod start;
#[cfg(not(test))]
pub mod syscall;
pub mod trampoline;
pub mod trap;
#[cfg(not(test))]
pub mod uart;
pub mod virtio;
pub mod vm;

#[cfg(not(test))]
extern "C" {
    /// The first address past the kernel's own text+data, provided by
    /// `kernel.ld`; everything from here to `PHYSTOP` is free at boot.
    static end: u8;
}

#[cfg(not(test))]
static STARTED: AtomicBool = AtomicBool::new(false);

/// `start::start()` `mret`s here, in supervisor mode, on every hart.
/// Grounded in `examples/original_source/kernel/main.c`.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn main() -> ! {
    if unsafe { cpu::cpuid() } == 0 {
        console::init();
        printf::init();
        println!();
        println!("rvkernel is booting");
        println!();

        let end_pa = unsafe { &end as *const u8 as usize };
        unsafe { kalloc::KMEM.init_range(end_pa, memlayout::PHYSTOP) };

        vm::kvminit();
        vm::kvminithart();
        proc::procinit();
        trap::init();
        trap::init_hart();
        plic::init();
        plic::init_hart();
        virtio::init();

        proc::userinit(&exec::INITCODE);

        core::sync::atomic::fence(Ordering::SeqCst);
        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        core::sync::atomic::fence(Ordering::SeqCst);
        println!("hart {} starting", unsafe { cpu::cpuid() });
        vm::kvminithart();
        trap::init_hart();
        plic::init_hart();
    }

    proc::scheduler();
}
