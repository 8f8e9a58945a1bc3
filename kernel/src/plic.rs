//! Platform-Level Interrupt Controller: routes the UART and virtio-disk
//! external interrupts to each hart's supervisor-mode claim/complete
//! registers. Grounded in `examples/original_source/kernel/plic.c`; register
//! addresses live in [`crate::memlayout`].

use crate::memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ};

unsafe fn write(addr: usize, v: u32) {
    unsafe { core::ptr::write_volatile(addr as *mut u32, v) };
}

unsafe fn read(addr: usize) -> u32 {
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

/// Sets non-zero priority for every IRQ we care about; priority 0 disables
/// an interrupt source regardless of its enable bit.
pub fn init() {
    unsafe {
        write(PLIC + UART0_IRQ * 4, 1);
        write(PLIC + VIRTIO0_IRQ * 4, 1);
    }
}

/// Per-hart setup: must run on every hart during boot.
pub fn init_hart() {
    let hart = unsafe { crate::cpu::cpuid() };
    unsafe {
        write(plic_senable(hart), (1 << UART0_IRQ) | (1 << VIRTIO0_IRQ));
        write(plic_spriority(hart), 0);
    }
}

/// Asks the PLIC which IRQ (if any) this hart should service next.
pub fn claim() -> u32 {
    let hart = unsafe { crate::cpu::cpuid() };
    unsafe { read(plic_sclaim(hart)) }
}

/// Tells the PLIC this hart is done with `irq`, re-arming it.
pub fn complete(irq: u32) {
    let hart = unsafe { crate::cpu::cpuid() };
    unsafe { write(plic_sclaim(hart), irq) };
}
