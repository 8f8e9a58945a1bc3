//! `uservec`/`userret` (the user<->kernel trap trampoline, mapped at
//! [`crate::memlayout::TRAMPOLINE`] unchanged in every address space so a
//! `satp` switch doesn't fault mid-trap), `kernelvec` (traps taken while
//! already in the kernel), and `swtch` (the context switch used by the
//! scheduler). There is no machine-mode timer vector: this kernel's boot
//! stub (`start::timerinit`) uses the Sstc extension, so `stimecmp`
//! expiries are taken directly in supervisor mode through `kernelvec`/
//! `uservec` like any other trap.
//!
//! Field offsets below are load-bearing against [`crate::proc::TrapFrame`]
//! and [`crate::proc::Context`] — both `#[repr(C)]` and `static_assertions`
//! size-checked there. Canonical RISC-V Sv39 xv6 trap/switch assembly,
//! carried as `global_asm!` rather than a separate `.S` + build script since
//! nothing else in this kernel needs a C toolchain.

#[cfg(not(test))]
use core::arch::global_asm;

#[cfg(not(test))]
global_asm!(
    r#"
    .section .trampoline, "ax"
    .globl trampoline
    .align 2
trampoline:

    .globl uservec
    .align 2
uservec:
    # trap.c points stvec here before returning to user space, so traps
    # from user space land here, in supervisor mode, on the user page
    # table.

    # stash user a0 so it can be reused to reach the trapframe.
    csrw sscratch, a0

    # every process's trapframe is mapped at the same virtual address.
    li a0, {trapframe}

    sd ra, 40(a0)
    sd sp, 48(a0)
    sd gp, 56(a0)
    sd tp, 64(a0)
    sd t0, 72(a0)
    sd t1, 80(a0)
    sd t2, 88(a0)
    sd s0, 96(a0)
    sd s1, 104(a0)
    sd a1, 120(a0)
    sd a2, 128(a0)
    sd a3, 136(a0)
    sd a4, 144(a0)
    sd a5, 152(a0)
    sd a6, 160(a0)
    sd a7, 168(a0)
    sd s2, 176(a0)
    sd s3, 184(a0)
    sd s4, 192(a0)
    sd s5, 200(a0)
    sd s6, 208(a0)
    sd s7, 216(a0)
    sd s8, 224(a0)
    sd s9, 232(a0)
    sd s10, 240(a0)
    sd s11, 248(a0)
    sd t3, 256(a0)
    sd t4, 264(a0)
    sd t5, 272(a0)
    sd t6, 280(a0)

    # the real user a0 went into sscratch above.
    csrr t0, sscratch
    sd t0, 112(a0)

    ld sp, 8(a0)
    ld tp, 32(a0)
    ld t0, 16(a0)
    ld t1, 0(a0)
    csrw satp, t1
    sfence.vma zero, zero

    # a0 is invalid from here: the kernel page table doesn't map the
    # trapframe at this address. Jump to usertrap(), which never returns.
    jr t0

    .globl userret
    .align 2
userret:
    # userret(pagetable): a0 is the satp value for the user page table.
    # usertrapret() jumps here after setting up sepc/sstatus.
    sfence.vma zero, zero
    csrw satp, a0
    sfence.vma zero, zero

    li a0, {trapframe}

    ld ra, 40(a0)
    ld sp, 48(a0)
    ld gp, 56(a0)
    ld tp, 64(a0)
    ld t0, 72(a0)
    ld t1, 80(a0)
    ld t2, 88(a0)
    ld s0, 96(a0)
    ld s1, 104(a0)
    ld a1, 120(a0)
    ld a2, 128(a0)
    ld a3, 136(a0)
    ld a4, 144(a0)
    ld a5, 152(a0)
    ld a6, 160(a0)
    ld a7, 168(a0)
    ld s2, 176(a0)
    ld s3, 184(a0)
    ld s4, 192(a0)
    ld s5, 200(a0)
    ld s6, 208(a0)
    ld s7, 216(a0)
    ld s8, 224(a0)
    ld s9, 232(a0)
    ld s10, 240(a0)
    ld s11, 248(a0)
    ld t3, 256(a0)
    ld t4, 264(a0)
    ld t5, 272(a0)
    ld t6, 280(a0)

    ld a0, 112(a0)

    sret
    .previous
    "#,
    trapframe = const crate::memlayout::TRAPFRAME,
);

#[cfg(not(test))]
global_asm!(
    r#"
    .section .text
    .globl kernelvec
    .align 2
kernelvec:
    addi sp, sp, -256

    sd ra, 0(sp)
    sd sp, 8(sp)
    sd gp, 16(sp)
    # not tp: it holds our hartid and may be stale if we migrated harts.
    sd t0, 24(sp)
    sd t1, 32(sp)
    sd t2, 40(sp)
    sd s0, 48(sp)
    sd s1, 56(sp)
    sd a0, 64(sp)
    sd a1, 72(sp)
    sd a2, 80(sp)
    sd a3, 88(sp)
    sd a4, 96(sp)
    sd a5, 104(sp)
    sd a6, 112(sp)
    sd a7, 120(sp)
    sd s2, 128(sp)
    sd s3, 136(sp)
    sd s4, 144(sp)
    sd s5, 152(sp)
    sd s6, 160(sp)
    sd s7, 168(sp)
    sd s8, 176(sp)
    sd s9, 184(sp)
    sd s10, 192(sp)
    sd s11, 200(sp)
    sd t3, 208(sp)
    sd t4, 216(sp)
    sd t5, 224(sp)
    sd t6, 232(sp)

    call kerneltrap

    ld ra, 0(sp)
    ld sp, 8(sp)
    ld gp, 16(sp)
    ld t0, 24(sp)
    ld t1, 32(sp)
    ld t2, 40(sp)
    ld s0, 48(sp)
    ld s1, 56(sp)
    ld a0, 64(sp)
    ld a1, 72(sp)
    ld a2, 80(sp)
    ld a3, 88(sp)
    ld a4, 96(sp)
    ld a5, 104(sp)
    ld a6, 112(sp)
    ld a7, 120(sp)
    ld s2, 128(sp)
    ld s3, 136(sp)
    ld s4, 144(sp)
    ld s5, 152(sp)
    ld s6, 160(sp)
    ld s7, 168(sp)
    ld s8, 176(sp)
    ld s9, 184(sp)
    ld s10, 192(sp)
    ld s11, 200(sp)
    ld t3, 208(sp)
    ld t4, 216(sp)
    ld t5, 224(sp)
    ld t6, 232(sp)

    addi sp, sp, 256
    sret
    "#,
);

#[cfg(not(test))]
global_asm!(
    r#"
    .section .text
    .globl swtch
    .align 2
swtch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)

    ret
    "#,
);

#[cfg(not(test))]
extern "C" {
    /// The trampoline page's base address. Mapped identically at
    /// `memlayout::TRAMPOLINE` in every page table; see `vm::kvminit` and
    /// `vm::proc_pagetable`.
    pub static trampoline: u8;

    /// `uservec`'s offset from `trampoline`'s base, so `usertrapret` can
    /// compute `TRAMPOLINE + (uservec - trampoline)` without the symbol
    /// itself being directly callable (it expects the trapframe already
    /// live at a fixed virtual address, not a normal calling convention).
    pub static uservec: u8;

    /// `userret`'s offset from `trampoline`'s base; called as
    /// `extern "C" fn(satp: usize) -> !` once `sepc`/`sstatus` are set.
    pub static userret: u8;
}

/// Host builds have no trampoline page; `vm::kvminit`/`vm::proc_pagetable`
/// only need this symbol's address to exist as a link target, never
/// dereferenced before a real hart runs.
#[cfg(test)]
#[no_mangle]
pub static trampoline: u8 = 0;
