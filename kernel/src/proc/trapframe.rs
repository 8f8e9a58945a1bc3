//! The per-process trapframe: user registers saved across a trap into the
//! kernel, laid out so `uservec`/`userret` (assembly, in `crate::trampoline`)
//! can index into it by fixed byte offset.
//!
//! Lives on its own physical page, mapped at `memlayout::TRAPFRAME` in the
//! user address space and at its kernel virtual address in the kernel's
//! direct map, so both `uservec` (before `satp` switches) and Rust code
//! (after) can reach it.

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TrapFrame {
    /// kernel page table, loaded into satp on a trap from user space.
    pub kernel_satp: usize,
    /// top of process's kernel stack.
    pub kernel_sp: usize,
    /// usertrap(), to jump to when entering the kernel via uservec.
    pub kernel_trap: usize,
    /// saved user program counter (sepc).
    pub epc: usize,
    /// this hart's kernel_hartid, for cpuid().
    pub kernel_hartid: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        // SAFETY: all-zero is a valid bit pattern for a struct of plain `usize`s.
        unsafe { core::mem::zeroed() }
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);
