//! Loading a program image into a fresh user address space.
//!
//! Only the first process's bring-up is fully implemented here
//! ([`load_initcode`], grounded in `examples/original_source/kernel/proc.c`'s
//! `userinit`). A general path-based ELF `exec()` needs directory/path
//! lookup this kernel doesn't have; [`exec`] is the narrow stub the syscall
//! table calls into instead.

use crate::proc::ProcData;
use crate::riscv::{PteFlags, PGSIZE};
use crate::vm::PageTable;

/// `exec("/init")`, hand-assembled from `../user/initcode.S` in the
/// original kernel (`od -t xC ../user/initcode`): calls `exec("/init",
/// ["/init", 0])` and loops forever if it ever returns.
pub const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Maps one user page at virtual address 0, copies `code` into it, and
/// points the trapframe at its entry point. `code.len()` must fit in a
/// single page.
pub fn load_initcode(pagetable: &mut PageTable, data: &mut ProcData, code: &[u8]) {
    assert!(code.len() <= PGSIZE, "load_initcode: code too large for one page");

    let mut page = crate::kalloc::KMEM.alloc().expect("load_initcode: out of memory");
    page.zero();
    let pa = page.into_usize();
    pagetable
        .mappages(0, PGSIZE, pa, PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U)
        .expect("load_initcode: mappages failed");
    pagetable.copyout(0, code).expect("load_initcode: copyout failed");

    data.sz = PGSIZE;
    // SAFETY: the trapframe page was just allocated and mapped by
    // `proc_pagetable`; `data.trapframe` is valid for the life of the proc.
    let tf = unsafe { &mut *data.trapframe };
    tf.epc = 0;
    tf.sp = PGSIZE;
}

/// Stub for the `exec` syscall: this kernel has no path/directory layer to
/// resolve `path` against, so every call fails. Kept so the syscall table
/// has a real call target.
pub fn exec(_path: &str, _argv: &[&str]) -> Result<i32, ()> {
    Err(())
}
