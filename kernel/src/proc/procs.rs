//! Fields private to a process's own kernel thread: touched
//! only while that thread is running, or while `WAIT_LOCK` plus the slot's
//! own spinlock are both held (allocation, fork, exit, reaping).

use super::context::Context;
use super::trapframe::TrapFrame;
use crate::file::FileRef;
use crate::fs::InodeRef;
use crate::page::Page;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::PageTable;

pub struct ProcData {
    /// Size of the user address space, in bytes.
    pub sz: usize,
    pub pagetable: Option<PageTable>,
    /// Points into the page owned by `trapframe_page`; kept as a raw pointer
    /// because `uservec`/`userret` (assembly) index into it directly.
    pub trapframe: *mut TrapFrame,
    pub trapframe_page: Option<Page>,
    /// This thread's saved callee-saved registers, restored by `swtch` on
    /// every dispatch.
    pub context: Context,
    pub kstack: usize,
    pub name: [u8; MAXPROCNAME],
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<InodeRef>,
    /// Index into `PROCS` of the parent, guarded by `WAIT_LOCK`.
    pub parent: Option<usize>,
}

impl ProcData {
    pub const fn zeroed() -> Self {
        ProcData {
            sz: 0,
            pagetable: None,
            trapframe: core::ptr::null_mut(),
            trapframe_page: None,
            context: Context::zeroed(),
            kstack: 0,
            name: [0; MAXPROCNAME],
            ofile: [const { None }; NOFILE],
            cwd: None,
            parent: None,
        }
    }
}
