//! Syscall numbers, trapframe argument-fetch helpers, and the `a7`-keyed
//! dispatcher. Grounded directly in
//! `examples/original_source/kernel/syscall.c`.

mod file;
mod proc;

use crate::proc::myproc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;

/// Raw word-sized value of syscall argument `n` (0..=5), read straight from
/// the current process's saved trapframe (`argraw`).
fn argraw(n: usize) -> usize {
    let p = myproc().expect("argraw: no current process");
    let tf = unsafe { &*p.data().trapframe };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw: bad arg index {}", n),
    }
}

fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// No legality check here: `copyin`/`copyout` do that.
fn argaddr(n: usize) -> usize {
    argraw(n)
}

/// Fetches a `usize` at user address `addr`, bounds-checked against the
/// current process's address-space size (`fetchaddr`).
fn fetchaddr(addr: usize) -> Result<usize, ()> {
    let p = myproc().expect("fetchaddr: no current process");
    let data = unsafe { p.data() };
    if addr >= data.sz || addr + core::mem::size_of::<usize>() > data.sz {
        return Err(());
    }
    let pt = data.pagetable.as_ref().ok_or(())?;
    let mut buf = [0u8; core::mem::size_of::<usize>()];
    pt.copyin(&mut buf, addr).map_err(|_| ())?;
    Ok(usize::from_ne_bytes(buf))
}

/// Fetches a NUL-terminated string from user address `addr` into `buf`.
/// Returns its length, not counting the terminating NUL (`fetchstr`).
fn fetchstr(buf: &mut [u8], addr: usize) -> Result<usize, ()> {
    let p = myproc().expect("fetchstr: no current process");
    let data = unsafe { p.data() };
    let pt = data.pagetable.as_ref().ok_or(())?;
    let n = pt.copyinstr(buf, addr, buf.len()).map_err(|_| ())?;
    Ok(n - 1)
}

/// Argument `n` as a NUL-terminated string, fetched into `buf`.
fn argstr(n: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let addr = argaddr(n);
    fetchstr(buf, addr)
}

/// Dispatches on the current process's `a7`, calling the matching `sys_*`
/// handler and storing its result back into `a0`.
pub fn syscall() {
    let p = myproc().expect("syscall: no current process");
    let num = unsafe { (*p.data().trapframe).a7 };

    let result: i64 = match num {
        SYS_FORK => proc::sys_fork(),
        SYS_EXIT => proc::sys_exit(),
        SYS_WAIT => proc::sys_wait(),
        SYS_PIPE => file::sys_pipe(),
        SYS_READ => file::sys_read(),
        SYS_KILL => proc::sys_kill(),
        SYS_EXEC => file::sys_exec(),
        SYS_FSTAT => file::sys_fstat(),
        SYS_CHDIR => file::sys_chdir(),
        SYS_DUP => file::sys_dup(),
        SYS_GETPID => proc::sys_getpid(),
        SYS_SBRK => proc::sys_sbrk(),
        SYS_SLEEP => proc::sys_sleep(),
        SYS_UPTIME => proc::sys_uptime(),
        SYS_OPEN => file::sys_open(),
        SYS_WRITE => file::sys_write(),
        SYS_MKNOD => file::sys_mknod(),
        SYS_UNLINK => file::sys_unlink(),
        SYS_LINK => file::sys_link(),
        SYS_MKDIR => file::sys_mkdir(),
        SYS_CLOSE => file::sys_close(),
        other => {
            crate::println!(
                "{} {}: unknown sys call {}",
                crate::proc::current_pid().unwrap_or(-1),
                core::str::from_utf8(&unsafe { p.data() }.name).unwrap_or("?"),
                other
            );
            -1
        }
    };

    let tf = unsafe { &mut *p.data().trapframe };
    tf.a0 = result as usize;
}
