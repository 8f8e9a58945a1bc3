//! `sys_*` handlers over process state: fork/exit/wait/sbrk/sleep/kill/
//! uptime/getpid. Grounded in
//! `examples/original_source/kernel/sysproc.c`.

use super::{argaddr, argint};
use crate::proc;

pub(super) fn sys_exit() -> i64 {
    let n = argint(0);
    proc::exit(n)
}

pub(super) fn sys_getpid() -> i64 {
    proc::current_pid().unwrap_or(-1) as i64
}

pub(super) fn sys_fork() -> i64 {
    proc::fork().map(|pid| pid as i64).unwrap_or(-1)
}

pub(super) fn sys_wait() -> i64 {
    let addr = argaddr(0);
    proc::wait(addr).map(|pid| pid as i64).unwrap_or(-1)
}

pub(super) fn sys_sbrk() -> i64 {
    let n = argint(0);
    match proc::growproc(n) {
        Ok(oldsz) => oldsz as i64,
        Err(()) => -1,
    }
}

pub(super) fn sys_sleep() -> i64 {
    let n = core::cmp::max(argint(0), 0) as u32;
    let mut guard = crate::trap::TICKS.lock();
    let ticks0 = *guard;
    while *guard - ticks0 < n {
        if proc::myproc().map(proc::killed).unwrap_or(false) {
            return -1;
        }
        guard = crate::trap::sleep_on_ticks(guard);
    }
    0
}

pub(super) fn sys_kill() -> i64 {
    let pid = argint(0);
    proc::kill(pid).map(|_| 0).unwrap_or(-1)
}

pub(super) fn sys_uptime() -> i64 {
    *crate::trap::TICKS.lock() as i64
}
