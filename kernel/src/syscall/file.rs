//! `sys_*` handlers over file descriptors: pipe/read/write/dup/close/fstat
//! work on already-open descriptors and are fully implemented; open/chdir/
//! mknod/unlink/link/mkdir/exec all need path or directory-entry
//! resolution this kernel's inode cache doesn't have, so each fetches its
//! path argument (to match the real calling convention) and then fails.
//! Grounded in `examples/original_source/kernel/syscall.c`'s `argfd`/
//! `fdalloc` pattern (file.c itself wasn't in the retrieved source).

use super::{argaddr, argint, argstr};
use crate::file::FileRef;
use crate::param::{BSIZE, MAXPATH, NOFILE};

/// Validates argument `n` as an open file descriptor of the current
/// process, returning its index (`argfd`).
fn argfd(n: usize) -> Result<usize, ()> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    let fd = fd as usize;
    let p = crate::proc::myproc().ok_or(())?;
    let data = unsafe { p.data() };
    if data.ofile[fd].is_none() {
        return Err(());
    }
    Ok(fd)
}

/// Installs `f` in the first free descriptor slot of the current process.
/// Returns `f` back on failure, so the caller can still `close()` it.
fn fdalloc(f: FileRef) -> Result<usize, FileRef> {
    let p = crate::proc::myproc().expect("fdalloc: no current process");
    let data = unsafe { p.data() };
    for fd in 0..NOFILE {
        if data.ofile[fd].is_none() {
            data.ofile[fd] = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

pub(super) fn sys_dup() -> i64 {
    let fd = match argfd(0) {
        Ok(fd) => fd,
        Err(()) => return -1,
    };
    let dup = {
        let p = crate::proc::myproc().expect("sys_dup: no current process");
        let data = unsafe { p.data() };
        data.ofile[fd].as_ref().unwrap().dup()
    };
    match fdalloc(dup) {
        Ok(newfd) => newfd as i64,
        Err(f) => {
            f.close();
            -1
        }
    }
}

pub(super) fn sys_close() -> i64 {
    let fd = match argfd(0) {
        Ok(fd) => fd,
        Err(()) => return -1,
    };
    let p = crate::proc::myproc().expect("sys_close: no current process");
    let data = unsafe { p.data() };
    let f = data.ofile[fd].take().unwrap();
    f.close();
    0
}

pub(super) fn sys_pipe() -> i64 {
    let fdarray = argaddr(0);
    let (rf, wf) = match crate::file::open_pipe() {
        Some(pair) => pair,
        None => return -1,
    };

    let fd0 = match fdalloc(rf) {
        Ok(fd) => fd,
        Err(rf) => {
            rf.close();
            wf.close();
            return -1;
        }
    };
    let fd1 = match fdalloc(wf) {
        Ok(fd) => fd,
        Err(wf) => {
            let p = crate::proc::myproc().expect("sys_pipe: no current process");
            unsafe { p.data() }.ofile[fd0].take().unwrap().close();
            wf.close();
            return -1;
        }
    };

    let p = crate::proc::myproc().expect("sys_pipe: no current process");
    let data = unsafe { p.data() };
    let pt = data.pagetable.as_ref().expect("sys_pipe: no pagetable");
    let ok = pt.copyout(fdarray, &(fd0 as i32).to_ne_bytes()).is_ok()
        && pt.copyout(fdarray + 4, &(fd1 as i32).to_ne_bytes()).is_ok();
    if !ok {
        data.ofile[fd0].take().unwrap().close();
        data.ofile[fd1].take().unwrap().close();
        return -1;
    }
    0
}

pub(super) fn sys_read() -> i64 {
    let fd = match argfd(0) {
        Ok(fd) => fd,
        Err(()) => return -1,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    copy_with_file(fd, addr, n as usize, true)
}

pub(super) fn sys_write() -> i64 {
    let fd = match argfd(0) {
        Ok(fd) => fd,
        Err(()) => return -1,
    };
    let addr = argaddr(1);
    let n = argint(2);
    if n < 0 {
        return -1;
    }
    copy_with_file(fd, addr, n as usize, false)
}

/// Shuttles up to `n` bytes between the user buffer at `addr` and file
/// descriptor `fd` through a fixed-size kernel bounce buffer, one chunk at
/// a time (`fileread`/`filewrite`, generalized to any `n` without a heap
/// allocation).
fn copy_with_file(fd: usize, addr: usize, n: usize, reading: bool) -> i64 {
    let p = crate::proc::myproc().expect("copy_with_file: no current process");
    let data = unsafe { p.data() };
    let file = match data.ofile[fd].as_ref() {
        Some(f) => f,
        None => return -1,
    };
    let pt = match data.pagetable.as_ref() {
        Some(pt) => pt,
        None => return -1,
    };

    let mut total = 0usize;
    let mut buf = [0u8; BSIZE];
    while total < n {
        let want = core::cmp::min(BSIZE, n - total);
        if reading {
            let got = match file.read(&mut buf[..want]) {
                Ok(got) => got,
                Err(()) => break,
            };
            if got == 0 || pt.copyout(addr + total, &buf[..got]).is_err() {
                if got == 0 {
                    break;
                }
                return if total == 0 { -1 } else { total as i64 };
            }
            total += got;
            if got < want {
                break;
            }
        } else {
            if pt.copyin(&mut buf[..want], addr + total).is_err() {
                return if total == 0 { -1 } else { total as i64 };
            }
            match file.write(&buf[..want]) {
                Ok(wrote) => {
                    total += wrote;
                    if wrote < want {
                        break;
                    }
                }
                Err(()) => return if total == 0 { -1 } else { total as i64 },
            }
        }
    }
    total as i64
}

pub(super) fn sys_fstat() -> i64 {
    let fd = match argfd(0) {
        Ok(fd) => fd,
        Err(()) => return -1,
    };
    let addr = argaddr(1);

    let p = crate::proc::myproc().expect("sys_fstat: no current process");
    let data = unsafe { p.data() };
    let st = match data.ofile[fd].as_ref().unwrap().stat() {
        Some(st) => st,
        None => return -1,
    };
    let pt = data.pagetable.as_ref().expect("sys_fstat: no pagetable");

    let dev = (st.dev as i32).to_ne_bytes();
    let ino = st.ino.to_ne_bytes();
    let kind = (st.kind as i16).to_ne_bytes();
    let nlink = (st.nlink as i16).to_ne_bytes();
    let size = (st.size as u64).to_ne_bytes();
    let mut ok = pt.copyout(addr, &dev).is_ok();
    ok &= pt.copyout(addr + 4, &ino).is_ok();
    ok &= pt.copyout(addr + 8, &kind).is_ok();
    ok &= pt.copyout(addr + 10, &nlink).is_ok();
    ok &= pt.copyout(addr + 16, &size).is_ok();
    if ok {
        0
    } else {
        -1
    }
}

pub(super) fn sys_exec() -> i64 {
    let mut path = [0u8; MAXPATH];
    let len = match argstr(0, &mut path) {
        Ok(len) => len,
        Err(()) => return -1,
    };
    let path_str = match core::str::from_utf8(&path[..len]) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    match crate::exec::exec(path_str, &[]) {
        Ok(ret) => ret as i64,
        Err(()) => -1,
    }
}

/// No directory/path layer to resolve against: fetches the path argument
/// (matching the real calling convention) and then fails.
fn path_only_stub(n: usize) -> i64 {
    let mut buf = [0u8; MAXPATH];
    let _ = argstr(n, &mut buf);
    -1
}

pub(super) fn sys_open() -> i64 {
    path_only_stub(0)
}

pub(super) fn sys_chdir() -> i64 {
    path_only_stub(0)
}

pub(super) fn sys_mknod() -> i64 {
    path_only_stub(0)
}

pub(super) fn sys_unlink() -> i64 {
    path_only_stub(0)
}

pub(super) fn sys_mkdir() -> i64 {
    path_only_stub(0)
}

pub(super) fn sys_link() -> i64 {
    path_only_stub(0)
}
