//! Process table and scheduler: the state machine, the
//! per-CPU scheduling loop, sleep/wakeup rendezvous, and fork/exit/wait/kill.

mod context;
mod procs;
mod trapframe;

pub use context::{swtch, Context};
pub use procs::ProcData;
pub use trapframe::TrapFrame;

use crate::cpu::{cpuid, mycpu};
use crate::file::FileRef;
use crate::fs::InodeRef;
use crate::lock::{push_off, Spinlock, SpinlockGuard};
use crate::param::{MAXPROCNAME, NOFILE, NPROC};
use crate::riscv::PteFlags;
use crate::vm::PageTable;
use core::sync::atomic::{AtomicI32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// The fields a process's own slot-spinlock protects.
struct ProcInner {
    state: Procstate,
    chan: Option<usize>,
    killed: bool,
    xstate: i32,
    pid: i32,
}

pub struct Proc {
    inner: Spinlock<ProcInner>,
    /// Fields private to the process itself (only touched by the hart
    /// currently running it, or under `WAIT_LOCK` + the slot lock during
    /// allocation/fork/exit/reaping).
    data: core::cell::UnsafeCell<ProcData>,
}

// SAFETY: `data` is only mutated while either (a) this process is the one
// currently running (so only one hart touches it), or (b) `inner` and/or
// `WAIT_LOCK` are held, per the access rules documented on each method.
unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Proc {
            inner: Spinlock::new(
                "proc",
                ProcInner { state: Procstate::Unused, chan: None, killed: false, xstate: 0, pid: 0 },
            ),
            data: core::cell::UnsafeCell::new(ProcData::zeroed()),
        }
    }

    /// # Safety
    /// See the module-level note on `data`: caller must hold a lock or be
    /// the running thread.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }
}

pub static PROCS: [Proc; NPROC] = array_macro::array![_ => Proc::new(); NPROC];

/// Serializes parent/child relationships and `wait()` wakeups. Must be
/// acquired before any process's slot lock when both are needed.
pub static WAIT_LOCK: Spinlock<()> = Spinlock::new("wait_lock", ());

static NEXTPID: AtomicI32 = AtomicI32::new(1);

/// A stable handle to a process-table slot: just its index, since the slot
/// (not any particular occupant) is what's addressable -- a parent link
/// is exactly this index, a "weak reference" into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcRef(pub usize);

impl ProcRef {
    pub fn get(self) -> &'static Proc {
        &PROCS[self.0]
    }
}

pub fn proc_index(p: &'static Proc) -> usize {
    let base = PROCS.as_ptr() as usize;
    (p as *const Proc as usize - base) / core::mem::size_of::<Proc>()
}

/// Gives every slot a kernel stack, mapped into the kernel page table at its
/// fixed per-slot virtual address with a guard page below. Must run once on
/// hart 0 before any process is scheduled. Grounded in `proc.c`'s
/// `procinit`.
pub fn procinit() {
    let mut kpt_guard = crate::vm::KERNEL_PAGETABLE.lock();
    let kpt = kpt_guard.as_mut().expect("procinit: kvminit not run");
    for (i, p) in PROCS.iter().enumerate() {
        let page = crate::kalloc::KMEM.alloc().expect("procinit: out of memory");
        let pa = page.into_usize();
        crate::vm::map_kstack(kpt, i, pa);
        unsafe { p.data().kstack = crate::memlayout::kstack(i) };
    }
}

/// Any stable, address-valued tag used as a sleep/wakeup rendezvous point.
/// We use each `WaitChannel`'s own address, since these
/// are always embedded in `'static` or otherwise pinned storage.
pub struct WaitChannel(());

impl WaitChannel {
    pub const fn new() -> Self {
        WaitChannel(())
    }

    fn tag(&self) -> usize {
        self as *const _ as usize
    }

    /// Atomically releases `guard`'s lock and blocks the calling process
    /// until `wakeup()` is called on this channel, then reacquires the same
    /// lock and returns a fresh guard for it.
    pub fn sleep<'s, T>(&self, guard: SpinlockGuard<'s, T>) -> SpinlockGuard<'s, T> {
        let p = myproc().expect("sleep: no current process");

        // Acquire the process lock *before* releasing the caller's lock:
        // this is what makes the transition atomic with respect to
        // `wakeup`, which must take the process lock before it can observe
        // `state`/`chan`.
        let mut pguard = p.inner.lock();
        let lock = unsafe { guard.sleep_prepare() };

        pguard.chan = Some(self.tag());
        pguard.state = Procstate::Sleeping;
        enter_scheduler(p, pguard);

        // Back here after being woken: reacquire our own lock to clear chan.
        let mut pguard = p.inner.lock();
        pguard.chan = None;
        drop(pguard);

        SpinlockGuard::sleep_resume(lock)
    }

    /// Wakes every process sleeping on this channel.
    pub fn wakeup(&self) {
        wakeup_tag(self.tag());
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn wakeup_tag(tag: usize) {
    let caller = myproc().map(proc_index);
    for (i, p) in PROCS.iter().enumerate() {
        if Some(i) == caller {
            continue;
        }
        let mut guard = p.inner.lock();
        if guard.state == Procstate::Sleeping && guard.chan == Some(tag) {
            guard.state = Procstate::Runnable;
        }
    }
}

/// Returns the process currently running on this hart, if any.
pub fn myproc() -> Option<&'static Proc> {
    unsafe {
        push_off();
        let p = mycpu().proc.get();
        crate::lock::pop_off();
        p.map(ProcRef::get)
    }
}

pub fn current_pid() -> Option<i32> {
    myproc().map(|p| p.inner.lock().pid)
}

/// Scans the process table for an `Unused` slot, reserving it (`Used`) and
/// assigning a fresh pid, trapframe page, and user page table. Returns with
/// the slot's lock held, exactly as `allocproc` does in the C original.
fn allocproc() -> Option<(&'static Proc, SpinlockGuard<'static, ProcInner>)> {
    for p in PROCS.iter() {
        let mut guard = p.inner.lock();
        if guard.state == Procstate::Unused {
            guard.pid = NEXTPID.fetch_add(1, Ordering::Relaxed);
            guard.state = Procstate::Used;
            guard.killed = false;
            guard.xstate = 0;
            guard.chan = None;

            let data = unsafe { p.data() };
            let tf_page = match crate::kalloc::KMEM.alloc() {
                Some(mut pg) => {
                    pg.zero();
                    pg
                }
                None => {
                    guard.state = Procstate::Unused;
                    return None;
                }
            };
            let tf_pa = tf_page.as_ptr() as usize;
            data.trapframe = tf_pa as *mut TrapFrame;
            data.trapframe_page = Some(tf_page);

            match crate::vm::proc_pagetable(tf_pa) {
                Ok(pt) => data.pagetable = Some(pt),
                Err(_) => {
                    data.trapframe_page.take().map(|pg| crate::kalloc::KMEM.free(pg));
                    guard.state = Procstate::Unused;
                    return None;
                }
            }

            data.sz = 0;
            data.parent = None;
            data.name = [0; MAXPROCNAME];
            data.ofile = [const { None }; NOFILE];
            data.cwd = None;

            // Seed a context so the first scheduler dispatch lands in
            // `forkret`, which releases the process lock and returns to
            // user space via `usertrapret`.
            data.context = Context::zeroed();
            data.context.ra = forkret as usize;
            data.context.sp = data.kstack + crate::param::KSTACK_PAGES * crate::riscv::PGSIZE;

            return Some((p, guard));
        }
    }
    None
}

/// Frees everything `allocproc` set up and returns the slot to `Unused`.
fn freeproc(p: &'static Proc, guard: &mut SpinlockGuard<'static, ProcInner>) {
    let data = unsafe { p.data() };
    if let Some(tf) = data.trapframe_page.take() {
        crate::kalloc::KMEM.free(tf);
    }
    data.trapframe = core::ptr::null_mut();
    if let Some(pt) = data.pagetable.take() {
        pt.free(data.sz, true);
    }
    data.sz = 0;
    data.parent = None;
    data.name = [0; MAXPROCNAME];
    guard.pid = 0;
    guard.chan = None;
    guard.killed = false;
    guard.xstate = 0;
    guard.state = Procstate::Unused;
}

/// Entry point for a process's very first scheduling, set up by `allocproc`.
extern "C" fn forkret() {
    // Released here, not by the caller: the process lock is still held from
    // the `scheduler`'s dispatch that `swtch`ed into us.
    let p = myproc().expect("forkret: no current process");
    unsafe { p.inner.force_unlock_after_switch() };

    static FIRST: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);
    if FIRST.swap(false, Ordering::AcqRel) {
        crate::fs::log::LOG.init_after_first_boot();
    }

    crate::trap::usertrapret();
}

/// Creates the first user process (`init`).
pub fn userinit(init_binary: &[u8]) {
    let (p, mut guard) = allocproc().expect("userinit: allocproc failed");
    let data = unsafe { p.data() };
    let pt = data.pagetable.as_mut().expect("userinit: no pagetable");
    crate::exec::load_initcode(pt, data, init_binary);
    data.cwd = crate::fs::root_inode();
    let name = b"initcode";
    data.name[..name.len()].copy_from_slice(name);
    guard.state = Procstate::Runnable;
}

/// Grows (`n > 0`) or shrinks (`n < 0`) the calling process's address space
/// by `n` bytes; `sbrk`'s underlying primitive. Returns the size *before*
/// the change, or `Err(())` if growth couldn't be satisfied.
pub fn growproc(n: i32) -> Result<usize, ()> {
    let p = myproc().expect("growproc: no current process");
    let data = unsafe { p.data() };
    let oldsz = data.sz;
    let pt = data.pagetable.as_mut().expect("growproc: no pagetable");

    let newsz = if n > 0 {
        pt.uvmalloc(oldsz, oldsz + n as usize, PteFlags::W).ok_or(())?
    } else if n < 0 {
        pt.uvmdealloc(oldsz, oldsz.saturating_sub((-n) as usize))
    } else {
        oldsz
    };

    data.sz = newsz;
    Ok(oldsz)
}

/// Per-CPU scheduler loop; never returns. Round-robins over `RUNNABLE` slots.
pub fn scheduler() -> ! {
    loop {
        unsafe { crate::riscv::intr_on() };
        for p in PROCS.iter() {
            let mut guard = p.inner.lock();
            if guard.state == Procstate::Runnable {
                guard.state = Procstate::Running;
                let idx = proc_index(p);
                unsafe { mycpu().proc.set(Some(ProcRef(idx))) };

                let data = unsafe { p.data() };
                let cpu = unsafe { mycpu() };
                let mut sched_ctx = cpu.scheduler_context.get();
                unsafe { swtch(&mut sched_ctx as *mut Context, &data.context as *const Context) };
                cpu.scheduler_context.set(sched_ctx);

                unsafe { mycpu().proc.set(None) };
                drop(guard);
            }
        }
    }
}

/// Switches from the current process's kernel thread into the scheduler.
/// The process lock must already be held; interrupt nesting depth must be
/// exactly 1; the process must not be left in the `Running` state.
fn enter_scheduler(p: &'static Proc, guard: SpinlockGuard<'static, ProcInner>) {
    let cpu = unsafe { mycpu() };
    assert_eq!(cpu.noff.get(), 1, "enter_scheduler: bad interrupt-nesting depth");
    assert!(guard.state != Procstate::Running, "enter_scheduler: still Running");
    assert!(unsafe { !crate::riscv::intr_get() }, "enter_scheduler: interrupts enabled");

    let was_enabled = cpu.interrupt_enabled.get();
    let data = unsafe { p.data() };
    let sched_ctx_ptr = &cpu.scheduler_context as *const _ as *mut Context;
    unsafe { swtch(&mut data.context as *mut Context, sched_ctx_ptr as *const Context) };
    cpu.interrupt_enabled.set(was_enabled);
    drop(guard);
}

/// Gives up the CPU for one scheduling round.
pub fn yield_now() {
    let p = myproc().expect("yield: no current process");
    let mut guard = p.inner.lock();
    guard.state = Procstate::Runnable;
    enter_scheduler(p, guard);
}

/// Blocks the calling process until `wakeup(chan)` is called.
pub fn sleep<T>(chan: &WaitChannel, guard: SpinlockGuard<'_, T>) -> SpinlockGuard<'_, T> {
    chan.sleep(guard)
}

/// Wakes every process sleeping on `chan`.
pub fn wakeup(chan: &WaitChannel) {
    chan.wakeup();
}

/// Marks `pid` as killed; if it is sleeping, makes it runnable so it can
/// observe the flag. Does not itself terminate the process.
pub fn kill(pid: i32) -> Result<(), ()> {
    for p in PROCS.iter() {
        let mut guard = p.inner.lock();
        if guard.pid == pid && guard.state != Procstate::Unused {
            guard.killed = true;
            if guard.state == Procstate::Sleeping {
                guard.state = Procstate::Runnable;
            }
            return Ok(());
        }
    }
    Err(())
}

pub fn killed(p: &'static Proc) -> bool {
    p.inner.lock().killed
}

pub fn set_killed(p: &'static Proc) {
    p.inner.lock().killed = true;
}

/// Forks the calling process. Returns the child's pid, or `None` if the
/// table or memory is exhausted.
pub fn fork() -> Option<i32> {
    let parent = myproc().expect("fork: no current process");
    let pdata = unsafe { parent.data() };

    let (child, mut cguard) = allocproc()?;
    let cdata = unsafe { child.data() };

    if pdata
        .pagetable
        .as_ref()
        .unwrap()
        .copy_to_child(cdata.pagetable.as_mut().unwrap(), pdata.sz)
        .is_err()
    {
        freeproc(child, &mut cguard);
        return None;
    }
    cdata.sz = pdata.sz;

    unsafe {
        *cdata.trapframe = *pdata.trapframe;
    }
    unsafe { (*cdata.trapframe).a0 = 0 };

    for i in 0..NOFILE {
        cdata.ofile[i] = pdata.ofile[i].as_ref().map(FileRef::dup);
    }
    cdata.cwd = pdata.cwd.as_ref().map(InodeRef::dup);
    cdata.name = pdata.name;

    let child_pid = cguard.pid;
    drop(cguard);

    let parent_idx = proc_index(parent);
    {
        let _wl = WAIT_LOCK.lock();
        cdata.parent = Some(parent_idx);
    }

    let mut cguard = child.inner.lock();
    cguard.state = Procstate::Runnable;
    Some(child_pid)
}

/// Terminates the calling process with `status`. Never returns.
pub fn exit(status: i32) -> ! {
    let p = myproc().expect("exit: no current process");
    let data = unsafe { p.data() };

    assert_ne!(proc_index(p), 0, "init exiting");

    for slot in data.ofile.iter_mut() {
        if let Some(f) = slot.take() {
            f.close();
        }
    }

    {
        let _op = crate::fs::log::LOG.begin_op();
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }
    }

    let wl = WAIT_LOCK.lock();
    reparent_children(p);
    if let Some(parent_idx) = data.parent {
        wakeup_parent(parent_idx);
    }

    let mut guard = p.inner.lock();
    guard.xstate = status;
    guard.state = Procstate::Zombie;
    drop(wl);

    enter_scheduler(p, guard);
    unreachable!("exit: scheduler returned to a zombie");
}

fn wakeup_parent(parent_idx: usize) {
    // The parent, if it's in `wait()`, sleeps on its own address.
    let tag = &PROCS[parent_idx] as *const Proc as usize;
    wakeup_tag(tag);
}

/// Reparents every child of `p` to pid 1 (`init`). Caller must hold `WAIT_LOCK`.
fn reparent_children(p: &'static Proc) {
    let my_idx = proc_index(p);
    for child in PROCS.iter() {
        let data = unsafe { child.data() };
        if data.parent == Some(my_idx) {
            data.parent = Some(0);
            wakeup_parent(0);
        }
    }
}

/// Waits for a child to exit, copying its exit status to `*addr` in the
/// caller's address space. Returns the child's pid.
pub fn wait(addr: usize) -> Result<i32, ()> {
    let p = myproc().expect("wait: no current process");
    let my_idx = proc_index(p);

    let mut wl = WAIT_LOCK.lock();
    loop {
        let mut have_child = false;
        for child in PROCS.iter() {
            let data = unsafe { child.data() };
            if data.parent != Some(my_idx) {
                continue;
            }
            have_child = true;
            let mut cguard = child.inner.lock();
            if cguard.state == Procstate::Zombie {
                let pid = cguard.pid;
                let xstate = cguard.xstate;
                if addr != 0 {
                    let pdata = unsafe { p.data() };
                    if pdata
                        .pagetable
                        .as_ref()
                        .unwrap()
                        .copyout(addr, &xstate.to_ne_bytes())
                        .is_err()
                    {
                        drop(cguard);
                        return Err(());
                    }
                }
                freeproc(child, &mut cguard);
                return Ok(pid);
            }
        }

        if !have_child || killed(p) {
            return Err(());
        }

        // Sleep on our own address, releasing WAIT_LOCK across the switch.
        wl = chan_sleep_on_self(p, wl);
    }
}

/// `wait()` sleeps on the *parent's own address* while holding `WAIT_LOCK`,
/// not a process-local lock -- mirrored here as a small helper since the
/// channel tag (the parent `Proc`'s address) and the held lock (`WAIT_LOCK`)
/// are of different types than `WaitChannel::sleep`'s generic signature
/// assumes the same address is both.
fn chan_sleep_on_self(
    p: &'static Proc,
    guard: SpinlockGuard<'static, ()>,
) -> SpinlockGuard<'static, ()> {
    let mut pguard = p.inner.lock();
    let lock = unsafe { guard.sleep_prepare() };
    pguard.chan = Some(p as *const Proc as usize);
    pguard.state = Procstate::Sleeping;
    enter_scheduler(p, pguard);
    let mut pguard = p.inner.lock();
    pguard.chan = None;
    drop(pguard);
    SpinlockGuard::sleep_resume(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_index_roundtrips() {
        for i in [0usize, 1, NPROC - 1] {
            assert_eq!(proc_index(&PROCS[i]), i);
        }
    }
}
