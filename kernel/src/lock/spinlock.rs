//! An interrupt-masking spinlock with nested push/pop interrupt-disable
//! discipline.

use crate::cpu::{cpuid, mycpu};
use crate::riscv::{intr_get, intr_off, intr_on};
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicIsize, Ordering};

/// Sentinel stored in `owner` when the lock is free.
const NONE: isize = -1;

pub struct Spinlock<T> {
    name: &'static str,
    /// The id of the owning CPU while held, `NONE` otherwise.
    owner: AtomicIsize,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `SpinlockGuard`, which can only
// be created while `owner` has been claimed via `compare_exchange`.
unsafe impl<T: Send> Sync for Spinlock<T> {}

pub struct SpinlockGuard<'s, T> {
    lock: &'s Spinlock<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Spinlock {
            name,
            owner: AtomicIsize::new(NONE),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        // Disable interrupts first: if we took an interrupt while spinning
        // with the lock's owner already set to us, the "reacquisition by the
        // owning CPU is fatal" check below would misfire.
        unsafe { push_off() };
        let me = unsafe { cpuid() } as isize;
        assert!(self.owner.load(Ordering::Relaxed) != me, "acquire: {} already held by this cpu", self.name);

        while self
            .owner
            .compare_exchange(NONE, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        SpinlockGuard { lock: self }
    }

    /// Whether this CPU currently holds the lock. Interrupts must be off.
    pub fn holding(&self) -> bool {
        debug_assert!(unsafe { !intr_get() }, "holding: interrupts enabled");
        self.owner.load(Ordering::Relaxed) == unsafe { cpuid() } as isize
    }

    /// Returns a raw pointer to the protected data, bypassing the lock.
    ///
    /// # Safety
    /// Caller must already hold the lock (e.g. a sleeplock's inner state, or
    /// recovery code that owns the only reference) or otherwise guarantee
    /// exclusivity.
    pub unsafe fn get_mut_unchecked(&self) -> *mut T {
        self.data.get()
    }

    /// Acquires the lock without producing a guard. Used only by `sleep`'s
    /// release/reacquire dance, where the guard's identity must survive a
    /// context switch in between.
    ///
    /// # Safety
    /// Must be paired with exactly one `raw_release`.
    unsafe fn raw_acquire(&self) {
        unsafe { push_off() };
        let me = unsafe { cpuid() } as isize;
        assert!(self.owner.load(Ordering::Relaxed) != me, "acquire: {} already held by this cpu", self.name);
        while self
            .owner
            .compare_exchange(NONE, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    /// # Safety
    /// Must be paired with a preceding `raw_acquire`, and the caller must not
    /// touch the protected data afterwards until reacquiring.
    unsafe fn raw_release(&self) {
        assert!(self.holding(), "release: {} not held", self.name);
        self.owner.store(NONE, Ordering::Release);
        unsafe { pop_off() };
    }

    /// Releases the lock on behalf of a guard that will never be dropped,
    /// because it was acquired by `scheduler()` in a stack frame that stays
    /// suspended for as long as the dispatched process runs (`forkret`'s
    /// counterpart to the lock `scheduler` takes before its first `swtch`
    /// into a brand new process).
    ///
    /// # Safety
    /// Caller must be running as the process a `scheduler` loop iteration
    /// most recently `swtch`ed into, and must call this at most once per such
    /// dispatch, before doing anything else with the lock.
    pub(crate) unsafe fn force_unlock_after_switch(&self) {
        unsafe { self.raw_release() };
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(self.lock.holding(), "release: {} not held", self.lock.name);
        self.lock.owner.store(NONE, Ordering::Release);
        unsafe { pop_off() };
    }
}

impl<'s, T> SpinlockGuard<'s, T> {
    /// Releases the lock early and hands back a reference to reacquire it
    /// with. Used only by `sleep`, which must release the caller's lock
    /// before switching away and reacquire the identical lock on return.
    ///
    /// # Safety
    /// The caller must reacquire via `Spinlock::lock` or this exact dance
    /// before the protected data is touched again.
    pub(crate) unsafe fn sleep_prepare(self) -> &'s Spinlock<T> {
        let lock = self.lock;
        core::mem::forget(self);
        unsafe { lock.raw_release() };
        lock
    }

    /// Reacquires a lock released via `sleep_prepare`, producing a fresh guard.
    pub(crate) fn sleep_resume(lock: &'s Spinlock<T>) -> Self {
        unsafe { lock.raw_acquire() };
        SpinlockGuard { lock }
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// `push_off`/`pop_off` are like `intr_off`/`intr_on`, except matched: it
/// takes two `pop_off`s to undo two `push_off`s. If interrupts were already
/// off, `push_off` then `pop_off` leaves them off.
///
/// # Safety
/// Must be paired with a matching `pop_off` on the same hart.
pub unsafe fn push_off() {
    let was_enabled = unsafe { intr_get() };
    unsafe { intr_off() };
    let cpu = unsafe { mycpu() };
    if cpu.noff.get() == 0 {
        cpu.interrupt_enabled.set(was_enabled);
    }
    cpu.noff.set(cpu.noff.get() + 1);
}

/// # Safety
/// Must be paired with a preceding `push_off` on the same hart.
pub unsafe fn pop_off() {
    assert!(unsafe { !intr_get() }, "pop_off: interruptible");
    let cpu = unsafe { mycpu() };
    let noff = cpu.noff.get();
    assert!(noff >= 1, "pop_off: unbalanced");
    cpu.noff.set(noff - 1);
    if noff - 1 == 0 && cpu.interrupt_enabled.get() {
        unsafe { intr_on() };
    }
}
