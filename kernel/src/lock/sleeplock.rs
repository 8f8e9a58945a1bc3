//! A long-term lock for processes: blocks the waiter instead
//! of spinning, and may be held across blocking disk I/O. Holder identity is
//! a process (pid), not a CPU, since holding survives a context switch.

use super::spinlock::Spinlock;
use crate::proc::{self, WaitChannel};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

struct State {
    held: bool,
    pid: i32,
}

pub struct Sleeplock<T> {
    name: &'static str,
    chan: WaitChannel,
    state: Spinlock<State>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is reachable only through a `SleeplockGuard`, produced only
// while `state.held` has been claimed.
unsafe impl<T: Send> Sync for Sleeplock<T> {}

pub struct SleeplockGuard<'s, T> {
    lock: &'s Sleeplock<T>,
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Sleeplock {
            name,
            chan: WaitChannel::new(),
            state: Spinlock::new("sleeplock", State { held: false, pid: -1 }),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let mut guard = self.state.lock();
        while guard.held {
            guard = self.chan.sleep(guard);
        }
        guard.held = true;
        guard.pid = proc::current_pid().unwrap_or(-1);
        drop(guard);
        SleeplockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        let guard = self.state.lock();
        guard.held && guard.pid == proc::current_pid().unwrap_or(-1)
    }

    /// Raw pointer to the data, bypassing the lock.
    ///
    /// # Safety
    /// Caller must already hold the lock.
    pub unsafe fn get_mut_unchecked(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.state.lock();
        assert!(guard.held, "release: {} not held", self.lock.name);
        guard.held = false;
        guard.pid = -1;
        drop(guard);
        self.lock.chan.wakeup();
    }
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
