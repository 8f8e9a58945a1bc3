//! Mutual exclusion: a spinlock that masks interrupts, and a sleeplock built
//! on top of it for long-held, blocking-friendly critical sections.

mod sleeplock;
mod spinlock;

pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{pop_off, push_off, Spinlock, SpinlockGuard};
