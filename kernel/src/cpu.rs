//! Per-CPU (per-hart) state.
//!
//! Stored in a fixed array indexed by hart id, which is cached in the `tp`
//! register by `start()`. Callers must run with interrupts disabled between
//! reading the hart id and using the corresponding slot, or migration could
//! hand them someone else's data.

use crate::param::NCPU;
use crate::proc::ProcRef;
use crate::riscv::r_tp;
use core::cell::Cell;

/// One hart's bookkeeping. Never shared: only the owning hart touches its
/// own `Cpu`, and only with interrupts disabled while it does.
pub struct Cpu {
    /// The process currently running on this hart, if any.
    pub(crate) proc: Cell<Option<ProcRef>>,
    /// Saved registers for this hart's scheduler thread, restored by `swtch`
    /// whenever the scheduler regains control.
    pub(crate) scheduler_context: Cell<crate::proc::Context>,
    /// Depth of nested `push_off`/`pop_off` interrupt-disable regions.
    pub(crate) noff: Cell<i32>,
    /// Whether interrupts were enabled at the point `noff` went 0 -> 1.
    /// Restored when `noff` goes back to 0.
    pub(crate) interrupt_enabled: Cell<bool>,
}

impl Cpu {
    const fn new() -> Self {
        Cpu {
            proc: Cell::new(None),
            scheduler_context: Cell::new(crate::proc::Context::zeroed()),
            noff: Cell::new(0),
            interrupt_enabled: Cell::new(false),
        }
    }
}

// SAFETY: each `Cpu` slot is only ever touched by its owning hart with
// interrupts disabled; there is no cross-hart aliasing of the `Cell`s.
unsafe impl Sync for Cpu {}

pub static CPUS: [Cpu; NCPU] = array_macro::array![_ => Cpu::new(); NCPU];

/// Returns the id of the hart this code is currently running on.
///
/// # Safety
/// Caller must already have interrupts disabled, or the returned id can be
/// stale the instant this function returns (the thread could migrate).
#[inline]
pub unsafe fn cpuid() -> usize {
    r_tp()
}

/// Returns this hart's `Cpu` record.
///
/// # Safety
/// Caller must have interrupts disabled for as long as the reference is used.
#[inline]
pub unsafe fn mycpu() -> &'static Cpu {
    &CPUS[unsafe { cpuid() }]
}
