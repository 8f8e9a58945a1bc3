//! Callee-saved register context, swapped by `swtch` on every context switch.

/// Saved callee-saved registers for one kernel thread (a process, or a
/// CPU's scheduler thread). Field order and layout are load-bearing: `swtch`
/// (implemented in assembly, see `crate::trampoline`) indexes into this
/// struct by byte offset.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

#[cfg(not(test))]
extern "C" {
    /// Saves the caller's callee-saved registers into `*old`, then restores
    /// them from `*new` and returns into whatever `new.ra` points at.
    ///
    /// Implemented in assembly (`crate::trampoline`). Only the process lock
    /// (or nothing, for the initial scheduler entry) may be held across this
    /// call; interrupts must already be disabled.
    pub fn swtch(old: *mut Context, new: *const Context);
}

/// Host stand-in: `scheduler`/`enter_scheduler` still need to compile and
/// link, but are never actually run under `cargo test`.
#[cfg(test)]
#[no_mangle]
pub unsafe extern "C" fn swtch(_old: *mut Context, _new: *const Context) {}
