//! Trap dispatch: syscalls and interrupts/exceptions taken from user space
//! (`usertrap`/`usertrapret`), and those taken while already in the kernel
//! (`kerneltrap`). Grounded directly in
//! `examples/original_source/kernel/trap.c`; the entry/exit assembly lives
//! in [`crate::trampoline`].

#[cfg(not(test))]
mod imp {
    use crate::lock::{Spinlock, SpinlockGuard};
    use crate::memlayout::TRAPFRAME;
    use crate::proc::WaitChannel;
    use crate::riscv::{self, Sstatus};

    pub static TICKS: Spinlock<u32> = Spinlock::new("time", 0);
    static TICKS_CHAN: WaitChannel = WaitChannel::new();

    pub fn ticks() -> u32 {
        *TICKS.lock()
    }

    pub fn sleep_on_ticks(guard: SpinlockGuard<'_, u32>) -> SpinlockGuard<'_, u32> {
        TICKS_CHAN.sleep(guard)
    }

    /// Nothing to do: `TICKS`'s spinlock is statically initialized.
    pub fn init() {}

    /// Arranges for this hart to take traps in the kernel via `kernelvec`.
    /// Must run on every hart before enabling interrupts.
    pub fn init_hart() {
        extern "C" {
            fn kernelvec();
        }
        unsafe { riscv::w_stvec(kernelvec as usize) };
    }

    /// Entered by `uservec` (via `jr`, not `call`) on every trap taken while
    /// running a user process.
    #[no_mangle]
    extern "C" fn usertrap() -> ! {
        assert!(!unsafe { riscv::r_sstatus() }.contains(Sstatus::SPP), "usertrap: not from user mode");

        // Traps taken while still in usertrap (before usertrapret retargets
        // stvec back to uservec) should land in kerneltrap.
        init_hart();

        let p = crate::proc::myproc().expect("usertrap: no current process");
        let data = unsafe { p.data() };
        let tf = unsafe { &mut *data.trapframe };
        tf.epc = unsafe { riscv::r_sepc() };

        let scause = unsafe { riscv::r_scause() };
        let mut which_dev = 0;

        if scause == 8 {
            if crate::proc::killed(p) {
                crate::proc::exit(-1);
            }
            // sepc points at `ecall`; resume at the following instruction.
            tf.epc = tf.epc.wrapping_add(4);
            // Interrupts can clobber sepc/scause/sstatus, so only enable them
            // once we're done reading those registers.
            unsafe { riscv::intr_on() };
            crate::syscall::syscall();
        } else if let Some(dev) = devintr(scause) {
            which_dev = dev;
        } else {
            crate::println!(
                "usertrap(): unexpected scause {:#x} pid={}",
                scause,
                crate::proc::current_pid().unwrap_or(-1)
            );
            crate::println!("            sepc={:#x} stval={:#x}", unsafe { riscv::r_sepc() }, unsafe {
                riscv::r_stval()
            });
            crate::proc::set_killed(p);
        }

        if crate::proc::killed(p) {
            crate::proc::exit(-1);
        }

        if which_dev == 2 {
            crate::proc::yield_now();
        }

        usertrapret();
    }

    /// Returns to user space: sets up the trapframe fields `uservec` will
    /// need on the *next* trap, then jumps to `userret` in the trampoline.
    pub fn usertrapret() -> ! {
        let p = crate::proc::myproc().expect("usertrapret: no current process");
        let data = unsafe { p.data() };

        // We're about to retarget traps from kerneltrap to usertrap; keep
        // interrupts off until we're actually back in user space.
        unsafe { riscv::intr_off() };

        extern "C" {
            static trampoline: u8;
            static uservec: u8;
        }
        let uservec_offset = unsafe { (&uservec as *const u8).offset_from(&trampoline as *const u8) };
        unsafe { riscv::w_stvec((crate::memlayout::TRAMPOLINE as isize + uservec_offset) as usize) };

        let tf = unsafe { &mut *data.trapframe };
        tf.kernel_satp = unsafe { riscv::r_satp() };
        tf.kernel_sp = data.kstack + crate::param::KSTACK_PAGES * crate::riscv::PGSIZE;
        tf.kernel_trap = usertrap as usize;
        tf.kernel_hartid = riscv::r_tp();

        let mut x = unsafe { riscv::r_sstatus() };
        x.remove(Sstatus::SPP);
        x.insert(Sstatus::SPIE);
        unsafe { riscv::w_sstatus(x) };
        unsafe { riscv::w_sepc(tf.epc) };

        let satp = data.pagetable.as_ref().expect("usertrapret: no pagetable").satp();

        extern "C" {
            static userret: u8;
        }
        let userret_offset = unsafe { (&userret as *const u8).offset_from(&trampoline as *const u8) };
        let target = crate::memlayout::TRAMPOLINE as isize + userret_offset;
        // SAFETY: `target` is `userret`'s address in every page table, and it
        // never returns (it `sret`s into user space).
        let entry: unsafe extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(target as usize) };
        unsafe { entry(satp) }
    }

    /// Entered via `kernelvec` for traps taken while already in the kernel;
    /// called with the saved kernel registers already pushed, and must
    /// restore `sepc`/`sstatus` before returning since a `yield_now()` below
    /// may have run other code on this stack in the meantime.
    #[no_mangle]
    extern "C" fn kerneltrap() {
        let sepc = unsafe { riscv::r_sepc() };
        let sstatus = unsafe { riscv::r_sstatus() };
        let scause = unsafe { riscv::r_scause() };

        assert!(sstatus.contains(Sstatus::SPP), "kerneltrap: not from supervisor mode");
        assert!(!unsafe { riscv::intr_get() }, "kerneltrap: interrupts enabled");

        let which_dev = match devintr(scause) {
            Some(d) => d,
            None => {
                crate::println!("scause={:#x} sepc={:#x} stval={:#x}", scause, sepc, unsafe {
                    riscv::r_stval()
                });
                panic!("kerneltrap");
            }
        };

        if which_dev == 2 && crate::proc::myproc().is_some() {
            crate::proc::yield_now();
        }

        // `yield_now` may have re-entered the trap path on this stack;
        // restore the registers `kernelvec`'s `sret` depends on.
        unsafe {
            riscv::w_sepc(sepc);
            riscv::w_sstatus(sstatus);
        }
    }

    /// Services one timer tick and rearms `stimecmp` for the next one. Every
    /// hart rearms; only hart 0 advances the global clock.
    fn clockintr() {
        if unsafe { crate::cpu::cpuid() } == 0 {
            let mut t = TICKS.lock();
            *t += 1;
            drop(t);
            TICKS_CHAN.wakeup();
        }
        unsafe { riscv::w_stimecmp(riscv::r_time() + 1_000_000) };
    }

    /// Dispatches an external (PLIC) or timer interrupt. Returns `Some(2)`
    /// for a timer interrupt, `Some(1)` for any other recognized device
    /// interrupt, `None` if `scause` isn't a trap we recognize.
    fn devintr(scause: usize) -> Option<u32> {
        const SUPERVISOR_EXTERNAL: usize = 0x8000_0000_0000_0009;
        const SUPERVISOR_TIMER: usize = 0x8000_0000_0000_0005;

        if scause == SUPERVISOR_EXTERNAL {
            let irq = crate::plic::claim();
            match irq as usize {
                crate::memlayout::UART0_IRQ => crate::uart::intr(),
                crate::memlayout::VIRTIO0_IRQ => crate::virtio::intr(),
                0 => {}
                other => crate::println!("unexpected interrupt irq={}", other),
            }
            if irq != 0 {
                crate::plic::complete(irq);
            }
            Some(1)
        } else if scause == SUPERVISOR_TIMER {
            // `stimecmp` already expired; rearm it and account for the tick.
            clockintr();
            Some(2)
        } else {
            None
        }
    }

    static_assertions::const_assert_eq!(TRAPFRAME % crate::riscv::PGSIZE, 0);
}

#[cfg(not(test))]
pub use imp::{init, init_hart, sleep_on_ticks, ticks, usertrapret, TICKS};

/// Host stand-in: `proc::forkret` calls this unconditionally once a process
/// is first scheduled.
#[cfg(test)]
pub fn usertrapret() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
