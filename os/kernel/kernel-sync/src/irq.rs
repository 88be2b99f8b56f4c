//! Interrupt masking and the critical-section token.
//!
//! On a single CPU the only source of concurrency is an interrupt handler
//! preempting kernel code. Every check-then-act sequence on shared kernel
//! tables therefore runs with interrupts disabled. Functions that mutate such
//! tables take a [`CriticalSection`] by value; the only safe way to obtain one
//! is through an [`IrqGuard`].

use core::marker::PhantomData;

/// The processor's interrupt flag, abstracted so the kernel can run on
/// hardware and in a host simulation.
///
/// Implementations are cheap handles; cloning one yields a handle to the same
/// interrupt flag.
pub trait InterruptControl: Clone {
    /// Whether maskable interrupts are currently enabled.
    fn are_enabled(&self) -> bool;

    /// Mask interrupts (`cli`).
    fn disable(&self);

    /// Unmask interrupts (`sti`).
    fn enable(&self);

    /// Disables interrupts and returns whether they were enabled before.
    #[inline]
    fn disable_saving(&self) -> bool {
        let were_enabled = self.are_enabled();
        if were_enabled {
            self.disable();
        }
        were_enabled
    }

    /// Restores a state previously returned by [`disable_saving`](Self::disable_saving).
    #[inline]
    fn restore(&self, were_enabled: bool) {
        if were_enabled {
            self.enable();
        } else {
            self.disable();
        }
    }
}

/// Proof that interrupts are disabled for the lifetime `'cs`.
///
/// Zero-sized and `Copy`; passing it around costs nothing.
#[derive(Copy, Clone, Debug)]
pub struct CriticalSection<'cs> {
    _marker: PhantomData<&'cs ()>,
}

impl CriticalSection<'_> {
    /// Creates a token without disabling anything.
    ///
    /// # Safety
    /// Interrupts must be disabled for as long as the token (or any copy of it)
    /// is alive, e.g. because the caller runs inside an interrupt gate.
    #[inline]
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled,
/// it disables them. On drop, it re-enables them **only** if they were
/// previously enabled, preserving the original state, so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::{InterruptControl, IrqGuard, SoftInterrupts};
///
/// let irq = SoftInterrupts::new(true);
/// {
///     let guard = IrqGuard::new(&irq);
///     let _cs = guard.token();
///     assert!(!irq.are_enabled());
/// }
/// assert!(irq.are_enabled());
/// ```
pub struct IrqGuard<'a, I: InterruptControl> {
    irq: &'a I,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a, I: InterruptControl> IrqGuard<'a, I> {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new(irq: &'a I) -> Self {
        let were_enabled = irq.disable_saving();
        Self { irq, were_enabled }
    }

    /// A critical-section token valid while this guard lives.
    #[inline]
    #[must_use]
    pub fn token(&self) -> CriticalSection<'_> {
        // SAFETY: the guard keeps interrupts disabled until it is dropped,
        // and the token cannot outlive the borrow of the guard.
        unsafe { CriticalSection::new() }
    }

    /// Whether interrupts will be re-enabled when the guard is dropped.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl<I: InterruptControl> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.irq.enable();
        }
    }
}

/// Runs `f` with interrupts disabled, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<I, R>(irq: &I, f: impl FnOnce(CriticalSection<'_>) -> R) -> R
where
    I: InterruptControl,
{
    let guard = IrqGuard::new(irq);
    f(guard.token())
}

/// The interrupt flag of the executing i386 processor.
#[cfg(target_arch = "x86")]
#[derive(Copy, Clone, Debug, Default)]
pub struct HardwareInterrupts;

#[cfg(target_arch = "x86")]
impl InterruptControl for HardwareInterrupts {
    #[inline]
    fn are_enabled(&self) -> bool {
        use kernel_registers::{Eflags, LoadRegister};
        Eflags::load().if_interrupt_enable()
    }

    #[inline]
    fn disable(&self) {
        // SAFETY: the kernel runs at CPL 0 where `cli` is permitted.
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }

    #[inline]
    fn enable(&self) {
        // SAFETY: the kernel runs at CPL 0 where `sti` is permitted.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }
}
