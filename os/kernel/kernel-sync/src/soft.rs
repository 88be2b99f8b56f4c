use crate::InterruptControl;
use alloc::rc::Rc;
use core::cell::Cell;

/// A software interrupt flag for running the kernel on a host.
///
/// Clones share the same flag, so a test can keep a handle and observe the
/// state the kernel leaves behind. The number of disable transitions is
/// counted to check that critical sections were actually entered.
#[derive(Clone, Debug)]
pub struct SoftInterrupts {
    state: Rc<SoftState>,
}

#[derive(Debug)]
struct SoftState {
    enabled: Cell<bool>,
    disables: Cell<u64>,
}

impl SoftInterrupts {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            state: Rc::new(SoftState {
                enabled: Cell::new(enabled),
                disables: Cell::new(0),
            }),
        }
    }

    /// How often interrupts went from enabled to disabled.
    #[must_use]
    pub fn disable_count(&self) -> u64 {
        self.state.disables.get()
    }
}

impl Default for SoftInterrupts {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InterruptControl for SoftInterrupts {
    fn are_enabled(&self) -> bool {
        self.state.enabled.get()
    }

    fn disable(&self) {
        if self.state.enabled.replace(false) {
            self.state.disables.set(self.state.disables.get() + 1);
        }
    }

    fn enable(&self) {
        self.state.enabled.set(true);
    }
}
