//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU; mutual exclusion means masking interrupts.
//! [`IrqGuard`] masks them for a scope and hands out [`CriticalSection`]
//! tokens that mutating operations on shared kernel tables require.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod irq;
mod soft;

#[cfg(target_arch = "x86")]
pub use irq::HardwareInterrupts;
pub use irq::{CriticalSection, InterruptControl, IrqGuard, without_interrupts};
pub use soft::SoftInterrupts;
