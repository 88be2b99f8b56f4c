//! # Typed i386 Control Registers
//!
//! Bitfield models of the registers the memory manager and the scheduler touch:
//! [`Cr0`] (paging enable, write protect), [`Cr3`] (page-directory base) and
//! [`Eflags`] (interrupt flag). Loads and stores are only compiled for
//! 32-bit x86 targets with the `asm` feature; the bitfields themselves are
//! plain data and usable anywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr0;
pub mod cr3;
pub mod eflags;

pub use cr0::Cr0;
pub use cr3::Cr3;
pub use eflags::Eflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// # Safety
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
