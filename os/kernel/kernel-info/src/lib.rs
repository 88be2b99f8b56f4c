//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants, scheduling parameters and
//! the boot memory map contract shared by all kernel subsystems. It is the
//! single source of truth for where things live in the 32-bit address space.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! * **Kernel window**: the first 8 MiB are identity mapped in every address space
//! * **User layout**: executable, heap, mmap window and stack reservation
//! * **Recursive mapping**: the last directory slot maps the directory itself
//!
//! ### Task Parameters ([`task`])
//! * Task table capacity, name and file table sizes
//! * Timer frequency and default priorities
//!
//! ### Boot Information ([`boot`])
//! * **Memory map**: base/length/type descriptors handed over by the loader
//! * **Region selection**: the largest usable region becomes managed RAM
//!
//! ## Configuration Management
//!
//! All layout constants are `const` values with compile-time assertions that
//! reject overlapping or misaligned configurations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod task;
