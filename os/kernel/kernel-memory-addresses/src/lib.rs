//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and 4 KiB page
//! bases used in paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values.
//!
//! | Concept | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`VirtualAddress`] / [`VirtualPage`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Refer to physical memory (page frames). |
//!
//! ## Two-Level Translation
//!
//! On a 32-bit protected-mode machine without PAE, a virtual address is split
//! into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PDE  |  PTE  | Offset |
//! ```
//!
//! [`VirtualAddress::dir_index`] and [`VirtualAddress::table_index`] extract
//! the two table indices.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0100_2345);
//! assert_eq!(va.dir_index(), 4);
//! assert_eq!(va.table_index(), 2);
//! assert_eq!(va.offset(), 0x345);
//!
//! let page = va.page();
//! assert_eq!(page.base().as_u32(), 0x0100_2000);
//! assert_eq!(page.index(), 0x1002);
//!
//! let frame = PhysicalPage::from_index(0x800);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x0080_0000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of a page (and of a page frame) in bytes.
pub const PAGE_SIZE: u32 = 0x1000;

/// log2([`PAGE_SIZE`]), i.e. the number of in-page offset bits.
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

const _: () = {
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
    assert!(ENTRIES_PER_TABLE * 4 == PAGE_SIZE as usize);
};
