//! # Virtual Memory Support
//!
//! Two-level i386 paging for the kernel: page-directory and page-table
//! entries, the recursive self-map, and the address-space operations that
//! demand paging, copy-on-write and `fork` are built from.
//!
//! ## What you get
//! - [`PageEntry`], the 32-bit directory/table entry as a bitfield.
//! - [`PageFaultError`], the error code the CPU pushes on a page fault.
//! - The [`Mmu`] trait: the handful of privileged operations the paging code
//!   needs (memory access through the current translation, `invlpg`, CR3).
//! - [`AddressSpace`], a handle on the **active** page directory that exposes
//!   checked accessors for its entries. No other code touches table bytes.
//! - [`HostedMmu`], a software model of RAM, the page walk and the TLB, so the
//!   memory manager can be exercised on a development host.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! CR3 holds the physical base of the page directory (PD). Each of its 1024
//! entries points at a page table (PT) whose 1024 entries map 4 KiB pages.
//!
//! ## The recursive slot
//!
//! The last directory entry points back at the directory. Walking through it
//! makes every page table of the active address space visible at a fixed
//! virtual address, see [`recursive`]. The kernel therefore never needs a
//! physical-to-virtual translation to edit page tables.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod fault;
pub mod hosted;
mod page_entry_bits;
pub mod recursive;
#[cfg(target_arch = "x86")]
pub mod x86;

pub use address_space::{
    AddressSpace, EntryMut, PageDirectory, init_kernel_mapping, reset_page, scan_page,
};
pub use fault::{Access, PageFaultError};
pub use hosted::HostedMmu;
pub use page_entry_bits::PageEntry;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualPage};

/// The privileged memory-management operations of one processor.
///
/// All addresses are **virtual** and go through the current translation with
/// supervisor privileges, exactly like ordinary kernel loads and stores.
/// Accessing an address that is not mapped, or writing a read-only page, is a
/// kernel bug; implementations may assume it never happens.
pub trait Mmu {
    fn read_u32(&self, va: VirtualAddress) -> u32;

    fn write_u32(&mut self, va: VirtualAddress, value: u32);

    /// Copies `buf.len()` bytes starting at `va` into `buf`. May span pages.
    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]);

    /// Copies `data` to memory starting at `va`. May span pages.
    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]);

    /// Sets every byte of `page` to `value`.
    fn fill_page(&mut self, page: VirtualPage, value: u8);

    /// Copies the 4 KiB at `from` to `to`.
    fn copy_page(&mut self, from: VirtualPage, to: VirtualPage);

    /// Drops the cached translation of `page` (`invlpg`).
    fn invalidate(&mut self, page: VirtualPage);

    /// Physical address of the active page directory (CR3).
    fn directory(&self) -> PhysicalAddress;

    /// Switches to another page directory. Flushes the TLB.
    ///
    /// # Safety
    /// `dir` must be a valid page directory that maps the kernel window
    /// identically to the current one.
    unsafe fn load_directory(&mut self, dir: PhysicalAddress);

    /// Flushes the whole TLB by reloading CR3 with its current value.
    fn flush_all(&mut self) {
        let dir = self.directory();
        // SAFETY: reloading the active directory changes no mapping.
        unsafe { self.load_directory(dir) };
    }

    /// Loads `dir` into CR3 and turns on paging with supervisor write
    /// protection (`CR0.PG | CR0.WP`).
    ///
    /// # Safety
    /// `dir` must identity-map the code and data the caller is running from.
    unsafe fn enable_paging(&mut self, dir: PhysicalAddress);

    fn paging_enabled(&self) -> bool;
}
