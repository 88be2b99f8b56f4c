//! Addresses inside the recursive page-table window.
//!
//! The last directory slot of every page directory points at the directory
//! itself. The MMU then treats the directory as a page table for the top
//! 4 MiB of the address space, so each page table of the active directory
//! appears as one page below [`PAGE_DIRECTORY_ADDR`], and the directory
//! appears as the very last page.
//!
//! ```text
//! PAGE_TABLES_BASE + i * 4096    page table for directory slot i
//! PAGE_TABLES_BASE + 1023 * 4096 the directory itself (PAGE_DIRECTORY_ADDR)
//! ```

use kernel_info::memory::{PAGE_DIRECTORY_ADDR, PAGE_TABLES_BASE, RECURSIVE_SLOT};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PAGE_SIZE, VirtualAddress};

/// Size of one directory or table entry in bytes.
pub const ENTRY_SIZE: u32 = 4;

/// Virtual address of the page table serving directory slot `dir_index`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn table_base(dir_index: usize) -> VirtualAddress {
    debug_assert!(dir_index < ENTRIES_PER_TABLE);
    VirtualAddress::new(PAGE_TABLES_BASE.as_u32() + (dir_index as u32) * PAGE_SIZE)
}

/// Virtual address of the directory entry that covers `va`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn dir_entry_addr(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(PAGE_DIRECTORY_ADDR.as_u32() + (va.dir_index() as u32) * ENTRY_SIZE)
}

/// Virtual address of directory slot `dir_index`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn dir_slot_addr(dir_index: usize) -> VirtualAddress {
    VirtualAddress::new(PAGE_DIRECTORY_ADDR.as_u32() + (dir_index as u32) * ENTRY_SIZE)
}

/// Virtual address of the table entry that maps `va`.
///
/// Only valid while the directory entry for `va` is present.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn table_entry_addr(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(
        table_base(va.dir_index()).as_u32() + (va.table_index() as u32) * ENTRY_SIZE,
    )
}

/// Whether `va` lies inside the recursive window.
#[inline]
#[must_use]
pub const fn is_recursive(va: VirtualAddress) -> bool {
    va.dir_index() == RECURSIVE_SLOT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_for_slot() {
        assert_eq!(table_base(0).as_u32(), 0xFFC0_0000);
        assert_eq!(table_base(2).as_u32(), 0xFFC0_2000);
        assert_eq!(table_base(RECURSIVE_SLOT), PAGE_DIRECTORY_ADDR);
    }

    #[test]
    fn entry_addresses() {
        // 0x0080_0000: slot 2, index 0
        let va = VirtualAddress::new(0x0080_0000);
        assert_eq!(dir_entry_addr(va).as_u32(), 0xFFFF_F008);
        assert_eq!(table_entry_addr(va).as_u32(), 0xFFC0_2000);

        // 0x07FF_F000: slot 31, index 1023
        let va = VirtualAddress::new(0x07FF_F123);
        assert_eq!(dir_entry_addr(va).as_u32(), 0xFFFF_F000 + 31 * 4);
        assert_eq!(table_entry_addr(va).as_u32(), 0xFFC0_0000 + 31 * 4096 + 1023 * 4);
    }

    #[test]
    fn window_detection() {
        assert!(is_recursive(PAGE_TABLES_BASE));
        assert!(is_recursive(PAGE_DIRECTORY_ADDR));
        assert!(!is_recursive(VirtualAddress::new(0xFFBF_FFFF)));
    }
}
