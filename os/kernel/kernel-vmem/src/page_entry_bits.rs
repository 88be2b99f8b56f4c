use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A single 32-bit i386 page-directory or page-table entry in its raw form.
///
/// Directory entries (PDE) and table entries (PTE) share one layout for
/// 4 KiB pages, so one type models both. Three of the bits the hardware
/// leaves to the operating system record how a user mapping was created.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (PTE only) |
/// | 7     | `PAT` / `PS`    | Must be zero here (no 4 MiB pages) |
/// | 8     | `G`             | Global (PTE only) |
/// | 9     | shared          | `MAP_SHARED` page: never copy-on-write |
/// | 10    | private         | `MAP_PRIVATE` page |
/// | 11    | readonly        | Mapped without write permission |
/// | 12–31 | `frame`         | Physical frame number |
///
/// ### Notes
/// - Permissions are the intersection over the walk: a page is user-writable
///   only if both its PDE and PTE have `RW` and `US` set.
/// - Once `CR0.WP` is set, supervisor writes honour `RW` too. Copy-on-write
///   relies on that.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalPage;
/// # use kernel_vmem::PageEntry;
/// let e = PageEntry::user_page(PhysicalPage::from_index(0x900));
/// assert!(e.present() && e.writable() && e.user());
/// assert_eq!(e.into_bits(), 0x0090_0007);
/// ```
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageEntry {
    /// Present (bit 0). Clear entries cause a page fault on any access.
    pub present: bool,

    /// Writable (bit 1).
    pub writable: bool,

    /// User/Supervisor (bit 2). Set to allow CPL 3 accesses.
    pub user: bool,

    /// Page-level write-through (bit 3).
    pub write_through: bool,

    /// Page-level cache disable (bit 4).
    pub cache_disabled: bool,

    /// Accessed (bit 5), set by the CPU on first use.
    pub accessed: bool,

    /// Dirty (bit 6), set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// PAT index bit in a PTE, page-size bit in a PDE. Always zero.
    pub pat: bool,

    /// Global (bit 8). Survives CR3 reloads when `CR4.PGE` is on.
    pub global: bool,

    /// The page belongs to a shared mapping and stays writable across fork.
    pub shared: bool,

    /// The page belongs to a private mapping.
    pub private: bool,

    /// The mapping was created without write permission; a write is a
    /// protection violation, not a copy-on-write candidate.
    pub readonly: bool,

    /// Physical frame number (bits 12–31).
    #[bits(20)]
    pub frame_index: u32,
}

impl PageEntry {
    /// The physical frame this entry refers to.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame_index())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage) -> Self {
        self.with_frame_index(frame.index())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalPage) {
        self.set_frame_index(frame.index());
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.frame().base()
    }

    /// A present, writable, supervisor-only entry.
    ///
    /// Used for the kernel window, the kernel page tables and the recursive
    /// directory slot.
    #[inline]
    #[must_use]
    pub const fn kernel(frame: PhysicalPage) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(frame)
    }

    /// A present, writable, user-accessible entry.
    ///
    /// Page tables installed on behalf of user space and freshly linked user
    /// pages start out like this.
    #[inline]
    #[must_use]
    pub const fn user_page(frame: PhysicalPage) -> Self {
        Self::kernel(frame).with_user(true)
    }

    /// Whether a write through this entry is a protection violation rather
    /// than a copy-on-write fault.
    #[inline]
    #[must_use]
    pub const fn is_write_protected(&self) -> bool {
        self.readonly() && !self.writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_where_the_cpu_expects_them() {
        assert_eq!(PageEntry::new().with_present(true).into_bits(), 1 << 0);
        assert_eq!(PageEntry::new().with_writable(true).into_bits(), 1 << 1);
        assert_eq!(PageEntry::new().with_user(true).into_bits(), 1 << 2);
        assert_eq!(PageEntry::new().with_accessed(true).into_bits(), 1 << 5);
        assert_eq!(PageEntry::new().with_dirty(true).into_bits(), 1 << 6);
        assert_eq!(PageEntry::new().with_global(true).into_bits(), 1 << 8);
        assert_eq!(PageEntry::new().with_shared(true).into_bits(), 1 << 9);
        assert_eq!(PageEntry::new().with_private(true).into_bits(), 1 << 10);
        assert_eq!(PageEntry::new().with_readonly(true).into_bits(), 1 << 11);
    }

    #[test]
    fn frame_occupies_the_high_twenty_bits() {
        let e = PageEntry::kernel(PhysicalPage::from_index(0xFFFFF));
        assert_eq!(e.into_bits(), 0xFFFF_F003);
        assert_eq!(e.frame().index(), 0xFFFFF);
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xFFFF_F000));
    }

    #[test]
    fn zero_is_not_present() {
        let e = PageEntry::from_bits(0);
        assert!(!e.present());
        assert_eq!(e.frame().index(), 0);
    }

    #[test]
    fn rebinding_keeps_flags() {
        let mut e = PageEntry::user_page(PhysicalPage::from_index(0x900)).with_shared(true);
        e.set_frame(PhysicalPage::from_index(0xA00));
        assert!(e.shared() && e.user() && e.writable());
        assert_eq!(e.frame().index(), 0xA00);
    }

    #[test]
    fn write_protection_needs_readonly_and_no_write_bit() {
        let page = PhysicalPage::from_index(0x900);
        let ro = PageEntry::user_page(page).with_writable(false).with_readonly(true);
        assert!(ro.is_write_protected());
        let cow = PageEntry::user_page(page).with_writable(false);
        assert!(!cow.is_write_protected());
    }
}
