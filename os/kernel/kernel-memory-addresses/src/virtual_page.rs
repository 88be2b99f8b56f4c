use crate::{MemoryAddress, PAGE_SHIFT, VirtualAddress};
use core::fmt;
use core::ops::Add;

/// Virtual memory page base.
///
/// A `VirtualPage` represents the **page-aligned base** of a 4 KiB virtual
/// page. Its [`index`](Self::index) is the virtual page number
/// (`address >> 12`), the unit the virtual-page bitmaps are indexed by.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u32);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        addr.page()
    }

    /// Virtual page number.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(MemoryAddress::new(self.0 << PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Add<u32> for VirtualPage {
    type Output = Self;
    #[inline]
    fn add(self, pages: u32) -> Self::Output {
        Self(self.0 + pages)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.base().as_u32())
    }
}
