use crate::{MemoryAddress, PAGE_SHIFT, PhysicalAddress};
use core::fmt;

/// Physical page frame.
///
/// A `PhysicalPage` represents the **page-aligned base** of a 4 KiB physical
/// frame. Its [`index`](Self::index) is the frame number (`address >> 12`)
/// used to address the frame reference-count table.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    /// The frame with frame number `index`.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.frame()
    }

    /// Frame number.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(MemoryAddress::new(self.0 << PAGE_SHIFT))
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:08X})", self.base().as_u32())
    }
}
