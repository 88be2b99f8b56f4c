use crate::{MemoryAddress, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses,
/// i.e. addresses that are translated by the two-level page tables.
///
/// ### Semantics
/// - [`dir_index`](Self::dir_index) selects the page-directory entry (bits 31‒22).
/// - [`table_index`](Self::table_index) selects the page-table entry (bits 21‒12).
/// - [`offset`](Self::offset) is the byte within the page (bits 11‒0).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.as_u32()
    }

    /// The page that contains this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::from_index(self.0.page_index())
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0.offset()
    }

    /// Index into the page directory (bits 31‒22).
    #[inline]
    #[must_use]
    pub const fn dir_index(self) -> usize {
        (self.as_u32() >> 22) as usize
    }

    /// Index into the page table (bits 21‒12).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.as_u32() >> 12) & 0x3FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0.is_page_aligned()
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(self.0.align_down())
    }

    /// Align up to the next page boundary, `None` if that would wrap.
    #[inline]
    #[must_use]
    pub const fn align_up(self) -> Option<Self> {
        match self.0.align_up() {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl From<VirtualPage> for VirtualAddress {
    fn from(value: VirtualPage) -> Self {
        value.base()
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.as_u32() - rhs.as_u32()
    }
}
