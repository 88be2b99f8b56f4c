//! Reference-counted physical frame allocator.
//!
//! One byte per physical frame holds its reference count:
//! `0` free, `1` exclusively owned, `>1` shared by copy-on-write mappings.
//! Frames below the first usable frame belong to the kernel and are never
//! handed out.

use alloc::boxed::Box;
use alloc::vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_sync::CriticalSection;
use log::trace;

/// Highest reference count a frame can carry.
pub const MAX_REF_COUNT: u8 = u8::MAX;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// One counted reference to an allocated physical frame.
///
/// A `Frame` is obtained from [`FrameTable::alloc`] or
/// [`FrameTable::acquire_shared`] and is given back with
/// [`FrameTable::release`]. Installing the frame in a page-table entry hands
/// the reference to the mapping via [`Frame::into_page`]; removing the
/// mapping takes it back with [`Frame::from_mapping`].
#[must_use = "a frame reference must be released or handed to a mapping"]
#[derive(Debug, Eq, PartialEq)]
pub struct Frame(PhysicalPage);

impl Frame {
    /// The frame this handle refers to.
    #[inline]
    pub const fn page(&self) -> PhysicalPage {
        self.0
    }

    #[inline]
    pub const fn base(&self) -> PhysicalAddress {
        self.0.base()
    }

    /// Transfers this reference to a page-table mapping.
    #[inline]
    pub const fn into_page(self) -> PhysicalPage {
        self.0
    }

    /// Takes back the reference held by a page-table mapping of `page`.
    ///
    /// # Safety
    /// The caller must remove (or already have removed) a mapping that owned
    /// one reference to `page`, so that the reference is not released twice.
    #[inline]
    pub const unsafe fn from_mapping(page: PhysicalPage) -> Self {
        Self(page)
    }
}

/// The physical frame table.
pub struct FrameTable {
    counts: Box<[u8]>,
    first_usable: u32,
    free: u32,
}

impl FrameTable {
    /// Creates a table for `total` frames.
    ///
    /// Frames `0..first_usable` are marked as owned (count 1) and are not
    /// counted as free.
    ///
    /// # Panics
    /// If `first_usable > total`.
    #[must_use]
    pub fn new(total: u32, first_usable: u32) -> Self {
        assert!(first_usable <= total, "first usable frame beyond memory");
        let mut counts = vec![0u8; total as usize].into_boxed_slice();
        counts[..first_usable as usize].fill(1);
        Self {
            counts,
            first_usable,
            free: total - first_usable,
        }
    }

    /// Number of frames tracked, including kernel-owned ones.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn total_frames(&self) -> u32 {
        self.counts.len() as u32
    }

    /// Number of frames with reference count zero.
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    /// Number of allocatable frames currently in use.
    #[must_use]
    pub fn used_frames(&self) -> u32 {
        self.total_frames() - self.first_usable - self.free
    }

    /// The lowest frame number that can be allocated.
    #[must_use]
    pub const fn first_usable(&self) -> u32 {
        self.first_usable
    }

    /// Reference count of `page`.
    ///
    /// # Panics
    /// If `page` is beyond the end of physical memory.
    #[must_use]
    pub fn ref_count(&self, page: PhysicalPage) -> u8 {
        self.counts[self.index_of(page)]
    }

    /// Allocates the lowest free frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if every frame is in use.
    pub fn try_alloc(&mut self, _cs: CriticalSection<'_>) -> Result<Frame, FrameError> {
        let start = self.first_usable as usize;
        let Some(offset) = self.counts[start..].iter().position(|&c| c == 0) else {
            return Err(FrameError::OutOfMemory);
        };
        let index = start + offset;
        self.counts[index] = 1;
        self.free -= 1;

        #[allow(clippy::cast_possible_truncation)]
        let page = PhysicalPage::from_index(index as u32);
        trace!("allocate frame {page}");
        Ok(Frame(page))
    }

    /// Allocates the lowest free frame.
    ///
    /// # Panics
    /// When physical memory is exhausted; there is nothing to fall back on.
    pub fn alloc(&mut self, cs: CriticalSection<'_>) -> Frame {
        match self.try_alloc(cs) {
            Ok(frame) => frame,
            Err(FrameError::OutOfMemory) => panic!("Out of memory"),
        }
    }

    /// Adds one reference to an allocated frame.
    ///
    /// # Panics
    /// If the frame is free, kernel-owned, or its count would overflow.
    pub fn acquire_shared(&mut self, _cs: CriticalSection<'_>, page: PhysicalPage) -> Frame {
        let index = self.checked_index(page);
        let count = &mut self.counts[index];
        assert!(*count >= 1, "sharing free frame {page}");
        assert!(*count < MAX_REF_COUNT, "reference count overflow on {page}");
        *count += 1;
        Frame(page)
    }

    /// Drops one reference and returns the remaining count. The frame becomes
    /// free when the count reaches zero.
    ///
    /// # Panics
    /// If the frame is kernel-owned, beyond memory, or already free.
    pub fn release(&mut self, _cs: CriticalSection<'_>, frame: Frame) -> u8 {
        let page = frame.0;
        let index = self.checked_index(page);
        let count = &mut self.counts[index];
        assert!(*count >= 1, "double free of frame {page}");
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.free += 1;
            trace!("free frame {page}");
        }
        debug_assert!(self.free <= self.total_frames() - self.first_usable);
        remaining
    }

    fn index_of(&self, page: PhysicalPage) -> usize {
        let index = page.index() as usize;
        assert!(index < self.counts.len(), "frame {page} beyond memory");
        index
    }

    fn checked_index(&self, page: PhysicalPage) -> usize {
        let index = self.index_of(page);
        assert!(
            page.index() >= self.first_usable,
            "frame {page} is owned by the kernel"
        );
        index
    }
}

impl core::fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameTable")
            .field("total", &self.total_frames())
            .field("first_usable", &self.first_usable)
            .field("free", &self.free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs() -> CriticalSection<'static> {
        // SAFETY: host tests run without interrupts.
        unsafe { CriticalSection::new() }
    }

    #[test]
    fn kernel_frames_are_reserved() {
        let table = FrameTable::new(16, 4);
        assert_eq!(table.total_frames(), 16);
        assert_eq!(table.free_frames(), 12);
        assert_eq!(table.used_frames(), 0);
        assert_eq!(table.ref_count(PhysicalPage::from_index(3)), 1);
        assert_eq!(table.ref_count(PhysicalPage::from_index(4)), 0);
    }

    #[test]
    fn allocates_lowest_free_frame() {
        let mut table = FrameTable::new(16, 4);
        let a = table.alloc(cs());
        let b = table.alloc(cs());
        assert_eq!(a.page().index(), 4);
        assert_eq!(b.page().index(), 5);
        assert_eq!(table.release(cs(), a), 0);
        let c = table.alloc(cs());
        assert_eq!(c.page().index(), 4);
        let _ = table.release(cs(), b);
        let _ = table.release(cs(), c);
        assert_eq!(table.free_frames(), 12);
    }

    #[test]
    fn shared_frames_free_on_last_release() {
        let mut table = FrameTable::new(8, 2);
        let frame = table.alloc(cs());
        let page = frame.page();
        let shared = table.acquire_shared(cs(), page);
        assert_eq!(table.ref_count(page), 2);
        assert_eq!(table.free_frames(), 5);

        assert_eq!(table.release(cs(), shared), 1);
        assert_eq!(table.free_frames(), 5);
        assert_eq!(table.release(cs(), frame), 0);
        assert_eq!(table.free_frames(), 6);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut table = FrameTable::new(3, 2);
        let frame = table.alloc(cs());
        assert_eq!(table.try_alloc(cs()), Err(FrameError::OutOfMemory));
        let _ = table.release(cs(), frame);
        assert!(table.try_alloc(cs()).is_ok());
    }

    #[test]
    #[should_panic(expected = "Out of memory")]
    fn alloc_panics_when_exhausted() {
        let mut table = FrameTable::new(2, 2);
        let _ = table.alloc(cs());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut table = FrameTable::new(4, 1);
        let frame = table.alloc(cs());
        let page = frame.page();
        let _ = table.release(cs(), frame);
        // SAFETY: deliberately forging a second reference.
        let _ = table.release(cs(), unsafe { Frame::from_mapping(page) });
    }

    #[test]
    #[should_panic(expected = "owned by the kernel")]
    fn kernel_frames_cannot_be_released() {
        let mut table = FrameTable::new(4, 2);
        // SAFETY: deliberately forging a reference to a kernel frame.
        let _ = table.release(cs(), unsafe { Frame::from_mapping(PhysicalPage::from_index(1)) });
    }
}
