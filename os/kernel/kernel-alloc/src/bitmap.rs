//! Fixed-capacity bit vector with an index offset.
//!
//! Bit `i` of the vector stands for index `offset + i`; callers always pass
//! absolute indices (typically virtual page numbers).

use alloc::boxed::Box;
use alloc::vec;

/// Errors for explicit range reservations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BitmapError {
    #[error("range {start:#x}+{count} lies outside the bitmap")]
    OutOfRange { start: u32, count: u32 },
    #[error("index {0:#x} is already set")]
    Occupied(u32),
}

/// A bit vector tracking which units of a region are in use.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Box<[u8]>,
    offset: u32,
}

impl Bitmap {
    /// A cleared bitmap of `length` bytes whose first bit is index `offset`.
    #[must_use]
    pub fn new(length: usize, offset: u32) -> Self {
        Self {
            bits: vec![0u8; length].into_boxed_slice(),
            offset,
        }
    }

    /// Number of bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn capacity(&self) -> u32 {
        (self.bits.len() * 8) as u32
    }

    /// First index covered by this bitmap.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether `index` lies within the bitmap.
    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        index >= self.offset && index - self.offset < self.capacity()
    }

    /// Returns the bit for `index`.
    ///
    /// # Panics
    /// If `index` is outside the bitmap.
    #[must_use]
    pub fn test(&self, index: u32) -> bool {
        let (byte, bit) = self.locate(index);
        self.bits[byte] & (1 << bit) != 0
    }

    /// Sets the bit for `index` to `value`.
    ///
    /// # Panics
    /// If `index` is outside the bitmap.
    pub fn set(&mut self, index: u32, value: bool) {
        let (byte, bit) = self.locate(index);
        if value {
            self.bits[byte] |= 1 << bit;
        } else {
            self.bits[byte] &= !(1 << bit);
        }
    }

    /// Finds the first run of `count` clear bits, sets them, and returns the
    /// absolute index of the run's start.
    ///
    /// Returns `None` if no run is long enough; there is no compaction.
    pub fn scan(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut start = 0;
        let mut run = 0;
        for i in 0..capacity {
            if self.test(self.offset + i) {
                run = 0;
                start = i + 1;
                continue;
            }
            run += 1;
            if run == count {
                for j in start..start + count {
                    self.set(self.offset + j, true);
                }
                return Some(self.offset + start);
            }
        }
        None
    }

    /// Marks `count` bits starting at `start` as used, failing if any of them
    /// is outside the bitmap or already set.
    ///
    /// # Errors
    /// [`BitmapError::OutOfRange`] or [`BitmapError::Occupied`]; the bitmap is
    /// unchanged on error.
    pub fn reserve(&mut self, start: u32, count: u32) -> Result<(), BitmapError> {
        let in_range = count > 0
            && self.contains(start)
            && start
                .checked_add(count - 1)
                .is_some_and(|last| self.contains(last));
        if !in_range {
            return Err(BitmapError::OutOfRange { start, count });
        }
        if let Some(taken) = (start..start + count).find(|&i| self.test(i)) {
            return Err(BitmapError::Occupied(taken));
        }
        for i in start..start + count {
            self.set(i, true);
        }
        Ok(())
    }

    /// Clears `count` bits starting at `start`.
    ///
    /// # Panics
    /// If any bit is outside the bitmap or not set.
    pub fn release(&mut self, start: u32, count: u32) {
        for i in start..start + count {
            assert!(self.test(i), "releasing unused index {i:#x}");
            self.set(i, false);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    fn locate(&self, index: u32) -> (usize, u32) {
        assert!(
            self.contains(index),
            "index {index:#x} outside bitmap [{:#x}, {:#x})",
            self.offset,
            self.offset + self.capacity()
        );
        let rel = index - self.offset;
        ((rel / 8) as usize, rel % 8)
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("capacity", &self.capacity())
            .field("used", &self.count_ones())
            .finish()
    }
}
