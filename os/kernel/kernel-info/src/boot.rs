//! # Kernel Boot Information
//!
//! The loader hands the kernel a list of physical memory regions (the BIOS
//! "address range descriptor" format: base, length, type). It is the only
//! input used to size the frame table.

use crate::memory::{KERNEL_MEMORY_SIZE, MEMORY_BASE};
use kernel_memory_addresses::PAGE_SIZE;

/// Kind of a physical memory region as reported by firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// RAM available to the operating system.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// Any other type code (ACPI reclaimable, NVS, bad memory, ...).
    Other(u32),
}

impl From<u32> for MemoryRegionKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Usable,
            2 => Self::Reserved,
            other => Self::Other(other),
        }
    }
}

/// One entry of the boot memory map.
///
/// Layout matches the 20-byte descriptor written by the loader.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    /// Raw type code, see [`MemoryRegionKind`].
    pub kind: u32,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: u32) -> Self {
        Self { base, size, kind }
    }

    #[must_use]
    pub fn region_kind(&self) -> MemoryRegionKind {
        MemoryRegionKind::from(self.kind)
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (base, size) = (self.base, self.size);
        f.debug_struct("MemoryRegion")
            .field("base", &format_args!("{base:#010x}"))
            .field("size", &format_args!("{size:#010x}"))
            .field("kind", &self.region_kind())
            .finish()
    }
}

/// The usable RAM the kernel will manage, as selected from the memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsableMemory {
    /// Physical start of the region; always [`MEMORY_BASE`].
    pub base: u32,
    /// Length of the region in bytes; page aligned.
    pub size: u32,
}

impl UsableMemory {
    /// One past the last managed physical address.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// Reasons the boot memory map cannot be used.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("no usable memory region reported")]
    NoUsableRegion,
    #[error("usable memory starts at {0:#x}, expected 0x100000")]
    UnexpectedBase(u64),
    #[error("usable memory size {0:#x} is not page aligned")]
    UnalignedSize(u64),
    #[error("usable memory ends at {0:#x}, beyond the 32-bit address space")]
    TooLarge(u64),
    #[error("usable memory ends at {0:#x}, inside the kernel window")]
    TooSmall(u64),
}

/// Picks the largest usable region of the memory map.
///
/// The kernel manages exactly one contiguous region of RAM, which must begin at
/// [`MEMORY_BASE`] and be page aligned in size.
///
/// # Errors
/// See [`MemoryMapError`].
pub fn select_usable_memory(regions: &[MemoryRegion]) -> Result<UsableMemory, MemoryMapError> {
    let mut best: Option<(u64, u64)> = None;
    for region in regions {
        let (base, size) = (region.base, region.size);
        if region.region_kind() != MemoryRegionKind::Usable {
            continue;
        }
        if best.is_none_or(|(_, best_size)| size > best_size) {
            best = Some((base, size));
        }
    }

    let (base, size) = best.ok_or(MemoryMapError::NoUsableRegion)?;
    if base != u64::from(MEMORY_BASE) {
        return Err(MemoryMapError::UnexpectedBase(base));
    }
    if size % u64::from(PAGE_SIZE) != 0 {
        return Err(MemoryMapError::UnalignedSize(size));
    }
    let end = base + size;
    if end > u64::from(u32::MAX) + 1 - u64::from(PAGE_SIZE) {
        return Err(MemoryMapError::TooLarge(end));
    }
    if end <= u64::from(KERNEL_MEMORY_SIZE) {
        return Err(MemoryMapError::TooSmall(end));
    }

    #[allow(clippy::cast_possible_truncation)]
    let usable = UsableMemory {
        base: base as u32,
        size: size as u32,
    };
    Ok(usable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_usable_region_wins() {
        let map = [
            MemoryRegion::new(0, 0x9_F000, 1),
            MemoryRegion::new(0x9_F000, 0x6_1000, 2),
            MemoryRegion::new(0x10_0000, 0x0FF0_0000, 1),
            MemoryRegion::new(0xFFFC_0000, 0x4_0000, 2),
        ];
        let mem = select_usable_memory(&map).unwrap();
        assert_eq!(mem.base, MEMORY_BASE);
        assert_eq!(mem.size, 0x0FF0_0000);
        assert_eq!(mem.end(), 0x1000_0000);
    }

    #[test]
    fn reserved_regions_are_ignored() {
        let map = [MemoryRegion::new(0x10_0000, 0x100_0000, 2)];
        assert_eq!(
            select_usable_memory(&map),
            Err(MemoryMapError::NoUsableRegion)
        );
    }

    #[test]
    fn base_must_be_one_mebibyte() {
        let map = [MemoryRegion::new(0x20_0000, 0x100_0000, 1)];
        assert_eq!(
            select_usable_memory(&map),
            Err(MemoryMapError::UnexpectedBase(0x20_0000))
        );
    }

    #[test]
    fn size_must_be_page_aligned() {
        let map = [MemoryRegion::new(0x10_0000, 0x100_0010, 1)];
        assert_eq!(
            select_usable_memory(&map),
            Err(MemoryMapError::UnalignedSize(0x100_0010))
        );
    }

    #[test]
    fn memory_must_extend_past_the_kernel_window() {
        let map = [MemoryRegion::new(0x10_0000, 0x70_0000, 1)];
        assert_eq!(
            select_usable_memory(&map),
            Err(MemoryMapError::TooSmall(0x80_0000))
        );
    }

    #[test]
    fn descriptor_is_twenty_bytes() {
        assert_eq!(size_of::<MemoryRegion>(), 20);
    }
}
