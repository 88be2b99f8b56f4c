//! The heap break and anonymous or file-backed mappings.

use crate::error::SyscallError;
use crate::process::Fd;
use crate::{FileSystem, Kernel, Platform};
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::{Bitmap, BitmapError};
use kernel_info::memory::{USER_MMAP_ADDR, USER_MMAP_SIZE};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress, VirtualPage, pages_for};
use kernel_sync::{CriticalSection, IrqGuard};
use kernel_task::{FileRef, MapFlags, MmapRegion, Prot};
use kernel_vmem::{Mmu, PageEntry};
use log::debug;

/// Bytes of the per-task bitmap covering the mmap window.
const USER_VMAP_BYTES: usize = ((USER_MMAP_SIZE >> PAGE_SHIFT) / 8) as usize;

/// A fresh reservation map for the mmap window of a user task.
pub(crate) fn new_vmap() -> Bitmap {
    Bitmap::new(USER_VMAP_BYTES, USER_MMAP_ADDR.page().index())
}

/// Applies the protection of `region` to a user page entry.
pub(crate) fn protect(entry: &mut PageEntry, region: &MmapRegion) {
    let writable = region.prot.contains(Prot::WRITE);
    entry.set_writable(writable);
    entry.set_readonly(!writable);
    entry.set_shared(region.flags.contains(MapFlags::SHARED));
    entry.set_private(region.flags.contains(MapFlags::PRIVATE));
}

impl<P: Platform> Kernel<P> {
    /// Moves the heap break of the current task to `addr`.
    ///
    /// Growing only checks that enough frames are free; the new pages are
    /// backed on first touch. Shrinking unmaps every page above the new break.
    ///
    /// # Errors
    /// [`SyscallError::InvalidArgument`] if `addr` is not page aligned, below
    /// the end of the image, or inside the mmap window, or the caller is a
    /// kernel task. [`SyscallError::NoMemory`] if growing needs more frames
    /// than are free.
    pub fn sys_brk(&mut self, addr: VirtualAddress) -> Result<(), SyscallError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();

        let task = self.current_task();
        if !task.is_user() || !addr.is_page_aligned() || addr < task.layout.end || addr > USER_MMAP_ADDR {
            return Err(SyscallError::InvalidArgument);
        }
        let old = task.layout.brk;

        if addr < old {
            let mut space = self.address_space();
            let mut page = addr;
            while page < old {
                space.unlink_page(cs, page);
                page += PAGE_SIZE;
            }
        } else if (addr - old) >> PAGE_SHIFT > self.frames.free_frames() {
            return Err(SyscallError::NoMemory);
        }

        self.current_mut(cs).layout.brk = addr;
        debug!("brk {old} -> {addr}");
        Ok(())
    }

    /// Maps `length` bytes into the mmap window of the current task and
    /// returns the start.
    ///
    /// A zero `addr` lets the kernel pick the lowest free range; any other
    /// address is used as given. Anonymous mappings are backed page by page
    /// on first touch. File mappings are read in at once from `offset` of
    /// the file behind `fd`.
    ///
    /// # Errors
    /// [`SyscallError::InvalidArgument`] for a zero length, an unaligned or
    /// out-of-window address, or flags that are not exactly one of shared
    /// and private. [`SyscallError::NoMemory`] if the range is taken or the
    /// window is full. [`SyscallError::BadFile`] for a file mapping without an
    /// open `fd`, and any error of the file read.
    pub fn sys_mmap(
        &mut self,
        addr: VirtualAddress,
        length: u32,
        prot: Prot,
        flags: MapFlags,
        fd: Option<Fd>,
        offset: u32,
    ) -> Result<VirtualAddress, SyscallError> {
        if length == 0
            || !addr.is_page_aligned()
            || flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE)
        {
            return Err(SyscallError::InvalidArgument);
        }
        let file = if flags.contains(MapFlags::ANONYMOUS) {
            None
        } else {
            Some(self.file(fd.ok_or(SyscallError::BadFile)?)?)
        };

        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();

        let pages = pages_for(length);
        let task = self.current_mut(cs);
        let vmap = task.vmap.as_mut().ok_or(SyscallError::InvalidArgument)?;
        let start = if addr == VirtualAddress::zero() {
            let index = vmap.scan(pages).ok_or(SyscallError::NoMemory)?;
            VirtualPage::from_index(index).base()
        } else {
            vmap.reserve(addr.page().index(), pages).map_err(|err| match err {
                BitmapError::OutOfRange { .. } => SyscallError::InvalidArgument,
                BitmapError::Occupied(_) => SyscallError::NoMemory,
            })?;
            addr
        };

        let region = MmapRegion {
            start,
            pages,
            prot,
            flags,
        };
        task.regions.push(region);

        if let Some(file) = file
            && let Err(err) = self.map_file(cs, &region, file, offset, length)
        {
            self.unmap_range(cs, start, pages);
            return Err(err);
        }
        debug!("mmap {start}+{pages} pages, {prot:?} {flags:?}");
        Ok(start)
    }

    /// Backs `region` with frames holding the file contents.
    fn map_file(
        &mut self,
        cs: CriticalSection<'_>,
        region: &MmapRegion,
        file: FileRef,
        offset: u32,
        length: u32,
    ) -> Result<(), SyscallError> {
        // Data pages plus the tables that may be needed to map them.
        let needed = region.pages + region.pages.div_ceil(1024) + 1;
        if needed > self.frames.free_frames() {
            return Err(SyscallError::NoMemory);
        }

        let mut space = self.address_space();
        let mut page = region.start;
        while page < region.end() {
            space.link_page(cs, page);
            page += PAGE_SIZE;
        }

        // Read a page at a time; the file may be shorter than the mapping.
        self.fs.lseek(file, offset)?;
        let mut chunk = vec![0; length.min(PAGE_SIZE) as usize];
        let mut done = 0;
        while done < length {
            let n = (length - done).min(PAGE_SIZE) as usize;
            let read = self.fs.read(file, &mut chunk[..n])?;
            self.mmu.write_bytes(region.start + done, &chunk[..read]);
            #[allow(clippy::cast_possible_truncation)]
            let read32 = read as u32;
            done += read32;
            if read < n {
                break;
            }
        }

        // The pages stay writable until the contents are in place.
        let mut space = self.address_space();
        let mut page = region.start;
        while page < region.end() {
            space.get_entry(cs, page, false).update(|entry| protect(entry, region));
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Removes the mappings of `[addr, addr + length)` from the current task.
    ///
    /// Pages in the range that were never mapped are skipped.
    ///
    /// # Errors
    /// [`SyscallError::InvalidArgument`] for a zero length, an unaligned
    /// address, a range outside the mmap window, or a kernel task.
    pub fn sys_munmap(&mut self, addr: VirtualAddress, length: u32) -> Result<(), SyscallError> {
        let window_end = (USER_MMAP_ADDR.as_u32() + USER_MMAP_SIZE) >> PAGE_SHIFT;
        let pages = pages_for(length);
        // Compared in pages; a byte length near 4 GiB would wrap.
        let in_window = addr >= USER_MMAP_ADDR
            && addr
                .page()
                .index()
                .checked_add(pages)
                .is_some_and(|end| end <= window_end);
        if length == 0 || !addr.is_page_aligned() || !in_window || !self.current_task().is_user() {
            return Err(SyscallError::InvalidArgument);
        }

        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        self.unmap_range(guard.token(), addr, pages);
        debug!("munmap {addr}+{pages} pages");
        Ok(())
    }

    /// Unlinks the reserved pages of a range, releases their reservation and
    /// trims the region list.
    fn unmap_range(&mut self, cs: CriticalSection<'_>, start: VirtualAddress, pages: u32) {
        let Self {
            mmu,
            frames,
            tasks,
            current,
            ..
        } = self;
        let task = tasks.task_mut(*current);
        let Some(vmap) = task.vmap.as_mut() else {
            return;
        };

        let mut space = kernel_vmem::AddressSpace::active(mmu, frames);
        let first = start.page().index();
        for index in first..first + pages {
            if vmap.contains(index) && vmap.test(index) {
                space.unlink_page(cs, VirtualPage::from_index(index).base());
                vmap.set(index, false);
            }
        }

        let end = start + (pages << PAGE_SHIFT);
        trim_regions(&mut task.regions, start, end);
    }
}

/// Cuts `[start, end)` out of every region, splitting where needed.
fn trim_regions(regions: &mut Vec<MmapRegion>, start: VirtualAddress, end: VirtualAddress) {
    let mut kept = Vec::with_capacity(regions.len() + 1);
    for region in regions.drain(..) {
        if region.end() <= start || end <= region.start {
            kept.push(region);
            continue;
        }
        if region.start < start {
            kept.push(MmapRegion {
                pages: (start - region.start) >> PAGE_SHIFT,
                ..region
            });
        }
        if end < region.end() {
            kept.push(MmapRegion {
                start: end,
                pages: (region.end() - end) >> PAGE_SHIFT,
                ..region
            });
        }
    }
    *regions = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{self, Hosted};
    use kernel_vmem::Access;

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0080_0000);
    const ANON: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    fn user_kernel() -> Kernel<Hosted> {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.task_create("init", 5, 1000, ENTRY);
        kernel.schedule();
        kernel.enter_user_mode(ENTRY);
        kernel
    }

    fn region(start: u32, pages: u32) -> MmapRegion {
        MmapRegion {
            start: VirtualAddress::new(start),
            pages,
            prot: Prot::READ,
            flags: ANON,
        }
    }

    #[test]
    fn vmap_covers_the_mmap_window() {
        let vmap = new_vmap();
        assert_eq!(vmap.capacity(), USER_MMAP_SIZE >> PAGE_SHIFT);
        assert_eq!(vmap.offset(), 0x4000);
    }

    #[test]
    fn brk_rejects_bad_addresses() {
        let mut kernel = user_kernel();
        kernel.set_image_layout(ENTRY, ENTRY, VirtualAddress::new(0x0090_0000));
        let bad = [0x0090_0800, 0x008F_F000, 0x0400_1000];
        for addr in bad {
            assert_eq!(kernel.sys_brk(VirtualAddress::new(addr)), Err(SyscallError::InvalidArgument));
        }
        let grown = VirtualAddress::new(0x0090_4000);
        assert_eq!(kernel.sys_brk(grown), Ok(()));
        assert_eq!(kernel.current_task().layout.brk, grown);
    }

    #[test]
    fn brk_refuses_more_than_free_memory() {
        let mut kernel = user_kernel();
        let free = kernel.frames().free_frames();
        let end = VirtualAddress::new(0x0090_0000);
        kernel.set_image_layout(ENTRY, ENTRY, end);
        let too_far = end + (free + 1) * PAGE_SIZE;
        assert_eq!(kernel.sys_brk(too_far), Err(SyscallError::NoMemory));
        assert_eq!(kernel.current_task().layout.brk, end);
    }

    #[test]
    fn kernel_tasks_have_no_heap() {
        let mut kernel = hosted::boot(hosted::RAM);
        assert_eq!(kernel.sys_brk(ENTRY), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn anonymous_mappings_are_placed_lowest_first() {
        let mut kernel = user_kernel();
        let a = kernel.sys_mmap(VirtualAddress::zero(), 5000, Prot::READ | Prot::WRITE, ANON, None, 0);
        let b = kernel.sys_mmap(VirtualAddress::zero(), 1, Prot::READ, ANON, None, 0);
        assert_eq!(a, Ok(USER_MMAP_ADDR));
        assert_eq!(b, Ok(USER_MMAP_ADDR + 2 * PAGE_SIZE));
        assert_eq!(kernel.current_task().regions.len(), 2);
        assert_eq!(kernel.current_task().region_at(USER_MMAP_ADDR + 4096).map(|r| r.pages), Some(2));
    }

    #[test]
    fn mmap_flag_checks() {
        let mut kernel = user_kernel();
        let both = MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS;
        assert_eq!(
            kernel.sys_mmap(VirtualAddress::zero(), 4096, Prot::READ, both, None, 0),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_mmap(VirtualAddress::zero(), 0, Prot::READ, ANON, None, 0),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_mmap(VirtualAddress::zero(), 4096, Prot::READ, MapFlags::PRIVATE, None, 0),
            Err(SyscallError::BadFile)
        );
    }

    #[test]
    fn fixed_mappings_must_be_free_and_in_the_window() {
        let mut kernel = user_kernel();
        let at = USER_MMAP_ADDR + 16 * PAGE_SIZE;
        let fixed = ANON | MapFlags::FIXED;
        assert_eq!(kernel.sys_mmap(at, 4096, Prot::READ, fixed, None, 0), Ok(at));
        assert_eq!(kernel.sys_mmap(at, 4096, Prot::READ, fixed, None, 0), Err(SyscallError::NoMemory));
        assert_eq!(
            kernel.sys_mmap(ENTRY, 4096, Prot::READ, fixed, None, 0),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn file_mappings_are_read_in_and_protected() {
        let mut kernel = user_kernel();
        let file = kernel.fs_mut().open(b"0123456789");
        let fd = kernel.task_get_fd(file).unwrap();
        let at = kernel
            .sys_mmap(VirtualAddress::zero(), 8, Prot::READ, MapFlags::PRIVATE, Some(fd), 2)
            .unwrap();

        let mut buf = [0; 8];
        kernel.mmu().read_bytes(at, &mut buf);
        assert_eq!(&buf, b"23456789");
        let entry = kernel.address_space().entry(at).unwrap();
        assert!(entry.readonly() && entry.private() && !entry.writable());
        assert!(kernel.mmu().probe(at, Access::USER_READ).is_ok());
        assert!(kernel.mmu().probe(at, Access::USER_WRITE).is_err());
    }

    #[test]
    fn file_mappings_span_pages_and_stop_at_end_of_file() {
        let mut kernel = user_kernel();
        let data: Vec<u8> = (0..5000_usize).map(|i| u8::try_from(i % 251).unwrap()).collect();
        let file = kernel.fs_mut().open(&data);
        let fd = kernel.task_get_fd(file).unwrap();
        let at = kernel
            .sys_mmap(VirtualAddress::zero(), 3 * PAGE_SIZE, Prot::READ, MapFlags::PRIVATE, Some(fd), 0)
            .unwrap();

        let mut buf = vec![0; 3 * 4096];
        kernel.mmu().read_bytes(at, &mut buf);
        assert_eq!(&buf[..5000], &data[..]);
        assert!(buf[5000..].iter().all(|&b| b == 0));
        assert_eq!(kernel.current_task().regions[0].pages, 3);
    }

    #[test]
    fn munmap_releases_frames_and_reservation() {
        let mut kernel = user_kernel();
        let at = kernel
            .sys_mmap(VirtualAddress::zero(), 3 * PAGE_SIZE, Prot::READ | Prot::WRITE, ANON, None, 0)
            .unwrap();
        kernel.copy_to_user(at, &[1; 3 * 4096]).unwrap();
        let used = kernel.frames().used_frames();

        kernel.sys_munmap(at + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(kernel.frames().used_frames(), used - 1);
        assert_eq!(kernel.current_task().regions.len(), 2);
        let vmap = kernel.current_task().vmap.as_ref().unwrap();
        assert!(!vmap.test(at.page().index() + 1));
        assert!(vmap.test(at.page().index() + 2));

        // Unmapping again is harmless.
        kernel.sys_munmap(at, 3 * PAGE_SIZE).unwrap();
        assert_eq!(kernel.frames().used_frames(), used - 3);
        assert!(kernel.current_task().regions.is_empty());
        assert_eq!(
            kernel.sys_munmap(ENTRY, PAGE_SIZE),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn munmap_rejects_lengths_beyond_the_window() {
        let mut kernel = user_kernel();
        let at = kernel
            .sys_mmap(VirtualAddress::zero(), PAGE_SIZE, Prot::READ, ANON, None, 0)
            .unwrap();
        for length in [u32::MAX, 0xFFFF_F001, USER_MMAP_SIZE + 1] {
            assert_eq!(kernel.sys_munmap(at, length), Err(SyscallError::InvalidArgument));
        }
        assert_eq!(kernel.current_task().regions.len(), 1);
        assert!(kernel.current_task().vmap.as_ref().unwrap().test(at.page().index()));

        // The read-only region is gone after a proper unmap, so a new
        // writable mapping in its place is writable.
        kernel.sys_munmap(at, PAGE_SIZE).unwrap();
        let again = kernel
            .sys_mmap(at, PAGE_SIZE, Prot::READ | Prot::WRITE, ANON, None, 0)
            .unwrap();
        assert_eq!(again, at);
        assert_eq!(kernel.current_task().regions.len(), 1);
        kernel.copy_to_user(at, b"writable").unwrap();
    }

    #[test]
    fn trimming_splits_regions() {
        let mut regions = vec![region(0x0400_0000, 4), region(0x0401_0000, 1)];
        trim_regions(
            &mut regions,
            VirtualAddress::new(0x0400_1000),
            VirtualAddress::new(0x0400_2000),
        );
        assert_eq!(
            regions,
            [region(0x0400_0000, 1), region(0x0400_2000, 2), region(0x0401_0000, 1)]
        );
    }
}
