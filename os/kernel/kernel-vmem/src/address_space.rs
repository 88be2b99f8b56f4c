//! # Address Space (i386, recursively mapped)
//!
//! Checked access to the **active** page directory and its tables through
//! the recursive self-map, plus the operations the memory manager is built
//! from.
//!
//! ## Highlights
//!
//! - [`AddressSpace::get_entry`] to reach (and optionally create) the table
//!   entry for a virtual address.
//! - [`AddressSpace::link_page`] / [`AddressSpace::unlink_page`] to back or
//!   release a single user page. Both are idempotent.
//! - [`AddressSpace::copy_into`] to duplicate the user half for `fork`, with
//!   data frames shared copy-on-write and page tables copied.
//! - [`AddressSpace::free_user_mappings`] to give every user frame and table
//!   back to the frame table on `exit`.
//! - [`scan_page`] / [`reset_page`] to hand out and return contiguous runs of
//!   virtual pages tracked by a [`Bitmap`].
//!
//! ## Design
//!
//! - Directory slots below [`KERNEL_DIR_ENTRIES`] map the kernel window and
//!   are shared by every directory. They are never copied or freed here.
//! - Every present user entry owns one reference of its frame in the
//!   [`FrameTable`]. Linking takes a fresh [`Frame`], unlinking releases it.
//! - Foreign frames (a page table being copied, the target of a
//!   copy-on-write) are reached through the kernel's scratch page.
//!
//! ## Safety
//!
//! Every change to a present entry is followed by an `invlpg` for the page it
//! maps, or by a full flush when many entries change at once.

use crate::recursive::{dir_entry_addr, dir_slot_addr, is_recursive, table_base, table_entry_addr};
use crate::{Access, Mmu, PageEntry, PageFaultError};
use kernel_alloc::{Bitmap, Frame, FrameTable};
use kernel_info::memory::{
    KERNEL_DIR_ENTRIES, KERNEL_MEMORY_SIZE, KERNEL_PAGE_DIR, KERNEL_PAGE_TABLES,
    KERNEL_SCRATCH_PAGE, PAGE_DIRECTORY_ADDR, RECURSIVE_SLOT,
};
use kernel_memory_addresses::{
    ENTRIES_PER_TABLE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};
use kernel_sync::CriticalSection;
use log::trace;

/// A page directory living in the identity-mapped kernel window.
///
/// Because the window is identity mapped, the directory is reachable at the
/// virtual address equal to its physical one, whether or not it is active.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageDirectory(PhysicalAddress);

impl PageDirectory {
    /// The boot directory shared by all kernel tasks.
    pub const KERNEL: Self = Self(KERNEL_PAGE_DIR);

    /// # Panics
    /// If `base` is not a page-aligned address inside the kernel window.
    #[must_use]
    pub const fn new(base: PhysicalAddress) -> Self {
        assert!(base.is_page_aligned(), "page directory not page aligned");
        assert!(
            base.as_u32() < KERNEL_MEMORY_SIZE,
            "page directory outside the kernel window"
        );
        Self(base)
    }

    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        self.0
    }

    /// Where the kernel can reach this directory's bytes.
    #[must_use]
    pub const fn kernel_view(self) -> VirtualAddress {
        VirtualAddress::new(self.0.as_u32())
    }

    fn slot(self, dir_index: usize) -> VirtualAddress {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (dir_index as u32) * crate::recursive::ENTRY_SIZE;
        self.kernel_view() + offset
    }
}

/// Builds the boot page directory and switches paging on.
///
/// The first [`KERNEL_DIR_ENTRIES`] directory slots receive the kernel page
/// tables, which identity map the kernel window with supervisor-only
/// read/write access. Page zero stays unmapped so null dereferences fault.
/// The last slot maps the directory onto itself.
///
/// # Safety
/// Must run once, with paging disabled, before any other paging operation.
/// The boot directory and tables must not overlap anything in use.
pub unsafe fn init_kernel_mapping<M: Mmu>(mmu: &mut M) {
    assert!(!mmu.paging_enabled(), "paging is already enabled");

    let dir = PageDirectory::KERNEL;
    mmu.fill_page(dir.kernel_view().page(), 0);

    for (dir_index, &table) in KERNEL_PAGE_TABLES.iter().enumerate() {
        let table_view = VirtualAddress::new(table.as_u32());
        mmu.fill_page(table_view.page(), 0);
        mmu.write_u32(dir.slot(dir_index), PageEntry::kernel(table.frame()).into_bits());

        for table_index in 0..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let frame = (dir_index * ENTRIES_PER_TABLE + table_index) as u32;
            if frame == 0 {
                continue;
            }
            let entry = PageEntry::kernel(PhysicalPage::from_index(frame));
            #[allow(clippy::cast_possible_truncation)]
            let slot = table_view + (table_index as u32) * crate::recursive::ENTRY_SIZE;
            mmu.write_u32(slot, entry.into_bits());
        }
    }

    let recursive = PageEntry::kernel(dir.physical_address().frame());
    mmu.write_u32(dir.slot(RECURSIVE_SLOT), recursive.into_bits());

    // SAFETY: the directory identity maps the whole kernel window.
    unsafe { mmu.enable_paging(dir.physical_address()) };
}

/// Allocates `count` contiguous pages from a page bitmap and returns the
/// address of the first.
///
/// # Panics
/// If no run of `count` free pages exists.
pub fn scan_page(_cs: CriticalSection<'_>, map: &mut Bitmap, count: u32) -> VirtualAddress {
    assert!(count > 0, "scan for zero pages");
    let Some(index) = map.scan(count) else {
        panic!("scan page fail: no run of {count} free pages");
    };
    let addr = VirtualPage::from_index(index).base();
    trace!("scan {count} pages at {addr}");
    addr
}

/// Returns `count` pages starting at `addr` to a page bitmap.
///
/// # Panics
/// If `addr` is not page aligned or any page of the run was not allocated.
pub fn reset_page(_cs: CriticalSection<'_>, map: &mut Bitmap, addr: VirtualAddress, count: u32) {
    assert!(addr.is_page_aligned(), "reset page {addr}: not page aligned");
    map.release(addr.page().index(), count);
    trace!("reset {count} pages at {addr}");
}

/// Handle on the active address space.
///
/// Borrows the MMU and the frame table for the duration of one operation; all
/// table accesses go through the recursive window of whatever directory is in
/// CR3.
pub struct AddressSpace<'a, M: Mmu> {
    mmu: &'a mut M,
    frames: &'a mut FrameTable,
}

/// Checked accessor for one page-table entry of the active address space.
pub struct EntryMut<'s, M: Mmu> {
    mmu: &'s mut M,
    slot: VirtualAddress,
    va: VirtualAddress,
}

impl<M: Mmu> EntryMut<'_, M> {
    #[must_use]
    pub fn get(&self) -> PageEntry {
        PageEntry::from_bits(self.mmu.read_u32(self.slot))
    }

    /// Stores `entry` and drops any cached translation of the page.
    pub fn set(&mut self, entry: PageEntry) {
        self.mmu.write_u32(self.slot, entry.into_bits());
        self.mmu.invalidate(self.va.page());
    }

    /// Applies `f` to the entry, stores the result and returns it.
    pub fn update(&mut self, f: impl FnOnce(&mut PageEntry)) -> PageEntry {
        let mut entry = self.get();
        f(&mut entry);
        self.set(entry);
        entry
    }

    /// The virtual address of the page this entry maps.
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.va
    }
}

impl<'a, M: Mmu> AddressSpace<'a, M> {
    /// View the address space that is currently loaded in CR3.
    pub fn active(mmu: &'a mut M, frames: &'a mut FrameTable) -> Self {
        debug_assert!(mmu.paging_enabled(), "paging is not enabled");
        Self { mmu, frames }
    }

    #[must_use]
    pub fn directory(&self) -> PageDirectory {
        PageDirectory(self.mmu.directory())
    }

    #[must_use]
    pub fn frames(&self) -> &FrameTable {
        self.frames
    }

    /// The directory entry covering `va`.
    #[must_use]
    pub fn dir_entry(&self, va: VirtualAddress) -> PageEntry {
        self.read(dir_entry_addr(va))
    }

    /// The table entry mapping `va`, or `None` if no page table covers it.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntry> {
        if self.dir_entry(va).present() {
            Some(self.read(table_entry_addr(va)))
        } else {
            None
        }
    }

    /// Physical address `va` translates to, if it is mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(va)
            .filter(PageEntry::present)
            .map(|e| e.physical_address() + va.offset())
    }

    /// Checks `access` to `va` against the page tables the way the MMU would.
    ///
    /// # Errors
    /// The page-fault error code the access would raise.
    pub fn check_access(
        &self,
        va: VirtualAddress,
        access: Access,
    ) -> Result<PageEntry, PageFaultError> {
        let pde = self.dir_entry(va);
        if !pde.present() {
            return Err(PageFaultError::for_access(access, false));
        }
        let pte = self.read(table_entry_addr(va));
        if !pte.present() {
            return Err(PageFaultError::for_access(access, false));
        }
        let user = pde.user() && pte.user();
        let writable = pde.writable() && pte.writable();
        if (access.user && !user) || (access.write && !writable) {
            return Err(PageFaultError::for_access(access, true));
        }
        Ok(pte)
    }

    /// The table entry for `va`, creating the covering page table if asked to.
    ///
    /// A new table is allocated from the frame table, zeroed and installed
    /// as present, writable and user accessible.
    ///
    /// # Panics
    /// If the table is absent and `create` is false, or if `va` lies in the
    /// recursive window.
    pub fn get_entry(
        &mut self,
        cs: CriticalSection<'_>,
        va: VirtualAddress,
        create: bool,
    ) -> EntryMut<'_, M> {
        if create {
            self.ensure_table(cs, va);
        } else {
            assert!(self.dir_entry(va).present(), "no page table for {va}");
        }
        EntryMut {
            mmu: &mut *self.mmu,
            slot: table_entry_addr(va),
            va: va.align_down(),
        }
    }

    /// Backs the user page at `va` with a fresh zeroed frame.
    ///
    /// Returns `false` without touching anything if the page is already
    /// present.
    ///
    /// # Panics
    /// If `va` is not page aligned or physical memory is exhausted.
    pub fn link_page(&mut self, cs: CriticalSection<'_>, va: VirtualAddress) -> bool {
        assert!(va.is_page_aligned(), "link page {va}: not page aligned");
        self.ensure_table(cs, va);

        let slot = table_entry_addr(va);
        if self.read(slot).present() {
            return false;
        }

        let frame = self.frames.alloc(cs);
        trace!("link page {va} -> {}", frame.page());
        self.write(slot, PageEntry::user_page(frame.into_page()));
        self.mmu.invalidate(va.page());
        self.mmu.fill_page(va.page(), 0);
        true
    }

    /// Removes the mapping of `va` and drops its frame reference.
    ///
    /// Returns `false` if nothing was mapped.
    ///
    /// # Panics
    /// If `va` is not page aligned.
    pub fn unlink_page(&mut self, cs: CriticalSection<'_>, va: VirtualAddress) -> bool {
        assert!(va.is_page_aligned(), "unlink page {va}: not page aligned");
        let Some(entry) = self.entry(va).filter(PageEntry::present) else {
            return false;
        };

        self.write(table_entry_addr(va), PageEntry::new());
        self.mmu.invalidate(va.page());

        // SAFETY: the entry that owned this reference was just cleared.
        let frame = unsafe { Frame::from_mapping(entry.frame()) };
        let remaining = self.frames.release(cs, frame);
        trace!("unlink page {va} ({} refs left on {})", remaining, entry.frame());
        true
    }

    /// Copies the 4 KiB at `src` into the physical frame `dst`.
    ///
    /// The frame is mapped at the scratch page for the duration of the copy.
    pub fn copy_page_to_frame(&mut self, src: VirtualPage, dst: PhysicalPage) {
        let slot = table_entry_addr(KERNEL_SCRATCH_PAGE);
        let saved = self.read(slot);
        let scratch = KERNEL_SCRATCH_PAGE.page();

        self.write(slot, PageEntry::kernel(dst));
        self.mmu.invalidate(scratch);
        self.mmu.copy_page(src, scratch);

        self.write(slot, saved);
        self.mmu.invalidate(scratch);
    }

    /// Duplicates the user half of this address space into `child` for fork.
    ///
    /// `child` must be a free kernel page. It receives a copy of the active
    /// directory with its recursive slot pointing at itself. Every present
    /// user data page gains one frame reference for the child's mapping, and
    /// unless it is marked shared it is write-protected in both spaces. The
    /// page tables themselves are copied into fresh frames so the two spaces
    /// evolve independently.
    pub fn copy_into(&mut self, cs: CriticalSection<'_>, child: PageDirectory) {
        assert_ne!(child, self.directory(), "cannot copy a directory onto itself");
        self.mmu.copy_page(PAGE_DIRECTORY_ADDR.page(), child.kernel_view().page());
        let recursive = PageEntry::kernel(child.physical_address().frame());
        self.mmu.write_u32(child.slot(RECURSIVE_SLOT), recursive.into_bits());

        for dir_index in KERNEL_DIR_ENTRIES..RECURSIVE_SLOT {
            let pde = self.read(dir_slot_addr(dir_index));
            if !pde.present() {
                continue;
            }

            let table = table_base(dir_index);
            for table_index in 0..ENTRIES_PER_TABLE {
                #[allow(clippy::cast_possible_truncation)]
                let slot = table + (table_index as u32) * crate::recursive::ENTRY_SIZE;
                let mut entry = self.read(slot);
                if !entry.present() {
                    continue;
                }

                // The child's copy of this entry owns the new reference.
                let shared = self.frames.acquire_shared(cs, entry.frame()).into_page();
                debug_assert_eq!(shared, entry.frame());

                if !entry.shared() && entry.writable() {
                    entry.set_writable(false);
                    self.write(slot, entry);
                }
            }

            let copy = self.frames.alloc(cs);
            self.copy_page_to_frame(table.page(), copy.page());
            let child_pde = pde.with_frame(copy.into_page());
            self.mmu.write_u32(child.slot(dir_index), child_pde.into_bits());
        }

        self.mmu.flush_all();
    }

    /// Releases every user data frame and every user page table of this
    /// address space. The directory page itself is left to the caller.
    pub fn free_user_mappings(&mut self, cs: CriticalSection<'_>) {
        for dir_index in KERNEL_DIR_ENTRIES..RECURSIVE_SLOT {
            let pde_slot = dir_slot_addr(dir_index);
            let pde = self.read(pde_slot);
            if !pde.present() {
                continue;
            }

            let table = table_base(dir_index);
            for table_index in 0..ENTRIES_PER_TABLE {
                #[allow(clippy::cast_possible_truncation)]
                let slot = table + (table_index as u32) * crate::recursive::ENTRY_SIZE;
                let entry = self.read(slot);
                if entry.present() {
                    // SAFETY: the whole table is discarded below.
                    let frame = unsafe { Frame::from_mapping(entry.frame()) };
                    self.frames.release(cs, frame);
                }
            }

            self.write(pde_slot, PageEntry::new());
            // SAFETY: the directory slot that referenced the table is cleared.
            let table_frame = unsafe { Frame::from_mapping(pde.frame()) };
            self.frames.release(cs, table_frame);
        }

        self.mmu.flush_all();
    }

    fn ensure_table(&mut self, cs: CriticalSection<'_>, va: VirtualAddress) {
        assert!(!is_recursive(va), "{va} lies in the recursive page-table window");
        let pde_slot = dir_entry_addr(va);
        if self.read(pde_slot).present() {
            return;
        }

        let frame = self.frames.alloc(cs);
        trace!("new page table {} for {va}", frame.page());
        self.write(pde_slot, PageEntry::user_page(frame.into_page()));

        let table = table_base(va.dir_index()).page();
        self.mmu.invalidate(table);
        self.mmu.fill_page(table, 0);
    }

    fn read(&self, slot: VirtualAddress) -> PageEntry {
        PageEntry::from_bits(self.mmu.read_u32(slot))
    }

    fn write(&mut self, slot: VirtualAddress, entry: PageEntry) {
        self.mmu.write_u32(slot, entry.into_bits());
    }
}
