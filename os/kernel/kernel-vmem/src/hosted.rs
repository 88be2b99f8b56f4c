//! A software model of physical memory and the i386 MMU.
//!
//! [`HostedMmu`] keeps RAM in a byte vector and translates every access
//! through the page tables stored in that RAM, exactly like the hardware walk
//! including the recursive slot. Successful translations are cached in a
//! simulated TLB that is only dropped by [`Mmu::invalidate`] and CR3 loads,
//! so a missing `invlpg` shows up as a stale mapping in tests.

use crate::{Access, Mmu, PageEntry, PageFaultError};
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};

#[derive(Copy, Clone, Debug)]
struct TlbEntry {
    frame: PhysicalPage,
    writable: bool,
    user: bool,
}

impl TlbEntry {
    const fn permits(self, access: Access) -> bool {
        (!access.write || self.writable) && (!access.user || self.user)
    }
}

/// Simulated RAM, CR0/CR3 and TLB of one processor.
pub struct HostedMmu {
    ram: Vec<u8>,
    cr3: PhysicalAddress,
    paging: bool,
    tlb: RefCell<BTreeMap<u32, TlbEntry>>,
    flushes: Cell<u64>,
}

impl HostedMmu {
    /// A machine with `ram_size` bytes of zeroed RAM and paging disabled.
    ///
    /// # Panics
    /// If `ram_size` is not a multiple of the page size.
    #[must_use]
    pub fn new(ram_size: u32) -> Self {
        assert!(ram_size.is_multiple_of(PAGE_SIZE), "RAM size not page aligned");
        Self {
            ram: vec![0; ram_size as usize],
            cr3: PhysicalAddress::zero(),
            paging: false,
            tlb: RefCell::new(BTreeMap::new()),
            flushes: Cell::new(0),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ram_size(&self) -> u32 {
        self.ram.len() as u32
    }

    /// Reads a word of physical memory, bypassing translation.
    #[must_use]
    pub fn read_physical_u32(&self, pa: PhysicalAddress) -> u32 {
        let at = self.index(pa, 4);
        u32::from_le_bytes([
            self.ram[at],
            self.ram[at + 1],
            self.ram[at + 2],
            self.ram[at + 3],
        ])
    }

    /// Number of full TLB flushes (CR3 loads) so far.
    #[must_use]
    pub fn tlb_flushes(&self) -> u64 {
        self.flushes.get()
    }

    /// Number of translations currently cached.
    #[must_use]
    pub fn cached_translations(&self) -> usize {
        self.tlb.borrow().len()
    }

    /// Translates `va` for `access` the way the CPU would.
    ///
    /// # Errors
    /// The error code of the page fault the access would raise.
    pub fn probe(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFaultError> {
        if !self.paging {
            return Ok(PhysicalAddress::new(va.as_u32()));
        }

        let key = va.page().index();
        let cached = self.tlb.borrow().get(&key).copied();
        if let Some(hit) = cached {
            if hit.permits(access) {
                return Ok(hit.frame.base() + va.offset());
            }
            // A hit without the rights forces a fresh walk.
            self.tlb.borrow_mut().remove(&key);
        }

        let entry = self.walk(va, access)?;
        self.tlb.borrow_mut().insert(key, entry);
        Ok(entry.frame.base() + va.offset())
    }

    fn walk(&self, va: VirtualAddress, access: Access) -> Result<TlbEntry, PageFaultError> {
        #[allow(clippy::cast_possible_truncation)]
        let pde_at = self.cr3 + (va.dir_index() as u32) * 4;
        let pde = PageEntry::from_bits(self.read_physical_u32(pde_at));
        if !pde.present() {
            return Err(PageFaultError::for_access(access, false));
        }

        #[allow(clippy::cast_possible_truncation)]
        let pte_at = pde.physical_address() + (va.table_index() as u32) * 4;
        let pte = PageEntry::from_bits(self.read_physical_u32(pte_at));
        if !pte.present() {
            return Err(PageFaultError::for_access(access, false));
        }

        let entry = TlbEntry {
            frame: pte.frame(),
            writable: pde.writable() && pte.writable(),
            user: pde.user() && pte.user(),
        };
        if entry.permits(access) {
            Ok(entry)
        } else {
            Err(PageFaultError::for_access(access, true))
        }
    }

    fn kernel_translate(&self, va: VirtualAddress, write: bool) -> usize {
        let access = if write {
            Access::KERNEL_WRITE
        } else {
            Access::KERNEL_READ
        };
        match self.probe(va, access) {
            Ok(pa) => self.index(pa, 1),
            Err(err) => panic!("kernel page fault at {va}: {}", err.explain()),
        }
    }

    fn index(&self, pa: PhysicalAddress, len: usize) -> usize {
        let at = pa.as_u32() as usize;
        assert!(at + len <= self.ram.len(), "physical address {pa} beyond RAM");
        at
    }

    /// Splits `[va, va + len)` into page-sized pieces and visits each with
    /// its RAM index.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        write: bool,
        mut f: impl FnMut(usize, usize, usize),
    ) {
        let mut done = 0;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let at = va + done as u32;
            let room = (PAGE_SIZE - at.offset()) as usize;
            let n = room.min(len - done);
            let index = self.kernel_translate(at, write);
            f(done, index, n);
            done += n;
        }
    }
}

impl Mmu for HostedMmu {
    fn read_u32(&self, va: VirtualAddress) -> u32 {
        let mut buf = [0; 4];
        self.read_bytes(va, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) {
        self.write_bytes(va, &value.to_le_bytes());
    }

    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) {
        self.for_each_chunk(va, buf.len(), false, |done, at, n| {
            buf[done..done + n].copy_from_slice(&self.ram[at..at + n]);
        });
    }

    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]) {
        let mut pieces = Vec::new();
        self.for_each_chunk(va, data.len(), true, |done, at, n| pieces.push((done, at, n)));
        for (done, at, n) in pieces {
            self.ram[at..at + n].copy_from_slice(&data[done..done + n]);
        }
    }

    fn fill_page(&mut self, page: VirtualPage, value: u8) {
        let at = self.kernel_translate(page.base(), true);
        self.ram[at..at + PAGE_SIZE as usize].fill(value);
    }

    fn copy_page(&mut self, from: VirtualPage, to: VirtualPage) {
        let src = self.kernel_translate(from.base(), false);
        let dst = self.kernel_translate(to.base(), true);
        self.ram.copy_within(src..src + PAGE_SIZE as usize, dst);
    }

    fn invalidate(&mut self, page: VirtualPage) {
        self.tlb.get_mut().remove(&page.index());
    }

    fn directory(&self) -> PhysicalAddress {
        self.cr3
    }

    unsafe fn load_directory(&mut self, dir: PhysicalAddress) {
        assert!(dir.is_page_aligned(), "CR3 {dir} not page aligned");
        self.cr3 = dir;
        self.tlb.get_mut().clear();
        self.flushes.set(self.flushes.get() + 1);
    }

    unsafe fn enable_paging(&mut self, dir: PhysicalAddress) {
        // SAFETY: forwarded from the caller.
        unsafe { self.load_directory(dir) };
        self.paging = true;
    }

    fn paging_enabled(&self) -> bool {
        self.paging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: PhysicalAddress = PhysicalAddress::new(0x1000);
    const TABLE: PhysicalAddress = PhysicalAddress::new(0x2000);

    fn write_phys(mmu: &mut HostedMmu, pa: PhysicalAddress, entry: PageEntry) {
        // Paging is off, so virtual equals physical.
        mmu.write_u32(VirtualAddress::new(pa.as_u32()), entry.into_bits());
    }

    /// Maps 0x0000_0000..0x0040_0000 identically, supervisor-only, and
    /// installs the recursive slot.
    fn paged() -> HostedMmu {
        let mut mmu = HostedMmu::new(0x0050_0000);
        write_phys(&mut mmu, DIR, PageEntry::kernel(TABLE.frame()));
        write_phys(&mut mmu, DIR + 1023 * 4, PageEntry::kernel(DIR.frame()));
        for i in 1..1024 {
            write_phys(
                &mut mmu,
                TABLE + i * 4,
                PageEntry::kernel(PhysicalPage::from_index(i)),
            );
        }
        unsafe { mmu.enable_paging(DIR) };
        mmu
    }

    #[test]
    fn unpaged_accesses_are_physical() {
        let mut mmu = HostedMmu::new(0x10_000);
        mmu.write_u32(VirtualAddress::new(0x100), 0x1234_5678);
        assert_eq!(mmu.read_physical_u32(PhysicalAddress::new(0x100)), 0x1234_5678);
    }

    #[test]
    fn identity_walk() {
        let mmu = paged();
        let pa = mmu.probe(VirtualAddress::new(0x3_4567), Access::KERNEL_WRITE).unwrap();
        assert_eq!(pa, PhysicalAddress::new(0x3_4567));
        assert_eq!(mmu.cached_translations(), 1);
    }

    #[test]
    fn recursive_slot_exposes_tables() {
        let mmu = paged();
        // Entry 5 of the table behind slot 0.
        let entry = PageEntry::from_bits(mmu.read_u32(VirtualAddress::new(0xFFC0_0000 + 5 * 4)));
        assert_eq!(entry.frame().index(), 5);
        // Slot 0 of the directory.
        let pde = PageEntry::from_bits(mmu.read_u32(VirtualAddress::new(0xFFFF_F000)));
        assert_eq!(pde.frame(), TABLE.frame());
    }

    #[test]
    fn faults_carry_error_codes() {
        let mmu = paged();
        let err = mmu.probe(VirtualAddress::new(0x10), Access::KERNEL_READ).unwrap_err();
        assert!(!err.present());
        let err = mmu.probe(VirtualAddress::new(0x0050_0000), Access::USER_WRITE).unwrap_err();
        assert!(!err.present() && err.write() && err.user());
        let err = mmu.probe(VirtualAddress::new(0x1000), Access::USER_READ).unwrap_err();
        assert!(err.present() && err.user());
    }

    #[test]
    fn stale_translation_survives_until_invalidated() {
        let mut mmu = paged();
        let va = VirtualAddress::new(0x5000);
        assert!(mmu.probe(va, Access::KERNEL_READ).is_ok());

        // Unmap page 5 behind the TLB's back.
        mmu.write_u32(VirtualAddress::new(0xFFC0_0000 + 5 * 4), 0);
        assert!(mmu.probe(va, Access::KERNEL_READ).is_ok());

        mmu.invalidate(va.page());
        assert!(mmu.probe(va, Access::KERNEL_READ).is_err());
    }

    #[test]
    fn cr3_load_flushes() {
        let mut mmu = paged();
        let _ = mmu.read_u32(VirtualAddress::new(0x8000));
        assert!(mmu.cached_translations() > 0);
        mmu.flush_all();
        assert_eq!(mmu.cached_translations(), 0);
        assert_eq!(mmu.tlb_flushes(), 2);
    }

    #[test]
    fn byte_copies_cross_pages() {
        let mut mmu = paged();
        let va = VirtualAddress::new(0x6FFE);
        mmu.write_bytes(va, &[1, 2, 3, 4]);
        let mut buf = [0; 4];
        mmu.read_bytes(va, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mmu.read_physical_u32(PhysicalAddress::new(0x7000)) & 0xFFFF, 0x0403);
    }

    #[test]
    #[should_panic(expected = "kernel page fault")]
    fn kernel_access_to_unmapped_memory_panics() {
        let mmu = paged();
        let _ = mmu.read_u32(VirtualAddress::new(0x0060_0000));
    }
}
