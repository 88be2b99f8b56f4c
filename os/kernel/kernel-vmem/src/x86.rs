//! The MMU of the executing i386 processor.

use crate::Mmu;
use core::arch::asm;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualPage};
use kernel_registers::{Cr0, Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Direct access to memory, `invlpg`, CR0 and CR3.
pub struct X86Mmu {
    _private: (),
}

impl X86Mmu {
    /// # Safety
    /// Only one instance may exist, and only in ring 0.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Mmu for X86Mmu {
    fn read_u32(&self, va: VirtualAddress) -> u32 {
        // SAFETY: callers only pass mapped, aligned kernel addresses.
        unsafe { core::ptr::read_volatile(va.as_u32() as usize as *const u32) }
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) {
        // SAFETY: callers only pass mapped, writable, aligned kernel addresses.
        unsafe { core::ptr::write_volatile(va.as_u32() as usize as *mut u32, value) }
    }

    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) {
        let src = va.as_u32() as usize as *const u8;
        // SAFETY: the range is mapped; it never overlaps a kernel buffer.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
    }

    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]) {
        let dst = va.as_u32() as usize as *mut u8;
        // SAFETY: the range is mapped writable.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) }
    }

    fn fill_page(&mut self, page: VirtualPage, value: u8) {
        let dst = page.base().as_u32() as usize as *mut u8;
        // SAFETY: the page is mapped writable.
        unsafe { core::ptr::write_bytes(dst, value, PAGE_SIZE as usize) }
    }

    fn copy_page(&mut self, from: VirtualPage, to: VirtualPage) {
        let src = from.base().as_u32() as usize as *const u8;
        let dst = to.base().as_u32() as usize as *mut u8;
        // SAFETY: distinct, mapped pages.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE as usize) }
    }

    fn invalidate(&mut self, page: VirtualPage) {
        let va = page.base().as_u32();
        // SAFETY: invlpg has no effect beyond the TLB.
        unsafe { asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) };
    }

    fn directory(&self) -> PhysicalAddress {
        // SAFETY: ring 0.
        unsafe { Cr3::load_unsafe() }.directory()
    }

    unsafe fn load_directory(&mut self, dir: PhysicalAddress) {
        // SAFETY: forwarded from the caller.
        unsafe { Cr3::from_directory(dir).store_unsafe() };
    }

    unsafe fn enable_paging(&mut self, dir: PhysicalAddress) {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.load_directory(dir);
            Cr0::load_unsafe()
                .with_pg_paging(true)
                .with_wp_write_protect(true)
                .store_unsafe();
        }
    }

    fn paging_enabled(&self) -> bool {
        // SAFETY: ring 0.
        unsafe { Cr0::load_unsafe() }.pg_paging()
    }
}
