//! Boot-time memory setup and kernel page allocation.

use crate::{Cpu, Kernel, Machine, Platform};
use kernel_alloc::{Bitmap, FrameTable};
use kernel_info::boot::{MemoryMapError, MemoryRegion, select_usable_memory};
use kernel_info::memory::{
    KERNEL_HEAP_ADDR, KERNEL_HEAP_SIZE, KERNEL_MEMORY_SIZE, KERNEL_SCRATCH_PAGE, MEMORY_BASE,
};
use kernel_info::task::{IDLE_PRIORITY, KERNEL_USER};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_task::{Pid, TaskState, TaskTable};
use kernel_vmem::{Mmu, init_kernel_mapping, reset_page, scan_page};
use log::{debug, info};

/// First page of the kernel window handed out by `alloc_kpage`.
const KERNEL_MAP_FIRST: u32 = MEMORY_BASE >> PAGE_SHIFT;

/// Bytes of the bitmap covering `MEMORY_BASE..KERNEL_MEMORY_SIZE`.
const KERNEL_MAP_BYTES: usize = (((KERNEL_MEMORY_SIZE - MEMORY_BASE) >> PAGE_SHIFT) / 8) as usize;

impl<P: Platform> Kernel<P> {
    /// Sizes the frame table from the boot memory map, builds the boot page
    /// directory, enables paging and turns the calling thread into the idle
    /// task.
    ///
    /// # Errors
    /// If the memory map has no usable region the kernel can manage.
    ///
    /// # Safety
    /// Must be called once, with paging disabled, on a machine whose low
    /// 8 MiB are free for the kernel.
    pub unsafe fn boot(
        machine: Machine<P>,
        memory_map: &[MemoryRegion],
    ) -> Result<Self, MemoryMapError> {
        for region in memory_map {
            debug!("memory map: {region:?}");
        }
        let memory = select_usable_memory(memory_map)?;
        let Machine {
            mut mmu,
            irq,
            cpu,
            fs,
        } = machine;

        // Every frame of the identity-mapped window belongs to the kernel.
        let frames = FrameTable::new(memory.end() >> PAGE_SHIFT, KERNEL_MEMORY_SIZE >> PAGE_SHIFT);
        info!(
            "memory {:#x}..{:#x}: {} frames, {} free",
            memory.base,
            memory.end(),
            frames.total_frames(),
            frames.free_frames()
        );

        // SAFETY: forwarded from the caller.
        unsafe { init_kernel_mapping(&mut mmu) };

        let mut kernel_map = Bitmap::new(KERNEL_MAP_BYTES, KERNEL_MAP_FIRST);
        // The scratch page is only ever mapped on demand; the heap window
        // belongs to the kernel heap.
        let reserved = [
            (KERNEL_SCRATCH_PAGE.page().index(), 1),
            (KERNEL_HEAP_ADDR.page().index(), KERNEL_HEAP_SIZE >> PAGE_SHIFT),
        ];
        for (first, count) in reserved {
            if let Err(err) = kernel_map.reserve(first, count) {
                panic!("kernel map: {err}");
            }
        }

        let mut kernel = Self {
            mmu,
            irq,
            cpu,
            fs,
            frames,
            kernel_map,
            tasks: TaskTable::new(),
            jiffies: 0,
            current: Pid::IDLE,
        };

        // The boot thread carries on as the idle task.
        let idle = kernel.spawn_kernel_task("idle", IDLE_PRIORITY, KERNEL_USER);
        debug_assert_eq!(idle, Pid::IDLE);
        let irq = kernel.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let task = kernel.current_mut(cs);
        task.state = TaskState::Running;
        let stack_top = task.kernel_stack + PAGE_SIZE;
        kernel.cpu.set_kernel_stack(stack_top);
        debug!("paging on, idle task running");
        Ok(kernel)
    }

    /// Allocates `count` contiguous pages of the kernel window. The pages
    /// are identity mapped and keep whatever they contained.
    ///
    /// # Panics
    /// If no run of `count` free pages is left.
    pub fn alloc_kpage(&mut self, count: u32) -> VirtualAddress {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let addr = scan_page(guard.token(), &mut self.kernel_map, count);
        debug!("alloc kernel pages {addr}+{count}");
        addr
    }

    /// Returns pages obtained from [`alloc_kpage`](Self::alloc_kpage).
    ///
    /// # Panics
    /// If any of the pages was not allocated.
    pub fn free_kpage(&mut self, addr: VirtualAddress, count: u32) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        reset_page(guard.token(), &mut self.kernel_map, addr, count);
        debug!("free kernel pages {addr}+{count}");
    }

    pub(crate) fn zero_kpage(&mut self, addr: VirtualAddress) {
        self.mmu.fill_page(addr.page(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{self, Hosted};
    use kernel_info::memory::{KERNEL_PAGE_DIR, USER_EXEC_ADDR};
    use kernel_vmem::PageDirectory;

    #[test]
    fn boot_sizes_the_frame_table_from_the_largest_region() {
        let kernel = hosted::boot(hosted::RAM);
        let frames = kernel.frames();
        assert_eq!(frames.total_frames(), hosted::RAM >> 12);
        assert_eq!(frames.first_usable(), 2048);
        assert_eq!(frames.used_frames(), 0);
        assert_eq!(kernel.mmu().directory(), KERNEL_PAGE_DIR);
    }

    #[test]
    fn boot_rejects_memory_inside_the_kernel_window() {
        let map = [MemoryRegion::new(0x10_0000, 0x40_0000, 1)];
        let result = unsafe { Kernel::<Hosted>::boot(hosted::machine(0x50_0000), &map) };
        assert!(matches!(result, Err(MemoryMapError::TooSmall(_))));
    }

    #[test]
    fn boot_thread_becomes_idle() {
        let kernel = hosted::boot(hosted::RAM);
        assert_eq!(kernel.current(), Pid::IDLE);
        let idle = kernel.current_task();
        assert_eq!(idle.name.as_str(), "idle");
        assert_eq!(idle.state, TaskState::Running);
        assert_eq!(idle.directory, PageDirectory::KERNEL);
        assert_eq!(kernel.cpu().kernel_stack(), idle.kernel_stack + 4096);
    }

    #[test]
    fn kernel_pages_come_from_the_window() {
        let mut kernel = hosted::boot(hosted::RAM);
        let a = kernel.alloc_kpage(2);
        let b = kernel.alloc_kpage(1);
        assert!(a.as_u32() >= MEMORY_BASE);
        assert!(b.as_u32() < USER_EXEC_ADDR.as_u32());
        assert_eq!(b, a + 2 * 4096);
        kernel.free_kpage(a, 2);
        assert_eq!(kernel.alloc_kpage(1), a);
    }

    #[test]
    fn scratch_page_and_heap_are_never_handed_out() {
        let mut kernel = hosted::boot(hosted::RAM);
        let heap = KERNEL_HEAP_ADDR.as_u32()..KERNEL_HEAP_ADDR.as_u32() + KERNEL_HEAP_SIZE;
        let free = kernel.kernel_map().capacity() - kernel.kernel_map().count_ones();
        for _ in 0..free {
            let page = kernel.alloc_kpage(1);
            assert_ne!(page, KERNEL_SCRATCH_PAGE);
            assert!(!heap.contains(&page.as_u32()), "{page} lies in the heap");
        }
    }

    #[test]
    #[should_panic(expected = "scan page fail")]
    fn exhausted_kernel_window_is_fatal() {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.alloc_kpage(0x700);
    }
}
