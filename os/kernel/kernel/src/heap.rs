//! The kernel heap behind `alloc`.
//!
//! An [`ArenaHeap`] over the pages of the heap window. The window sits inside
//! the identity-mapped kernel region, so the same addresses work before and
//! after paging is enabled, and boot keeps the kernel page allocator away
//! from it.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use kernel_alloc::{ArenaHeap, PageWindow};
use kernel_info::memory::KERNEL_HEAP_SIZE;
use kernel_memory_addresses::PAGE_SHIFT;
use kernel_sync::{InterruptControl, IrqGuard};

/// Words of the heap window's page bitmap.
pub const HEAP_MAP_WORDS: usize = ((KERNEL_HEAP_SIZE >> PAGE_SHIFT) / 64) as usize;

type Heap = ArenaHeap<PageWindow<HEAP_MAP_WORDS>>;

/// A global allocator serialized by masking interrupts.
pub struct KernelHeap<I: InterruptControl> {
    irq: I,
    heap: UnsafeCell<Heap>,
}

// SAFETY: the kernel runs on one CPU and the heap is only touched with
// interrupts masked.
unsafe impl<I: InterruptControl + Sync> Sync for KernelHeap<I> {}

impl<I: InterruptControl> KernelHeap<I> {
    /// A heap over the `KERNEL_HEAP_SIZE` bytes at `base`.
    ///
    /// # Safety
    /// The window must be mapped writable and used by nothing else for as
    /// long as the heap lives.
    #[must_use]
    pub const unsafe fn new(irq: I, base: usize) -> Self {
        Self {
            irq,
            heap: UnsafeCell::new(ArenaHeap::new(PageWindow::new(base))),
        }
    }

    /// Pages of the window in use.
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.with_heap(|heap| heap.source().used_pages())
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        let _guard = IrqGuard::new(&self.irq);
        // SAFETY: interrupts are masked and the heap never re-enters the
        // allocator, so this is the only live reference.
        f(unsafe { &mut *self.heap.get() })
    }
}

// SAFETY: `ArenaHeap` returns blocks that fit `layout` and are not handed out
// twice.
unsafe impl<I: InterruptControl> GlobalAlloc for KernelHeap<I> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| heap.alloc(layout))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded from the caller.
        self.with_heap(|heap| unsafe { heap.dealloc(ptr, layout) });
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
#[global_allocator]
// SAFETY: the heap window is identity mapped from boot on and reserved in the
// kernel page map.
static KERNEL_HEAP: KernelHeap<kernel_sync::HardwareInterrupts> = unsafe {
    KernelHeap::new(
        kernel_sync::HardwareInterrupts,
        kernel_info::memory::KERNEL_HEAP_ADDR.as_u32() as usize,
    )
};
