//! Size-class arenas for the kernel heap.
//!
//! Small requests are served from single pages cut into equal blocks, one
//! size class per power of two from 16 to 1024 bytes. The first block of each
//! such page holds the [`ArenaHeader`], so every block is aligned to its own
//! size. Larger requests get a run of whole pages with the header at its
//! start and the payload right behind it.
//!
//! ```text
//!  small arena (class 64)              large arena (3 pages)
//! ┌────────┬──────┬──────┬────┐       ┌────────┬────────────────────────┐
//! │ header │ blk1 │ blk2 │ …  │       │ header │ payload …              │
//! └────────┴──────┴──────┴────┘       └────────┴────────────────────────┘
//! ```
//!
//! Free blocks of a class are chained through their first word. When every
//! block of a small arena is free again, the page goes back to the
//! [`PageSource`].

use core::alloc::Layout;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::PAGE_SIZE;

const PAGE: usize = PAGE_SIZE as usize;

/// Number of small size classes.
pub const SIZE_CLASSES: usize = 7;

const SMALLEST_BLOCK: usize = 16;

/// Largest request served from a small arena.
pub const LARGEST_BLOCK: usize = SMALLEST_BLOCK << (SIZE_CLASSES - 1);

const MAGIC: u32 = 0x4152_454E;

/// `ArenaHeader::class` of a large arena.
const LARGE: u32 = u32::MAX;

/// Where the heap gets its pages from.
pub trait PageSource {
    /// `count` contiguous, page-aligned, writable pages, or `None` if there
    /// is no such run.
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>>;

    /// Takes back pages.
    ///
    /// # Safety
    /// `pages` and `count` must match an earlier `alloc_pages` call, and
    /// nothing may use the pages afterwards.
    unsafe fn free_pages(&mut self, pages: NonNull<u8>, count: usize);
}

#[repr(C)]
struct ArenaHeader {
    magic: u32,
    /// Size class index, or `LARGE`.
    class: u32,
    /// Free blocks of a small arena, pages of a large one.
    count: u32,
}

#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

const _: () = {
    assert!(size_of::<ArenaHeader>() <= SMALLEST_BLOCK);
    assert!(size_of::<FreeBlock>() <= SMALLEST_BLOCK);
    assert!(LARGEST_BLOCK < PAGE);
};

const fn block_size(class: usize) -> usize {
    SMALLEST_BLOCK << class
}

/// Blocks per small arena; the first block slot holds the header.
#[must_use]
pub const fn blocks_per_arena(class: usize) -> usize {
    PAGE / block_size(class) - 1
}

/// The small size class serving `layout`, if any.
fn size_class(layout: Layout) -> Option<usize> {
    let need = layout.size().max(layout.align());
    (need <= LARGEST_BLOCK).then(|| {
        let block = need.max(SMALLEST_BLOCK).next_power_of_two();
        (block.trailing_zeros() - SMALLEST_BLOCK.trailing_zeros()) as usize
    })
}

/// The header at the start of the page holding `block`.
fn arena_of(block: NonNull<u8>) -> NonNull<ArenaHeader> {
    let offset = block.addr().get() % PAGE;
    // SAFETY: the arena starts `offset` bytes earlier, in the same page.
    unsafe { block.sub(offset).cast() }
}

/// A heap of size-class arenas over a [`PageSource`].
///
/// Not synchronized; the owner serializes access.
pub struct ArenaHeap<S: PageSource> {
    source: S,
    free: [Option<NonNull<FreeBlock>>; SIZE_CLASSES],
}

impl<S: PageSource> ArenaHeap<S> {
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self {
            source,
            free: [None; SIZE_CLASSES],
        }
    }

    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Blocks waiting on the free list of `class`.
    #[must_use]
    pub fn free_blocks(&self, class: usize) -> usize {
        let mut count = 0;
        let mut next = self.free[class];
        while let Some(block) = next {
            count += 1;
            // SAFETY: blocks on a free list belong to the heap.
            next = unsafe { block.as_ref().next };
        }
        count
    }

    /// Memory for `layout`, or null if the page source is exhausted or the
    /// alignment is a page or more.
    #[must_use]
    pub fn alloc(&mut self, layout: Layout) -> *mut u8 {
        let block = match size_class(layout) {
            Some(class) => self.alloc_small(class),
            None => self.alloc_large(layout),
        };
        block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Returns memory obtained from [`alloc`](Self::alloc). Null is ignored.
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this heap with the same `layout` and
    /// must not be used afterwards.
    ///
    /// # Panics
    /// If `ptr` does not lie in an arena of this heap.
    pub unsafe fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        let mut arena = arena_of(block);
        // SAFETY: every block lies in a page that starts with its header.
        let header = unsafe { arena.as_mut() };
        assert_eq!(header.magic, MAGIC, "freeing {ptr:p}: not a heap block");

        if header.class == LARGE {
            let pages = header.count as usize;
            header.magic = 0;
            // SAFETY: a large arena is one `alloc_pages(pages)` run.
            unsafe { self.source.free_pages(arena.cast(), pages) };
            return;
        }

        let class = header.class as usize;
        debug_assert_eq!(size_class(layout), Some(class), "freeing {ptr:p} with another layout");
        header.count += 1;
        let all_free = header.count as usize == blocks_per_arena(class);

        let block = block.cast::<FreeBlock>();
        // SAFETY: the block is ours again and at least a pointer wide.
        unsafe { block.write(FreeBlock { next: self.free[class] }) };
        self.free[class] = Some(block);
        if all_free {
            self.release(class, arena.cast());
        }
    }

    fn alloc_small(&mut self, class: usize) -> Option<NonNull<u8>> {
        if self.free[class].is_none() {
            self.grow(class)?;
        }
        let block = self.free[class]?;
        // SAFETY: blocks on a free list lie in a live arena of this class.
        unsafe {
            self.free[class] = block.as_ref().next;
            arena_of(block.cast()).as_mut().count -= 1;
        }
        Some(block.cast())
    }

    /// Cuts a fresh page into blocks of `class`.
    #[allow(clippy::cast_possible_truncation)]
    fn grow(&mut self, class: usize) -> Option<()> {
        let page = self.source.alloc_pages(1)?;
        let size = block_size(class);
        let total = blocks_per_arena(class);
        // SAFETY: the page is ours; the header fills the first block slot and
        // `total` blocks follow it.
        unsafe {
            page.cast::<ArenaHeader>().write(ArenaHeader {
                magic: MAGIC,
                class: class as u32,
                count: total as u32,
            });
            for index in (1..=total).rev() {
                let block = page.add(index * size).cast::<FreeBlock>();
                block.write(FreeBlock { next: self.free[class] });
                self.free[class] = Some(block);
            }
        }
        Some(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc_large(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let offset = layout.align().max(SMALLEST_BLOCK);
        if offset >= PAGE {
            return None;
        }
        let pages = layout.size().checked_add(offset)?.div_ceil(PAGE);
        let arena = self.source.alloc_pages(pages)?;
        // SAFETY: the run is ours and `offset` lies inside its first page.
        unsafe {
            arena.cast::<ArenaHeader>().write(ArenaHeader {
                magic: MAGIC,
                class: LARGE,
                count: pages as u32,
            });
            Some(arena.add(offset))
        }
    }

    /// Unlinks every block of the fully free arena at `page` and returns the
    /// page.
    fn release(&mut self, class: usize, page: NonNull<u8>) {
        let mut link = &mut self.free[class];
        while let Some(block) = *link {
            // SAFETY: blocks on a free list belong to the heap.
            let next = unsafe { &mut (*block.as_ptr()).next };
            if arena_of(block.cast()).cast() == page {
                *link = *next;
            } else {
                link = next;
            }
        }
        // SAFETY: small arenas are single pages; none of its blocks is linked
        // any more.
        unsafe {
            page.cast::<ArenaHeader>().as_mut().magic = 0;
            self.source.free_pages(page, 1);
        }
    }
}

/// A fixed window of `WORDS * 64` pages, tracked in an inline bitmap so it
/// works before any heap exists.
pub struct PageWindow<const WORDS: usize> {
    base: usize,
    used: [u64; WORDS],
}

impl<const WORDS: usize> PageWindow<WORDS> {
    /// Pages in the window.
    pub const PAGES: usize = WORDS * 64;

    /// A window of free pages starting at address `base`.
    ///
    /// # Panics
    /// If `base` is not page aligned.
    #[must_use]
    pub const fn new(base: usize) -> Self {
        assert!(base.is_multiple_of(PAGE), "page window base is not page aligned");
        Self { base, used: [0; WORDS] }
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.used.iter().map(|word| word.count_ones() as usize).sum()
    }

    fn is_used(&self, page: usize) -> bool {
        self.used[page / 64] & (1 << (page % 64)) != 0
    }

    fn set(&mut self, page: usize, used: bool) {
        if used {
            self.used[page / 64] |= 1 << (page % 64);
        } else {
            self.used[page / 64] &= !(1 << (page % 64));
        }
    }
}

impl<const WORDS: usize> PageSource for PageWindow<WORDS> {
    /// Lowest run of `count` free pages.
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }
        let mut run = 0;
        for page in 0..Self::PAGES {
            if self.is_used(page) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = page + 1 - count;
                for page in first..=page {
                    self.set(page, true);
                }
                return NonNull::new(ptr::with_exposed_provenance_mut(self.base + first * PAGE));
            }
        }
        None
    }

    /// # Panics
    /// If a page is outside the window or already free.
    unsafe fn free_pages(&mut self, pages: NonNull<u8>, count: usize) {
        let first = (pages.addr().get() - self.base) / PAGE;
        for page in first..first + count {
            assert!(
                page < Self::PAGES && self.is_used(page),
                "heap page {page} is not in use"
            );
            self.set(page, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_PAGES: usize = 64;

    #[repr(C, align(4096))]
    struct Pages([u8; WINDOW_PAGES * PAGE]);

    /// A heap over 64 host pages. The box must outlive the heap.
    fn heap() -> (Box<Pages>, ArenaHeap<PageWindow<1>>) {
        let mut pages = Box::new(Pages([0; WINDOW_PAGES * PAGE]));
        let base = pages.0.as_mut_ptr().expose_provenance();
        (pages, ArenaHeap::new(PageWindow::new(base)))
    }

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn size_classes_round_up_to_powers_of_two() {
        assert_eq!(size_class(layout(1, 1)), Some(0));
        assert_eq!(size_class(layout(16, 8)), Some(0));
        assert_eq!(size_class(layout(24, 8)), Some(1));
        assert_eq!(size_class(layout(8, 256)), Some(4));
        assert_eq!(size_class(layout(1024, 8)), Some(6));
        assert_eq!(size_class(layout(1025, 8)), None);
        assert_eq!(blocks_per_arena(0), 255);
        assert_eq!(blocks_per_arena(6), 3);
    }

    #[test]
    fn small_blocks_share_a_page_until_all_are_free() {
        let (_pages, mut heap) = heap();
        let a = heap.alloc(layout(24, 8));
        let b = heap.alloc(layout(32, 8));
        assert_eq!(heap.source().used_pages(), 1);
        assert_eq!(a.addr() % 32, 0);
        assert_eq!(b, a.wrapping_add(32));
        assert_eq!(heap.free_blocks(1), blocks_per_arena(1) - 2);

        unsafe { heap.dealloc(a, layout(24, 8)) };
        assert_eq!(heap.source().used_pages(), 1);
        unsafe { heap.dealloc(b, layout(32, 8)) };
        assert_eq!(heap.source().used_pages(), 0);
        assert_eq!(heap.free_blocks(1), 0);
    }

    #[test]
    fn full_arena_grows_another_page() {
        let (_pages, mut heap) = heap();
        let big = layout(1000, 8);
        let blocks: Vec<*mut u8> = (0..4).map(|_| heap.alloc(big)).collect();
        assert_eq!(heap.source().used_pages(), 2);
        for (i, &block) in blocks.iter().enumerate() {
            unsafe { block.write_bytes(u8::try_from(i).unwrap(), 1000) };
        }

        // Freeing the lone block of the second page hands that page back.
        unsafe { heap.dealloc(blocks[3], big) };
        assert_eq!(heap.source().used_pages(), 1);
        assert_eq!(unsafe { *blocks[1] }, 1);
        for &block in &blocks[..3] {
            unsafe { heap.dealloc(block, big) };
        }
        assert_eq!(heap.source().used_pages(), 0);
    }

    #[test]
    fn large_requests_take_whole_pages() {
        let (_pages, mut heap) = heap();
        let request = layout(5000, 8);
        let ptr = heap.alloc(request);
        assert_eq!(ptr.addr() % PAGE, SMALLEST_BLOCK);
        assert_eq!(heap.source().used_pages(), 2);
        unsafe { ptr.write_bytes(0xAB, 5000) };

        let aligned = heap.alloc(layout(2000, 64));
        assert_eq!(aligned.addr() % 64, 0);
        assert_eq!(heap.source().used_pages(), 3);

        unsafe { heap.dealloc(ptr, request) };
        unsafe { heap.dealloc(aligned, layout(2000, 64)) };
        assert_eq!(heap.source().used_pages(), 0);
    }

    #[test]
    fn page_alignment_and_exhaustion_give_null() {
        let (_pages, mut heap) = heap();
        assert!(heap.alloc(layout(8, PAGE)).is_null());
        assert!(heap.alloc(layout(WINDOW_PAGES * PAGE, 8)).is_null());

        let most = layout((WINDOW_PAGES - 1) * PAGE - SMALLEST_BLOCK, 8);
        let ptr = heap.alloc(most);
        assert!(!ptr.is_null());
        assert!(!heap.alloc(layout(64, 8)).is_null());
        assert!(heap.alloc(layout(2 * PAGE, 8)).is_null());
        assert!(heap.alloc(layout(128, 8)).is_null());
        assert_eq!(heap.source().used_pages(), WINDOW_PAGES);
    }

    #[test]
    #[should_panic(expected = "not a heap block")]
    fn foreign_pointers_are_fatal() {
        let (mut pages, mut heap) = heap();
        let inside = pages.0.as_mut_ptr().wrapping_add(PAGE + 32);
        unsafe { heap.dealloc(inside, layout(32, 8)) };
    }

    #[test]
    fn window_hands_out_lowest_runs() {
        let mut window = PageWindow::<1>::new(0x0050_0000);
        let a = window.alloc_pages(2).unwrap();
        let b = window.alloc_pages(1).unwrap();
        assert_eq!(a.addr().get(), 0x0050_0000);
        assert_eq!(b.addr().get(), 0x0050_2000);
        unsafe { window.free_pages(a, 2) };
        let c = window.alloc_pages(3).unwrap();
        assert_eq!(c.addr().get(), 0x0050_3000);
        assert_eq!(window.alloc_pages(1), Some(a));
        assert_eq!(window.used_pages(), 5);
        assert_eq!(window.alloc_pages(0), None);
    }

    #[test]
    #[should_panic(expected = "is not in use")]
    fn window_double_free_is_fatal() {
        let mut window = PageWindow::<1>::new(0x0050_0000);
        let a = window.alloc_pages(1).unwrap();
        unsafe {
            window.free_pages(a, 1);
            window.free_pages(a, 1);
        }
    }
}
