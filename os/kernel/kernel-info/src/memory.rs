//! # Memory Layout
//!
//! Fixed physical and virtual layout of the kernel and of every user address
//! space. All user tasks share the same layout; the kernel window is identity
//! mapped into every page directory.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Low memory, boot page tables   │
//! MEMORY_BASE ├─────────────────────────────────┤ 0x0010_0000
//!             │  Kernel window (identity mapped,│
//!             │  handed out by `alloc_kpage`)   │
//! KERNEL_HEAP ├─────────────────────────────────┤ 0x0050_0000
//!             │  Kernel heap (`alloc`)          │
//!             ├─────────────────────────────────┤ 0x0070_0000
//!             │  Kernel window, scratch page    │
//! USER_EXEC   ├─────────────────────────────────┤ 0x0080_0000
//!             │  Program image, heap (brk)      │
//! USER_MMAP   ├─────────────────────────────────┤ 0x0400_0000
//!             │  mmap window                    │
//! STACK_BOTTOM├─────────────────────────────────┤ 0x07E0_0000
//!             │  User stack (grows down)        │
//! STACK_TOP   ├─────────────────────────────────┤ 0x0800_0000
//!             │  Unused                         │
//! PAGE_TABLES ├─────────────────────────────────┤ 0xFFC0_0000
//!             │  Recursive page-table window    │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Start of the physical memory region the kernel manages (1 MiB).
pub const MEMORY_BASE: u32 = 0x0010_0000;

/// Size of the identity-mapped kernel region starting at physical 0 (8 MiB).
///
/// Every frame below this address is owned by the kernel from boot on.
pub const KERNEL_MEMORY_SIZE: u32 = 0x0080_0000;

/// Physical (and identity-mapped virtual) address of the boot page directory.
pub const KERNEL_PAGE_DIR: PhysicalAddress = PhysicalAddress::new(0x1000);

/// Physical addresses of the page tables mapping the kernel region.
pub const KERNEL_PAGE_TABLES: [PhysicalAddress; KERNEL_DIR_ENTRIES] =
    [PhysicalAddress::new(0x2000), PhysicalAddress::new(0x3000)];

/// Number of page-directory entries covering the kernel region.
///
/// These entries are shared by every address space and are never copied or
/// freed on behalf of a user task.
pub const KERNEL_DIR_ENTRIES: usize = (KERNEL_MEMORY_SIZE >> 22) as usize;

/// Kernel page used for short-lived mappings of foreign frames.
///
/// It is the last page of the kernel window and never handed out by the
/// kernel page allocator.
pub const KERNEL_SCRATCH_PAGE: VirtualAddress =
    VirtualAddress::new(KERNEL_MEMORY_SIZE - PAGE_SIZE);

/// Start of the kernel heap window, inside the kernel window.
///
/// Its pages back `alloc` in the kernel and are never handed out by the
/// kernel page allocator.
pub const KERNEL_HEAP_ADDR: VirtualAddress = VirtualAddress::new(0x0050_0000);

/// Size of the kernel heap window (2 MiB).
pub const KERNEL_HEAP_SIZE: u32 = 0x0020_0000;

/// Load address of user executables; user space starts here.
pub const USER_EXEC_ADDR: VirtualAddress = VirtualAddress::new(KERNEL_MEMORY_SIZE);

/// Start of the per-task mmap window.
pub const USER_MMAP_ADDR: VirtualAddress = VirtualAddress::new(0x0400_0000);

/// Size of the per-task mmap window (48 MiB).
pub const USER_MMAP_SIZE: u32 = 0x0300_0000;

/// Top of the user stack; the first address beyond user space.
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(0x0800_0000);

/// Reserved size of the user stack (2 MiB).
pub const USER_STACK_SIZE: u32 = 0x0020_0000;

/// Lowest address of the user stack reservation.
pub const USER_STACK_BOTTOM: VirtualAddress =
    VirtualAddress::new(USER_STACK_TOP.as_u32() - USER_STACK_SIZE);

/// Page-directory slot that maps the directory onto itself.
pub const RECURSIVE_SLOT: usize = 1023;

/// Virtual base of the recursive page-table window.
///
/// The page table for directory slot `i` appears at `PAGE_TABLES_BASE + i * 4096`.
pub const PAGE_TABLES_BASE: VirtualAddress = VirtualAddress::new(0xFFC0_0000);

/// Virtual address at which the active page directory appears.
pub const PAGE_DIRECTORY_ADDR: VirtualAddress = VirtualAddress::new(0xFFFF_F000);

const _: () = {
    assert!(KERNEL_MEMORY_SIZE.is_multiple_of(1 << 22));
    assert!(MEMORY_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_MMAP_ADDR.as_u32() + USER_MMAP_SIZE <= USER_STACK_BOTTOM.as_u32());
    assert!(USER_EXEC_ADDR.as_u32() < USER_MMAP_ADDR.as_u32());
    assert!(KERNEL_HEAP_ADDR.as_u32() >= MEMORY_BASE);
    assert!(KERNEL_HEAP_ADDR.as_u32() + KERNEL_HEAP_SIZE <= KERNEL_SCRATCH_PAGE.as_u32());
    assert!(KERNEL_HEAP_ADDR.as_u32().is_multiple_of(PAGE_SIZE));
    assert!((KERNEL_HEAP_SIZE / PAGE_SIZE).is_multiple_of(64));
    assert!(PAGE_TABLES_BASE.as_u32() == (RECURSIVE_SLOT as u32) << 22);
    assert!(PAGE_DIRECTORY_ADDR.as_u32() == PAGE_TABLES_BASE.as_u32() + ((RECURSIVE_SLOT as u32) << 12));
};
