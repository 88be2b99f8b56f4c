//! # Physical Frame and Virtual Page Bookkeeping
//!
//! The allocation structures underneath the memory manager:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Bitmap                                │
//! │    • contiguous runs of virtual pages               │
//! │    • kernel window and per-task mmap window         │
//! └─────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────┐
//! │           Frame Table                               │
//! │    • one reference count per physical frame         │
//! │    • copy-on-write sharing                          │
//! │    • counted `Frame` handles                        │
//! └─────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────┐
//! │           Arena Heap                                │
//! │    • size classes of 16..1024 bytes per page        │
//! │    • whole-page runs for larger requests            │
//! │    • backs `alloc` inside the kernel                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ### Frame Table ([`frame_alloc`])
//!
//! A byte per physical frame, indexed by frame number. Allocation scans from
//! the first usable frame for a zero count; releasing decrements and frees at
//! zero. Mutation requires a [`CriticalSection`](kernel_sync::CriticalSection)
//! because the page-fault path allocates too.
//!
//! ### Bitmap ([`bitmap`])
//!
//! A fixed-capacity bit vector whose bit 0 stands for a configured base index.
//! Used to hand out contiguous virtual page runs.
//!
//! ### Arena Heap ([`arena`])
//!
//! A kmalloc-style heap over any [`PageSource`]. [`PageWindow`] is a source
//! over a fixed range of identity-mapped pages that needs no allocation of
//! its own, so the heap works from the first instruction on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arena;
pub mod bitmap;
pub mod frame_alloc;

pub use arena::{ArenaHeap, PageSource, PageWindow};
pub use bitmap::{Bitmap, BitmapError};
pub use frame_alloc::{Frame, FrameError, FrameTable};
