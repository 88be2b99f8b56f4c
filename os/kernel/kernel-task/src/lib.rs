//! # Tasks
//!
//! The task control block, the fixed-size task table it lives in, the wait
//! lists tasks park on, and the policy that picks the next task to run.
//!
//! ```text
//! ┌──────────── TaskTable ─────────────┐
//! │ slot 0  idle                       │     WaitLists
//! │ slot 1  init      ───────────────────►  BLOCK  : 4 → 7
//! │ slot 2  sh                         │     SLEEP  : 2 (t=130) → 5 (t=400)
//! │ …                                  │     mutex#3: 6
//! └────────────────────────────────────┘
//! ```
//!
//! Wait lists hold process ids, never references, and a task is on at most
//! one list at a time. Everything that mutates the table takes a
//! [`CriticalSection`](kernel_sync::CriticalSection): the timer interrupt
//! touches the same structures.
//!
//! Context switching is not done here; [`TaskTable::schedule_next`] only
//! decides and updates states.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod pid;
mod scheduler;
mod table;
mod task;
pub mod wait_list;

pub use pid::Pid;
pub use table::TaskTable;
pub use task::{
    FileRef, InodeRef, MapFlags, MemoryLayout, MmapRegion, Prot, Task, TaskName, TaskState,
    WaitTarget,
};
pub use wait_list::{WaitListId, WaitLists};
