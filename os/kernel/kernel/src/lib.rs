//! # Kernel Core
//!
//! The memory manager and the process scheduler of a 32-bit protected-mode
//! kernel, held together by one [`Kernel`] context object.
//!
//! ## Architecture
//!
//! ```text
//!            trap layer (IDT, PIC, syscall gate)  ── out of tree
//!                │ page_fault   │ clock_handler   │ syscall
//! ┌──────────────▼──────────────▼─────────────────▼──────────────┐
//! │ Kernel<P>                                                     │
//! │  ├─ frames      FrameTable   (refcounted physical frames)     │
//! │  ├─ kernel_map  Bitmap       (pages of the kernel window)     │
//! │  ├─ tasks       TaskTable    (TCBs, wait lists, policy)       │
//! │  └─ jiffies, current                                          │
//! │ P::Mmu  P::Interrupts  P::Cpu  P::Fs                          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every entry point masks interrupts for its whole check-then-act sequence
//! and threads the resulting [`CriticalSection`] token through the
//! subsystems that require it. Lower-level operations that the caller must
//! already run with interrupts masked, such as [`Kernel::task_block`], take
//! the token as a parameter instead.
//!
//! Collections inside the kernel allocate from [`KernelHeap`], an arena heap
//! over a fixed window of the kernel region.
//!
//! The machine underneath is abstracted by [`Platform`]. [`hosted`] provides
//! a software machine that runs the whole kernel inside a host test.
//!
//! ## Context switches
//!
//! Operations that give up the CPU ([`Kernel::schedule`] and everything that
//! blocks) return once the switch has been requested. On hardware the call
//! returns when the task is resumed; on the hosted machine it returns
//! immediately with [`Kernel::current`] naming the task that now runs. System
//! calls that had to block report [`Completion::Restart`] and are re-issued
//! by the trap layer when the task runs again.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod context;
mod cpu;
mod error;
mod fault;
mod fs;
mod heap;
pub mod hosted;
mod logger;
mod memory;
mod mm;
mod mutex;
mod process;
mod sched;
mod syscall;
mod uaccess;

pub use context::{Selector, SwitchFrame, TrapFrame};
pub use cpu::Cpu;
pub use error::{Errno, SyscallError, WaitError};
pub use fault::FaultOutcome;
pub use fs::{FileSystem, FsError};
pub use heap::KernelHeap;
pub use logger::{KernelLogger, LogSink};
pub use mutex::{LockOutcome, SleepMutex};
pub use process::{Fd, WaitOutcome};
pub use syscall::{Completion, Sysno};

use kernel_alloc::{Bitmap, FrameTable};
use kernel_sync::{CriticalSection, InterruptControl};
use kernel_task::{Pid, Task, TaskTable};
use kernel_vmem::{AddressSpace, Mmu};

/// The hardware (or simulated hardware) the kernel runs on.
pub trait Platform {
    type Mmu: Mmu;
    type Interrupts: InterruptControl;
    type Cpu: Cpu;
    type Fs: FileSystem;
}

/// The collaborators handed to [`Kernel::boot`].
pub struct Machine<P: Platform> {
    pub mmu: P::Mmu,
    pub irq: P::Interrupts,
    pub cpu: P::Cpu,
    pub fs: P::Fs,
}

/// All process-wide kernel state.
pub struct Kernel<P: Platform> {
    mmu: P::Mmu,
    irq: P::Interrupts,
    cpu: P::Cpu,
    fs: P::Fs,
    frames: FrameTable,
    kernel_map: Bitmap,
    tasks: TaskTable,
    jiffies: u64,
    current: Pid,
}

impl<P: Platform> Kernel<P> {
    /// The task that owns the CPU.
    #[must_use]
    pub const fn current(&self) -> Pid {
        self.current
    }

    #[must_use]
    pub fn current_task(&self) -> &Task {
        self.tasks.task(self.current)
    }

    /// Timer ticks since boot.
    #[must_use]
    pub const fn jiffies(&self) -> u64 {
        self.jiffies
    }

    #[must_use]
    pub const fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Pages of the kernel window handed out by [`alloc_kpage`](Self::alloc_kpage).
    #[must_use]
    pub const fn kernel_map(&self) -> &Bitmap {
        &self.kernel_map
    }

    #[must_use]
    pub const fn mmu(&self) -> &P::Mmu {
        &self.mmu
    }

    #[must_use]
    pub const fn cpu(&self) -> &P::Cpu {
        &self.cpu
    }

    #[must_use]
    pub const fn fs(&self) -> &P::Fs {
        &self.fs
    }

    pub const fn fs_mut(&mut self) -> &mut P::Fs {
        &mut self.fs
    }

    /// A handle on the interrupt flag, for callers that must hold a
    /// [`CriticalSection`] across several kernel calls.
    #[must_use]
    pub const fn interrupts(&self) -> &P::Interrupts {
        &self.irq
    }

    /// The address space loaded in CR3, which is the current task's.
    pub fn address_space(&mut self) -> AddressSpace<'_, P::Mmu> {
        AddressSpace::active(&mut self.mmu, &mut self.frames)
    }

    fn current_mut(&mut self, _cs: CriticalSection<'_>) -> &mut Task {
        self.tasks.task_mut(self.current)
    }
}
