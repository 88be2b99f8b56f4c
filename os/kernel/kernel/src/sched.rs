//! Context switching, blocking, sleeping and the clock tick.

use crate::{Cpu, Kernel, Platform};
use alloc::vec::Vec;
use kernel_info::task::JIFFY_MS;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_sync::{CriticalSection, IrqGuard};
use kernel_task::{Pid, TaskState, WaitListId};
use kernel_vmem::Mmu;
use log::trace;

impl<P: Platform> Kernel<P> {
    /// Gives the CPU to the ready task with the fewest remaining ticks, the
    /// one that ran longest ago among equals.
    ///
    /// If the current task is still the best choice nothing happens.
    pub fn schedule(&mut self) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        self.schedule_locked(guard.token());
    }

    pub(crate) fn schedule_locked(&mut self, cs: CriticalSection<'_>) {
        let prev = self.current;
        let next = self.tasks.schedule_next(cs, prev);
        if next == prev {
            return;
        }

        let task = self.tasks.task(next);
        let directory = task.directory.physical_address();
        let stack_top = task.kernel_stack + PAGE_SIZE;
        let resume = task.stack_pointer;

        if self.mmu.directory() != directory {
            // SAFETY: every task directory maps the kernel window like the
            // boot directory does.
            unsafe { self.mmu.load_directory(directory) };
        }
        self.cpu.set_kernel_stack(stack_top);
        self.current = next;
        trace!("switch {prev} -> {next}");

        let save = &mut self.tasks.task_mut(prev).stack_pointer;
        // SAFETY: `resume` was stored by the last switch away from `next`,
        // or addresses the switch frame laid out when it was created.
        unsafe { self.cpu.switch_context(prev, save, next, resume) };
    }

    /// Voluntarily gives up the rest of the time slice.
    pub fn task_yield(&mut self) {
        self.schedule();
    }

    /// Blocks `pid` on `list` (the general block list if `None`) in `state`.
    /// If `pid` is the current task, switches away.
    ///
    /// # Panics
    /// If `pid` is already on a wait list or `state` is not a blocking state.
    pub fn task_block(
        &mut self,
        cs: CriticalSection<'_>,
        pid: Pid,
        list: Option<WaitListId>,
        state: TaskState,
    ) {
        self.tasks.block(cs, pid, list, state);
        if pid == self.current {
            self.schedule_locked(cs);
        }
    }

    /// Takes `pid` off its wait list and makes it ready. The current task
    /// keeps the CPU.
    pub fn task_unblock(&mut self, cs: CriticalSection<'_>, pid: Pid) {
        self.tasks.unblock(cs, pid);
    }

    /// Puts the current task to sleep for at least `ms` milliseconds, rounded
    /// to whole ticks and never less than one.
    ///
    /// # Panics
    /// If called by the idle task, which must always be runnable.
    pub fn task_sleep(&mut self, ms: u32) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let pid = self.current;
        assert_ne!(pid, Pid::IDLE, "the idle task cannot sleep");

        let ticks = (ms / JIFFY_MS).max(1);
        self.tasks.sleep_until(cs, pid, self.jiffies + u64::from(ticks));
        self.schedule_locked(cs);
    }

    /// Makes every sleeper whose wake-up tick has passed ready. Returns them
    /// in wake order.
    pub fn task_wakeup(&mut self) -> Vec<Pid> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        self.tasks.wake_due(guard.token(), self.jiffies)
    }

    /// The timer interrupt: advances time, wakes due sleepers and charges the
    /// tick to the current task. A task whose slice is used up is preempted.
    pub fn clock_handler(&mut self) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();

        self.jiffies += 1;
        let now = self.jiffies;
        let woken = self.tasks.wake_due(cs, now);
        if !woken.is_empty() {
            trace!("tick {now}: woke {woken:?}");
        }

        let task = self.current_mut(cs);
        task.jiffies = now;
        task.ticks = task.ticks.saturating_sub(1);
        if task.ticks == 0 {
            self.schedule_locked(cs);
        }
    }
}
