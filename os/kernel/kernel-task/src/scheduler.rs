//! Choosing the next task to run.

use crate::{Pid, TaskState, TaskTable};
use kernel_info::task::NR_TASKS;
use kernel_sync::CriticalSection;
use log::trace;

impl TaskTable {
    /// The ready task that should run next, or the idle task.
    ///
    /// Candidates are ordered by fewest remaining ticks, then by the oldest
    /// `jiffies` stamp. Remaining ties go to the first candidate in slot order
    /// after `current`, which rotates equal tasks round-robin.
    #[must_use]
    pub fn pick_next(&self, current: Pid) -> Pid {
        let start = current.index() + 1;
        (0..NR_TASKS)
            .map(|i| (start + i) % NR_TASKS)
            .filter_map(|slot| {
                #[allow(clippy::cast_possible_truncation)]
                let pid = Pid::new(slot as u32);
                self.get(pid)
            })
            .filter(|task| task.state == TaskState::Ready && task.pid != Pid::IDLE)
            .min_by_key(|task| (task.ticks, task.jiffies))
            .map_or(Pid::IDLE, |task| task.pid)
    }

    /// Takes `current` off the CPU and marks the task that replaces it as
    /// running. Returns the pid to switch to, which may be `current` itself.
    ///
    /// A still-running `current` is demoted to ready, and an exhausted time
    /// slice is refilled, before the pick.
    pub fn schedule_next(&mut self, _cs: CriticalSection<'_>, current: Pid) -> Pid {
        let task = self.task_mut(current);
        if task.state == TaskState::Running {
            task.state = TaskState::Ready;
        }
        if task.ticks == 0 {
            task.ticks = task.priority;
        }

        let next = self.pick_next(current);
        self.task_mut(next).state = TaskState::Running;
        if next != current {
            trace!("schedule {current} -> {next}");
        }
        next
    }
}
