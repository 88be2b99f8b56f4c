//! A mutex whose waiters sleep on a wait list instead of spinning.

use crate::{Kernel, Platform};
use kernel_sync::IrqGuard;
use kernel_task::{Pid, TaskState, WaitListId};
use log::trace;

/// A kernel mutex for code that runs in task context.
///
/// Ownership is handed straight to the longest waiter on unlock, so a task
/// that blocked in [`Kernel::mutex_lock`] holds the lock by the time it runs
/// again. The lock is not recursive.
#[derive(Debug)]
pub struct SleepMutex {
    owner: Option<Pid>,
    waiters: WaitListId,
    /// The owner got the lock on unlock and has not restarted its lock yet.
    handed_over: bool,
}

/// Result of [`Kernel::mutex_lock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockOutcome {
    Acquired,
    /// The caller is blocked; it owns the mutex when it next runs.
    Blocked,
}

impl SleepMutex {
    #[must_use]
    pub const fn owner(&self) -> Option<Pid> {
        self.owner
    }

    #[must_use]
    pub const fn waiters(&self) -> WaitListId {
        self.waiters
    }
}

impl<P: Platform> Kernel<P> {
    #[must_use]
    pub fn mutex_create(&mut self) -> SleepMutex {
        SleepMutex {
            owner: None,
            waiters: self.tasks.create_wait_list(),
            handed_over: false,
        }
    }

    /// # Panics
    /// If the mutex is still held.
    pub fn mutex_destroy(&mut self, mutex: SleepMutex) {
        assert!(mutex.owner.is_none(), "destroying a mutex held by {:?}", mutex.owner);
        self.tasks.destroy_wait_list(mutex.waiters);
    }

    /// Takes the mutex for the current task, or blocks until it is handed
    /// over.
    ///
    /// # Panics
    /// If the current task already holds the mutex, unless it was handed the
    /// lock while blocked in this call.
    pub fn mutex_lock(&mut self, mutex: &mut SleepMutex) -> LockOutcome {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let me = self.current;
        match mutex.owner {
            None => {
                mutex.owner = Some(me);
                LockOutcome::Acquired
            }
            Some(owner) if owner == me => {
                assert!(mutex.handed_over, "mutex is not recursive: task {me} already holds it");
                mutex.handed_over = false;
                LockOutcome::Acquired
            }
            Some(owner) => {
                trace!("task {me} waits for mutex held by {owner}");
                self.task_block(cs, me, Some(mutex.waiters), TaskState::Blocked);
                LockOutcome::Blocked
            }
        }
    }

    /// Releases the mutex. If tasks are waiting, the longest waiter becomes
    /// the owner and the caller yields to it.
    ///
    /// # Panics
    /// If the current task does not hold the mutex.
    pub fn mutex_unlock(&mut self, mutex: &mut SleepMutex) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        assert_eq!(mutex.owner, Some(self.current), "mutex unlocked by a task that does not hold it");

        mutex.owner = self.tasks.unblock_first(cs, mutex.waiters);
        mutex.handed_over = mutex.owner.is_some();
        if let Some(next) = mutex.owner {
            trace!("mutex handed to task {next}");
            self.schedule_locked(cs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted;
    use kernel_memory_addresses::VirtualAddress;

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0010_0000);

    #[test]
    fn contended_lock_is_handed_over_in_order() {
        let mut kernel = hosted::boot(hosted::RAM);
        let a = kernel.task_create("a", 5, 0, ENTRY);
        let b = kernel.task_create("b", 5, 0, ENTRY);
        let c = kernel.task_create("c", 5, 0, ENTRY);
        let mut mutex = kernel.mutex_create();

        kernel.schedule();
        assert_eq!(kernel.current(), a);
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Acquired);
        kernel.task_yield();
        assert_eq!(kernel.current(), b);
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Blocked);
        assert_eq!(kernel.current(), c);
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Blocked);
        assert_eq!(kernel.current(), a);
        assert_eq!(kernel.tasks().wait_lists().len(mutex.waiters()), 2);

        kernel.mutex_unlock(&mut mutex);
        assert_eq!(mutex.owner(), Some(b));
        assert_eq!(kernel.current(), b);
        // The restarted lock finds the mutex already handed over.
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Acquired);
        kernel.mutex_unlock(&mut mutex);
        assert_eq!(mutex.owner(), Some(c));
        assert_eq!(kernel.tasks().task(c).state, TaskState::Running);
    }

    #[test]
    fn uncontended_unlock_keeps_the_cpu() {
        let mut kernel = hosted::boot(hosted::RAM);
        let a = kernel.task_create("a", 5, 0, ENTRY);
        kernel.schedule();
        let mut mutex = kernel.mutex_create();
        kernel.mutex_lock(&mut mutex);
        kernel.mutex_unlock(&mut mutex);
        assert_eq!(mutex.owner(), None);
        assert_eq!(kernel.current(), a);
        kernel.mutex_destroy(mutex);
    }

    #[test]
    #[should_panic(expected = "not recursive")]
    fn relocking_a_held_mutex_is_fatal() {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.task_create("a", 5, 0, ENTRY);
        kernel.schedule();
        let mut mutex = kernel.mutex_create();
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Acquired);
        kernel.mutex_lock(&mut mutex);
    }

    #[test]
    #[should_panic(expected = "not recursive")]
    fn handover_covers_only_the_restarted_lock() {
        let mut kernel = hosted::boot(hosted::RAM);
        let a = kernel.task_create("a", 5, 0, ENTRY);
        let b = kernel.task_create("b", 5, 0, ENTRY);
        let mut mutex = kernel.mutex_create();

        kernel.schedule();
        assert_eq!(kernel.current(), a);
        kernel.mutex_lock(&mut mutex);
        kernel.task_yield();
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Blocked);
        kernel.mutex_unlock(&mut mutex);
        assert_eq!(kernel.current(), b);
        assert_eq!(kernel.mutex_lock(&mut mutex), LockOutcome::Acquired);
        kernel.mutex_lock(&mut mutex);
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn unlock_by_a_stranger_is_fatal() {
        let mut kernel = hosted::boot(hosted::RAM);
        let mut mutex = kernel.mutex_create();
        kernel.mutex_unlock(&mut mutex);
    }
}
