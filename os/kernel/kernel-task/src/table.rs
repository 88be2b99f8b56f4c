//! The task table and the blocking primitives built on it.

use crate::wait_list::{WaitListId, WaitLists};
use crate::{Pid, Task, TaskState};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_info::task::NR_TASKS;
use kernel_sync::CriticalSection;
use log::{debug, trace};

/// Fixed-capacity arena of task control blocks; the slot index is the pid.
pub struct TaskTable {
    slots: Vec<Option<Box<Task>>>,
    lists: WaitLists,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NR_TASKS);
        slots.resize_with(NR_TASKS, || None);
        Self {
            slots,
            lists: WaitLists::new(),
        }
    }

    /// The lowest free slot, if any.
    #[must_use]
    pub fn free_slot(&self) -> Option<Pid> {
        let index = self.slots.iter().position(Option::is_none)?;
        #[allow(clippy::cast_possible_truncation)]
        let pid = Pid::new(index as u32);
        Some(pid)
    }

    /// Places the task built by `build` in the lowest free slot.
    ///
    /// # Panics
    /// If the table is full, or `build` returns a task with another pid.
    pub fn insert(&mut self, _cs: CriticalSection<'_>, build: impl FnOnce(Pid) -> Task) -> Pid {
        let Some(pid) = self.free_slot() else {
            panic!("no more tasks");
        };
        let task = build(pid);
        assert_eq!(task.pid, pid, "task built for the wrong slot");
        trace!("task {pid} ({}) created", task.name);
        self.slots[pid.index()] = Some(Box::new(task));
        pid
    }

    /// Frees the slot of `pid` and returns its task.
    ///
    /// # Panics
    /// If the slot is empty or the task is still on a wait list.
    pub fn remove(&mut self, _cs: CriticalSection<'_>, pid: Pid) -> Task {
        assert!(!self.lists.is_linked(pid), "freeing task {pid} while it waits");
        let Some(task) = self.slots[pid.index()].take() else {
            panic!("freeing empty task slot {pid}");
        };
        trace!("task {pid} ({}) freed", task.name);
        *task
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.slots[pid.index()].as_deref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots[pid.index()].as_deref_mut()
    }

    /// # Panics
    /// If there is no task `pid`.
    #[must_use]
    pub fn task(&self, pid: Pid) -> &Task {
        match self.get(pid) {
            Some(task) => task,
            None => panic!("no task {pid}"),
        }
    }

    /// # Panics
    /// If there is no task `pid`.
    pub fn task_mut(&mut self, pid: Pid) -> &mut Task {
        match self.get_mut(pid) {
            Some(task) => task,
            None => panic!("no task {pid}"),
        }
    }

    /// All live tasks in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.slots.iter().filter_map(|slot| slot.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> + '_ {
        self.slots.iter_mut().filter_map(|slot| slot.as_deref_mut())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn wait_lists(&self) -> &WaitLists {
        &self.lists
    }

    /// Creates a wait list for a higher layer.
    pub fn create_wait_list(&mut self) -> WaitListId {
        self.lists.create()
    }

    pub fn destroy_wait_list(&mut self, id: WaitListId) {
        self.lists.destroy(id);
    }

    /// Parks `pid` on `list` (the default block list if `None`) in `state`.
    ///
    /// Does not switch tasks; the caller reschedules if `pid` is running.
    ///
    /// # Panics
    /// If `state` is not a blocking state or the task already waits.
    pub fn block(
        &mut self,
        _cs: CriticalSection<'_>,
        pid: Pid,
        list: Option<WaitListId>,
        state: TaskState,
    ) {
        assert!(state.is_blocking(), "cannot block task {pid} into {state:?}");
        assert!(!self.lists.is_linked(pid), "task {pid} is already blocked");
        let list = list.unwrap_or(WaitListId::BLOCK);
        self.lists.push_back(list, pid);
        self.task_mut(pid).state = state;
        debug!("task {pid} blocked ({state:?})");
    }

    /// Removes `pid` from whatever list holds it and makes it ready.
    pub fn unblock(&mut self, _cs: CriticalSection<'_>, pid: Pid) {
        self.lists.remove(pid);
        let task = self.task_mut(pid);
        task.state = TaskState::Ready;
        debug!("task {pid} unblocked");
    }

    /// Parks `pid` on the sleep list until tick `wake_at`.
    ///
    /// The list stays sorted by wake tick; tasks due at the same tick wake in
    /// the order they went to sleep.
    ///
    /// # Panics
    /// If the task already waits.
    pub fn sleep_until(&mut self, _cs: CriticalSection<'_>, pid: Pid, wake_at: u64) {
        assert!(!self.lists.is_linked(pid), "task {pid} is already blocked");
        let Self { slots, lists } = &mut *self;
        let key_of = |other: Pid| slots[other.index()].as_ref().map_or(0, |t| t.wake_at);
        lists.insert_sorted(WaitListId::SLEEP, pid, wake_at, key_of);

        let task = self.task_mut(pid);
        task.wake_at = wake_at;
        task.state = TaskState::Sleeping;
        debug!("task {pid} sleeps until tick {wake_at}");
    }

    /// Makes every sleeper due at or before `now` ready, earliest first.
    /// Returns the woken tasks in wake order.
    pub fn wake_due(&mut self, cs: CriticalSection<'_>, now: u64) -> Vec<Pid> {
        let mut woken = Vec::new();
        while let Some(pid) = self.lists.front(WaitListId::SLEEP) {
            if self.task(pid).wake_at > now {
                break;
            }
            self.unblock(cs, pid);
            woken.push(pid);
        }
        woken
    }

    /// Pops the longest waiter of `list`, if any, and makes it ready.
    pub fn unblock_first(&mut self, cs: CriticalSection<'_>, list: WaitListId) -> Option<Pid> {
        let pid = self.lists.front(list)?;
        self.unblock(cs, pid);
        Some(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::PageDirectory;

    fn cs() -> CriticalSection<'static> {
        // SAFETY: host tests have no interrupts.
        unsafe { CriticalSection::new() }
    }

    fn spawn(table: &mut TaskTable, name: &str) -> Pid {
        let pid = table.insert(cs(), |pid| Task::new(pid, name, 5, 0, PageDirectory::KERNEL));
        table.task_mut(pid).state = TaskState::Ready;
        pid
    }

    #[test]
    fn slots_are_reused_lowest_first() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        let b = spawn(&mut table, "b");
        let c = spawn(&mut table, "c");
        assert_eq!((a.as_u32(), b.as_u32(), c.as_u32()), (0, 1, 2));
        table.remove(cs(), b);
        assert_eq!(spawn(&mut table, "d"), b);
        assert_eq!(table.len(), 3);
    }

    #[test]
    #[should_panic(expected = "no more tasks")]
    fn full_table_is_fatal() {
        let mut table = TaskTable::new();
        for _ in 0..=NR_TASKS {
            spawn(&mut table, "t");
        }
    }

    #[test]
    fn block_and_unblock() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        table.block(cs(), a, None, TaskState::Blocked);
        assert_eq!(table.task(a).state, TaskState::Blocked);
        assert_eq!(table.wait_lists().list_of(a), Some(WaitListId::BLOCK));
        table.unblock(cs(), a);
        assert_eq!(table.task(a).state, TaskState::Ready);
        assert!(!table.wait_lists().is_linked(a));
    }

    #[test]
    #[should_panic(expected = "cannot block")]
    fn blocking_into_ready_is_rejected() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        table.block(cs(), a, None, TaskState::Ready);
    }

    #[test]
    #[should_panic(expected = "already blocked")]
    fn blocking_twice_is_rejected() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        table.block(cs(), a, None, TaskState::Blocked);
        table.block(cs(), a, None, TaskState::Waiting);
    }

    #[test]
    fn sleepers_wake_in_tick_order() {
        let mut table = TaskTable::new();
        let _idle = spawn(&mut table, "idle");
        let t3 = spawn(&mut table, "t3");
        let t1 = spawn(&mut table, "t1");
        let t2 = spawn(&mut table, "t2");
        table.sleep_until(cs(), t3, 30);
        table.sleep_until(cs(), t1, 10);
        table.sleep_until(cs(), t2, 20);

        assert!(table.wake_due(cs(), 9).is_empty());
        assert_eq!(table.wake_due(cs(), 35), [t1, t2, t3]);
        assert_eq!(table.task(t2).state, TaskState::Ready);
    }

    #[test]
    fn wakeup_stops_at_first_future_sleeper() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        let b = spawn(&mut table, "b");
        table.sleep_until(cs(), a, 5);
        table.sleep_until(cs(), b, 50);
        assert_eq!(table.wake_due(cs(), 5), [a]);
        assert_eq!(table.task(b).state, TaskState::Sleeping);
        assert_eq!(table.wait_lists().front(WaitListId::SLEEP), Some(b));
    }

    #[test]
    fn ad_hoc_lists_wake_in_fifo_order() {
        let mut table = TaskTable::new();
        let list = table.create_wait_list();
        let a = spawn(&mut table, "a");
        let b = spawn(&mut table, "b");
        table.block(cs(), a, Some(list), TaskState::Blocked);
        table.block(cs(), b, Some(list), TaskState::Blocked);
        assert_eq!(table.unblock_first(cs(), list), Some(a));
        assert_eq!(table.unblock_first(cs(), list), Some(b));
        assert_eq!(table.unblock_first(cs(), list), None);
        table.destroy_wait_list(list);
    }

    #[test]
    #[should_panic(expected = "while it waits")]
    fn removing_a_waiting_task_is_rejected() {
        let mut table = TaskTable::new();
        let a = spawn(&mut table, "a");
        table.block(cs(), a, None, TaskState::Blocked);
        let _ = table.remove(cs(), a);
    }
}
