//! Index-linked wait lists.
//!
//! Every task can be on at most one list at a time. The links live in an
//! array indexed by process id rather than inside the task, so inserting and
//! removing a task are O(1) and no list holds a pointer into the task table.

use crate::Pid;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::task::NR_TASKS;

/// Identifies one wait list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WaitListId(u16);

impl WaitListId {
    /// Default list for [`block`](crate::TaskTable::block) without a target.
    pub const BLOCK: Self = Self(0);

    /// Sleeping tasks, ordered by wake tick.
    pub const SLEEP: Self = Self(1);

    const FIXED: u16 = 2;
}

#[derive(Copy, Clone, Debug, Default)]
struct Link {
    prev: Option<Pid>,
    next: Option<Pid>,
    list: Option<WaitListId>,
}

#[derive(Copy, Clone, Debug, Default)]
struct Head {
    first: Option<Pid>,
    last: Option<Pid>,
    len: usize,
    live: bool,
}

/// All wait lists of the system.
#[derive(Debug)]
pub struct WaitLists {
    heads: Vec<Head>,
    links: Vec<Link>,
}

impl Default for WaitLists {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitLists {
    #[must_use]
    pub fn new() -> Self {
        let live = Head {
            live: true,
            ..Head::default()
        };
        Self {
            heads: vec![live; WaitListId::FIXED as usize],
            links: vec![Link::default(); NR_TASKS],
        }
    }

    /// Creates an empty list for a higher layer (a mutex, a pipe, a device).
    pub fn create(&mut self) -> WaitListId {
        let fresh = Head {
            live: true,
            ..Head::default()
        };
        if let Some(index) = self.heads.iter().position(|h| !h.live) {
            self.heads[index] = fresh;
            #[allow(clippy::cast_possible_truncation)]
            return WaitListId(index as u16);
        }
        self.heads.push(fresh);
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.heads.len() - 1) as u16;
        WaitListId(index)
    }

    /// Retires a list created with [`create`](Self::create).
    ///
    /// # Panics
    /// If the list still has waiters or is one of the built-in lists.
    pub fn destroy(&mut self, id: WaitListId) {
        assert!(id.0 >= WaitListId::FIXED, "cannot destroy a built-in wait list");
        let head = self.head_mut(id);
        assert_eq!(head.len, 0, "destroying a wait list with waiters");
        head.live = false;
    }

    /// The list `pid` is linked into, if any.
    #[must_use]
    pub fn list_of(&self, pid: Pid) -> Option<WaitListId> {
        self.links[pid.index()].list
    }

    #[must_use]
    pub fn is_linked(&self, pid: Pid) -> bool {
        self.list_of(pid).is_some()
    }

    #[must_use]
    pub fn len(&self, id: WaitListId) -> usize {
        self.head(id).len
    }

    #[must_use]
    pub fn is_empty(&self, id: WaitListId) -> bool {
        self.len(id) == 0
    }

    /// The longest-waiting task of a FIFO list, or the earliest wake of the
    /// sleep list.
    #[must_use]
    pub fn front(&self, id: WaitListId) -> Option<Pid> {
        self.head(id).first
    }

    /// Tasks on the list, front to back.
    pub fn iter(&self, id: WaitListId) -> impl Iterator<Item = Pid> + '_ {
        core::iter::successors(self.head(id).first, |pid| self.links[pid.index()].next)
    }

    /// Appends `pid` to the back of the list.
    ///
    /// # Panics
    /// If `pid` is already on a list.
    pub fn push_back(&mut self, id: WaitListId, pid: Pid) {
        let last = self.head(id).last;
        self.link(id, pid, last, None);
    }

    /// Inserts `pid` before the first task whose key is greater than `key`,
    /// keeping the list sorted in ascending key order. Equal keys keep their
    /// insertion order.
    ///
    /// # Panics
    /// If `pid` is already on a list.
    pub fn insert_sorted(&mut self, id: WaitListId, pid: Pid, key: u64, key_of: impl Fn(Pid) -> u64) {
        let before = self.iter(id).find(|&other| key_of(other) > key);
        let prev = match before {
            Some(next) => self.links[next.index()].prev,
            None => self.head(id).last,
        };
        self.link(id, pid, prev, before);
    }

    /// Unlinks `pid` from whatever list holds it and returns that list.
    pub fn remove(&mut self, pid: Pid) -> Option<WaitListId> {
        let link = self.links[pid.index()];
        let id = link.list?;

        match link.prev {
            Some(prev) => self.links[prev.index()].next = link.next,
            None => self.head_mut(id).first = link.next,
        }
        match link.next {
            Some(next) => self.links[next.index()].prev = link.prev,
            None => self.head_mut(id).last = link.prev,
        }
        self.head_mut(id).len -= 1;
        self.links[pid.index()] = Link::default();
        Some(id)
    }

    /// Removes and returns the task at the front of the list.
    pub fn pop_front(&mut self, id: WaitListId) -> Option<Pid> {
        let pid = self.front(id)?;
        self.remove(pid);
        Some(pid)
    }

    fn link(&mut self, id: WaitListId, pid: Pid, prev: Option<Pid>, next: Option<Pid>) {
        assert!(
            !self.is_linked(pid),
            "task {pid} is already on a wait list"
        );
        match prev {
            Some(p) => self.links[p.index()].next = Some(pid),
            None => self.head_mut(id).first = Some(pid),
        }
        match next {
            Some(n) => self.links[n.index()].prev = Some(pid),
            None => self.head_mut(id).last = Some(pid),
        }
        self.links[pid.index()] = Link {
            prev,
            next,
            list: Some(id),
        };
        self.head_mut(id).len += 1;
    }

    fn head(&self, id: WaitListId) -> &Head {
        let head = &self.heads[id.0 as usize];
        assert!(head.live, "wait list {id:?} was destroyed");
        head
    }

    fn head_mut(&mut self, id: WaitListId) -> &mut Head {
        let head = &mut self.heads[id.0 as usize];
        assert!(head.live, "wait list {id:?} was destroyed");
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn pid(n: u32) -> Pid {
        Pid::new(n)
    }

    #[test]
    fn fifo_order() {
        let mut lists = WaitLists::new();
        lists.push_back(WaitListId::BLOCK, pid(3));
        lists.push_back(WaitListId::BLOCK, pid(1));
        lists.push_back(WaitListId::BLOCK, pid(2));
        assert_eq!(lists.len(WaitListId::BLOCK), 3);
        assert_eq!(lists.pop_front(WaitListId::BLOCK), Some(pid(3)));
        assert_eq!(lists.pop_front(WaitListId::BLOCK), Some(pid(1)));
        assert_eq!(lists.pop_front(WaitListId::BLOCK), Some(pid(2)));
        assert_eq!(lists.pop_front(WaitListId::BLOCK), None);
    }

    #[test]
    fn remove_from_the_middle() {
        let mut lists = WaitLists::new();
        for n in 1..=4 {
            lists.push_back(WaitListId::BLOCK, pid(n));
        }
        assert_eq!(lists.remove(pid(2)), Some(WaitListId::BLOCK));
        assert_eq!(lists.remove(pid(4)), Some(WaitListId::BLOCK));
        assert_eq!(lists.remove(pid(4)), None);
        let order: Vec<_> = lists.iter(WaitListId::BLOCK).collect();
        assert_eq!(order, [pid(1), pid(3)]);
        assert!(!lists.is_linked(pid(2)));
    }

    #[test]
    fn sorted_insertion() {
        let mut lists = WaitLists::new();
        let wake = |p: Pid| u64::from(p.as_u32()) * 10;
        for n in [3, 1, 4, 2, 5] {
            lists.insert_sorted(WaitListId::SLEEP, pid(n), wake(pid(n)), wake);
        }
        let order: Vec<_> = lists.iter(WaitListId::SLEEP).collect();
        assert_eq!(order, [pid(1), pid(2), pid(3), pid(4), pid(5)]);
    }

    #[test]
    fn equal_keys_keep_arrival_order() {
        let mut lists = WaitLists::new();
        let same = |_: Pid| 7;
        lists.insert_sorted(WaitListId::SLEEP, pid(9), 7, same);
        lists.insert_sorted(WaitListId::SLEEP, pid(4), 7, same);
        let order: Vec<_> = lists.iter(WaitListId::SLEEP).collect();
        assert_eq!(order, [pid(9), pid(4)]);
    }

    #[test]
    #[should_panic(expected = "already on a wait list")]
    fn double_link_panics() {
        let mut lists = WaitLists::new();
        lists.push_back(WaitListId::BLOCK, pid(1));
        lists.push_back(WaitListId::SLEEP, pid(1));
    }

    #[test]
    fn ad_hoc_lists_are_recycled() {
        let mut lists = WaitLists::new();
        let a = lists.create();
        let b = lists.create();
        assert_ne!(a, b);
        lists.push_back(a, pid(5));
        assert_eq!(lists.list_of(pid(5)), Some(a));
        lists.remove(pid(5));
        lists.destroy(a);
        assert_eq!(lists.create(), a);
    }
}
