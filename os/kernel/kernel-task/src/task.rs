//! The task control block.

use crate::Pid;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use kernel_alloc::Bitmap;
use kernel_info::task::{DEFAULT_UMASK, TASK_FILE_NR, TASK_NAME_LEN};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageDirectory;

/// Scheduling state of a task.
///
/// ```text
/// Init → Ready ⇄ Running → { Blocked, Sleeping, Waiting } → Ready → … → Died
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Init,
    Running,
    Ready,
    Blocked,
    Sleeping,
    Waiting,
    Died,
}

impl TaskState {
    /// Whether a task may be parked in this state by `block`.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Blocked | Self::Sleeping | Self::Waiting)
    }
}

/// Fixed-capacity task name.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TaskName {
    bytes: [u8; TASK_NAME_LEN],
    len: u8,
}

impl TaskName {
    /// Truncates `name` to the longest prefix of at most
    /// [`TASK_NAME_LEN`] - 1 bytes that ends on a character boundary.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(TASK_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0; TASK_NAME_LEN];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        #[allow(clippy::cast_possible_truncation)]
        let len = end as u8;
        Self { bytes, len }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only ever filled from a `&str` cut at a char boundary.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on an inode owned by the file system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct InodeRef(pub u32);

/// Handle on an open file owned by the file system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FileRef(pub u32);

/// Which children a `waitpid` waits for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

impl WaitTarget {
    /// Decodes the `pid` argument of `waitpid`: `-1` means any child.
    #[must_use]
    pub const fn from_raw(pid: i32) -> Option<Self> {
        if pid == -1 {
            return Some(Self::Any);
        }
        match Pid::from_raw(pid) {
            Some(pid) => Some(Self::Pid(pid)),
            None => None,
        }
    }

    #[must_use]
    pub fn matches(self, pid: Pid) -> bool {
        match self {
            Self::Any => true,
            Self::Pid(wanted) => wanted == pid,
        }
    }
}

/// Layout markers of the program image and heap.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryLayout {
    pub text: VirtualAddress,
    pub data: VirtualAddress,
    /// End of the loaded image; the heap cannot shrink below it.
    pub end: VirtualAddress,
    /// Current heap break.
    pub brk: VirtualAddress,
}

bitflags! {
    /// Page protection requested from `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags accepted by `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

/// One live `mmap` reservation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmapRegion {
    pub start: VirtualAddress,
    pub pages: u32,
    pub prot: Prot,
    pub flags: MapFlags,
}

impl MmapRegion {
    /// One past the last byte of the region.
    #[must_use]
    pub fn end(&self) -> VirtualAddress {
        self.start + self.pages * kernel_memory_addresses::PAGE_SIZE
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end()
    }
}

/// The task control block.
#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: TaskName,
    pub state: TaskState,
    /// Ticks granted per time slice.
    pub priority: u32,
    /// Ticks left in the current slice.
    pub ticks: u32,
    /// Tick at which the task last ran.
    pub jiffies: u64,
    /// Tick at which a sleeping task becomes due.
    pub wake_at: u64,
    pub uid: u32,
    pub gid: u32,
    pub directory: PageDirectory,
    /// Base of the task's kernel stack page.
    pub kernel_stack: VirtualAddress,
    /// Saved kernel stack pointer while switched out.
    pub stack_pointer: u32,
    /// Pages of the mmap window reserved by this task. Kernel tasks have none.
    pub vmap: Option<Bitmap>,
    pub regions: Vec<MmapRegion>,
    pub layout: MemoryLayout,
    pub status: i32,
    pub waiting_for: Option<WaitTarget>,
    pub pwd: String,
    pub ipwd: Option<InodeRef>,
    pub iroot: Option<InodeRef>,
    pub iexec: Option<InodeRef>,
    pub umask: u16,
    pub files: [Option<FileRef>; TASK_FILE_NR],
}

impl Task {
    /// A fresh task in state [`TaskState::Init`] running in `directory`.
    #[must_use]
    pub fn new(pid: Pid, name: &str, priority: u32, uid: u32, directory: PageDirectory) -> Self {
        Self {
            pid,
            ppid: Pid::IDLE,
            name: TaskName::new(name),
            state: TaskState::Init,
            priority,
            ticks: priority,
            jiffies: 0,
            wake_at: 0,
            uid,
            gid: 0,
            directory,
            kernel_stack: VirtualAddress::zero(),
            stack_pointer: 0,
            vmap: None,
            regions: Vec::new(),
            layout: MemoryLayout::default(),
            status: 0,
            waiting_for: None,
            pwd: String::from("/"),
            ipwd: None,
            iroot: None,
            iexec: None,
            umask: DEFAULT_UMASK,
            files: [None; TASK_FILE_NR],
        }
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.vmap.is_some()
    }

    /// The mmap region containing `va`.
    #[must_use]
    pub fn region_at(&self, va: VirtualAddress) -> Option<&MmapRegion> {
        self.regions.iter().find(|r| r.contains(va))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        assert_eq!(TaskName::new("init").as_str(), "init");
        assert_eq!(TaskName::new("a-very-long-task-name").as_str(), "a-very-long-tas");
        // 'é' is two bytes; the cut must not split it.
        assert_eq!(TaskName::new("ééééééééé").as_str(), "ééééééé");
    }

    #[test]
    fn blocking_states() {
        assert!(TaskState::Blocked.is_blocking());
        assert!(TaskState::Sleeping.is_blocking());
        assert!(TaskState::Waiting.is_blocking());
        assert!(!TaskState::Ready.is_blocking());
        assert!(!TaskState::Running.is_blocking());
        assert!(!TaskState::Died.is_blocking());
    }

    #[test]
    fn wait_targets() {
        assert_eq!(WaitTarget::from_raw(-1), Some(WaitTarget::Any));
        assert_eq!(WaitTarget::from_raw(3), Some(WaitTarget::Pid(Pid::new(3))));
        assert_eq!(WaitTarget::from_raw(999), None);
        assert_eq!(WaitTarget::from_raw(-7), None);
        assert!(WaitTarget::Any.matches(Pid::new(5)));
        assert!(!WaitTarget::Pid(Pid::new(4)).matches(Pid::new(5)));
    }

    #[test]
    fn region_bounds() {
        let region = MmapRegion {
            start: VirtualAddress::new(0x0400_0000),
            pages: 2,
            prot: Prot::READ,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        };
        assert!(region.contains(VirtualAddress::new(0x0400_1FFF)));
        assert!(!region.contains(VirtualAddress::new(0x0400_2000)));
        assert_eq!(region.end().as_u32(), 0x0400_2000);
    }

    #[test]
    fn new_tasks_start_with_a_full_slice() {
        let task = Task::new(Pid::new(2), "sh", 5, 1000, PageDirectory::KERNEL);
        assert_eq!(task.ticks, 5);
        assert_eq!(task.state, TaskState::Init);
        assert_eq!(task.umask, 0o022);
        assert!(!task.is_user());
    }
}
