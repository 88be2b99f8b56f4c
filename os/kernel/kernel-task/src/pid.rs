use core::fmt;
use kernel_info::task::NR_TASKS;

/// Process id. Equal to the task's slot in the task table.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u32);

impl Pid {
    /// The idle task, selected when nothing else is ready.
    pub const IDLE: Self = Self(0);

    /// The first task created after idle; adopts orphans of the init tree.
    pub const INIT: Self = Self(1);

    /// # Panics
    /// If `pid` does not name a task-table slot.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        assert!((pid as usize) < NR_TASKS, "pid out of range");
        Self(pid)
    }

    /// A pid from a raw system-call argument, if it names a slot.
    #[must_use]
    pub const fn from_raw(pid: i32) -> Option<Self> {
        #[allow(clippy::cast_sign_loss)]
        let raw = pid as u32;
        if pid >= 0 && (raw as usize) < NR_TASKS {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
