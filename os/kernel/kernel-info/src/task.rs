//! # Task and Clock Parameters

/// Capacity of the task table; also the exclusive upper bound of process ids.
pub const NR_TASKS: usize = 64;

/// Maximum task name length in bytes.
pub const TASK_NAME_LEN: usize = 16;

/// Number of file descriptors per task.
pub const TASK_FILE_NR: usize = 16;

/// Timer interrupts per second.
pub const HZ: u32 = 100;

/// Milliseconds per timer tick.
pub const JIFFY_MS: u32 = 1000 / HZ;

/// User id of kernel tasks.
pub const KERNEL_USER: u32 = 0;

/// User id assigned to the first user task.
pub const NORMAL_USER: u32 = 1000;

/// Priority (ticks per slice) of the idle task.
pub const IDLE_PRIORITY: u32 = 1;

/// Priority (ticks per slice) of the init task.
pub const INIT_PRIORITY: u32 = 5;

/// File-creation mask of freshly created tasks.
pub const DEFAULT_UMASK: u16 = 0o022;

const _: () = {
    assert!(1000 % HZ == 0);
    assert!(NR_TASKS >= 2);
};
