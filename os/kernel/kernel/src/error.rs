use crate::fs::FsError;

/// POSIX error numbers returned to user space, negated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    EIO = 5,
    EBADF = 9,
    ECHILD = 10,
    ENOMEM = 12,
    EFAULT = 14,
    EINVAL = 22,
    EMFILE = 24,
    ENOSYS = 38,
}

impl Errno {
    /// The system-call return value reporting this error.
    #[must_use]
    pub const fn as_return(self) -> i32 {
        -(self as i32)
    }
}

/// A failed system call.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not enough memory")]
    NoMemory,
    #[error("bad address")]
    Fault,
    #[error("bad file descriptor")]
    BadFile,
    #[error("too many open files")]
    TooManyFiles,
    #[error("no such system call {0}")]
    NoSys(u32),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl SyscallError {
    #[must_use]
    pub const fn errno(self) -> Errno {
        match self {
            Self::InvalidArgument => Errno::EINVAL,
            Self::NoMemory => Errno::ENOMEM,
            Self::Fault => Errno::EFAULT,
            Self::BadFile | Self::Fs(FsError::BadFile) => Errno::EBADF,
            Self::TooManyFiles => Errno::EMFILE,
            Self::NoSys(_) => Errno::ENOSYS,
            Self::Wait(WaitError::NoChild) => Errno::ECHILD,
            Self::Fs(FsError::Io) => Errno::EIO,
        }
    }
}

/// Why `waitpid` cannot wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WaitError {
    #[error("no matching child process")]
    NoChild,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_negative_errno() {
        assert_eq!(SyscallError::Wait(WaitError::NoChild).errno().as_return(), -10);
        assert_eq!(SyscallError::NoMemory.errno().as_return(), -12);
        assert_eq!(SyscallError::from(FsError::BadFile).errno(), Errno::EBADF);
        assert_eq!(SyscallError::NoSys(999).errno(), Errno::ENOSYS);
    }
}
