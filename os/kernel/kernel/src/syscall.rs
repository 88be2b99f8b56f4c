use crate::error::{SyscallError, WaitError};
use crate::process::WaitOutcome;
use crate::uaccess::check_user_range;
use crate::{FileSystem, Kernel, Platform};
use alloc::vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_task::{FileRef, MapFlags, Prot, WaitTarget};
use log::{debug, trace};

/// System call numbers, as passed in `eax`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysno {
    Exit = 1,
    Fork = 2,
    Write = 4,
    Waitpid = 7,
    Getpid = 20,
    Brk = 45,
    Getppid = 64,
    Mmap = 90,
    Munmap = 91,
    Sleep = 158,
    Yield = 162,
}

impl TryFrom<u32> for Sysno {
    type Error = SyscallError;

    fn try_from(nr: u32) -> Result<Self, Self::Error> {
        Ok(match nr {
            x if x == Self::Exit as u32 => Self::Exit,
            x if x == Self::Fork as u32 => Self::Fork,
            x if x == Self::Write as u32 => Self::Write,
            x if x == Self::Waitpid as u32 => Self::Waitpid,
            x if x == Self::Getpid as u32 => Self::Getpid,
            x if x == Self::Brk as u32 => Self::Brk,
            x if x == Self::Getppid as u32 => Self::Getppid,
            x if x == Self::Mmap as u32 => Self::Mmap,
            x if x == Self::Munmap as u32 => Self::Munmap,
            x if x == Self::Sleep as u32 => Self::Sleep,
            x if x == Self::Yield as u32 => Self::Yield,
            _ => return Err(SyscallError::NoSys(nr)),
        })
    }
}

/// How the trap layer should finish a system call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Completion {
    /// Store the value in the caller's `eax` and return to it.
    Return(i32),
    /// The caller blocked; issue the same call again once it runs.
    Restart,
    /// The caller is gone.
    NoReturn,
}

/// `mmap`'s descriptor argument for anonymous mappings.
const NO_FD: u32 = u32::MAX;

impl<P: Platform> Kernel<P> {
    /// Runs system call `nr` for the current task with the raw register
    /// arguments `ebx, ecx, edx, esi, edi, ebp`.
    ///
    /// Failures come back as [`Completion::Return`] with a negated errno.
    pub fn syscall(&mut self, nr: u32, args: [u32; 6]) -> Completion {
        trace!("syscall {nr} {args:x?} from {}", self.current);
        match Sysno::try_from(nr).and_then(|sysno| self.dispatch(sysno, args)) {
            Ok(completion) => completion,
            Err(err) => {
                debug!("syscall {nr} from {} failed: {err}", self.current);
                Completion::Return(err.errno().as_return())
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn dispatch(&mut self, sysno: Sysno, args: [u32; 6]) -> Result<Completion, SyscallError> {
        let [a0, a1, a2, a3, a4, a5] = args;
        let completion = match sysno {
            Sysno::Exit => {
                self.exit(a0 as i32);
                Completion::NoReturn
            }
            Sysno::Fork => Completion::Return(self.fork().as_i32()),
            Sysno::Write => {
                let file = self.file(a0 as usize)?;
                let written = self.write_from_user(file, VirtualAddress::new(a1), a2)?;
                Completion::Return(written as i32)
            }
            Sysno::Waitpid => {
                let target = WaitTarget::from_raw(a0 as i32).ok_or(WaitError::NoChild)?;
                match self.waitpid(target)? {
                    WaitOutcome::Reaped { pid, status } => {
                        if a1 != 0 {
                            self.copy_to_user(VirtualAddress::new(a1), &status.to_le_bytes())?;
                        }
                        Completion::Return(pid.as_i32())
                    }
                    WaitOutcome::Blocked => Completion::Restart,
                }
            }
            Sysno::Getpid => Completion::Return(self.getpid().as_i32()),
            Sysno::Getppid => Completion::Return(self.getppid().as_i32()),
            Sysno::Brk => {
                self.sys_brk(VirtualAddress::new(a0))?;
                Completion::Return(0)
            }
            Sysno::Mmap => {
                let prot = Prot::from_bits(a2).ok_or(SyscallError::InvalidArgument)?;
                let flags = MapFlags::from_bits(a3).ok_or(SyscallError::InvalidArgument)?;
                let fd = (a4 != NO_FD).then_some(a4 as usize);
                let start = self.sys_mmap(VirtualAddress::new(a0), a1, prot, flags, fd, a5)?;
                Completion::Return(start.as_u32() as i32)
            }
            Sysno::Munmap => {
                self.sys_munmap(VirtualAddress::new(a0), a1)?;
                Completion::Return(0)
            }
            Sysno::Sleep => {
                self.task_sleep(a0);
                Completion::Return(0)
            }
            Sysno::Yield => {
                self.task_yield();
                Completion::Return(0)
            }
        };
        Ok(completion)
    }

    /// Writes `len` bytes at `va` to `file` through a buffer of at most one
    /// page. Stops at the first short write.
    fn write_from_user(&mut self, file: FileRef, va: VirtualAddress, len: u32) -> Result<u32, SyscallError> {
        check_user_range(va, len as usize)?;
        let mut chunk = vec![0; len.min(PAGE_SIZE) as usize];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(PAGE_SIZE) as usize;
            self.copy_from_user(va + done, &mut chunk[..n])?;
            let written = self.fs.write(file, &chunk[..n])?;
            #[allow(clippy::cast_possible_truncation)]
            let written32 = written as u32;
            done += written32;
            if written < n {
                break;
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Errno;
    use crate::hosted::{self, Hosted};
    use kernel_info::memory::{USER_MMAP_ADDR, USER_STACK_BOTTOM};

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0080_0000);

    fn user_kernel() -> Kernel<Hosted> {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.task_create("init", 5, 1000, ENTRY);
        kernel.schedule();
        kernel.enter_user_mode(ENTRY);
        kernel
    }

    #[test]
    fn unknown_numbers_are_enosys() {
        let mut kernel = user_kernel();
        assert_eq!(kernel.syscall(999, [0; 6]), Completion::Return(Errno::ENOSYS.as_return()));
    }

    #[test]
    fn pids_come_back_in_eax() {
        let mut kernel = user_kernel();
        assert_eq!(kernel.syscall(Sysno::Getpid as u32, [0; 6]), Completion::Return(1));
        assert_eq!(kernel.syscall(Sysno::Getppid as u32, [0; 6]), Completion::Return(0));
    }

    #[test]
    fn waitpid_without_children_is_echild() {
        let mut kernel = user_kernel();
        let args = [999, 0, 0, 0, 0, 0];
        assert_eq!(
            kernel.syscall(Sysno::Waitpid as u32, args),
            Completion::Return(Errno::ECHILD.as_return())
        );
    }

    #[test]
    fn write_copies_from_user_memory() {
        let mut kernel = user_kernel();
        let out = kernel.fs_mut().open(b"");
        let fd = kernel.task_get_fd(out).unwrap();
        kernel.copy_to_user(USER_STACK_BOTTOM, b"hi there").unwrap();
        let args = [fd as u32, USER_STACK_BOTTOM.as_u32(), 8, 0, 0, 0];
        assert_eq!(kernel.syscall(Sysno::Write as u32, args), Completion::Return(8));
        assert_eq!(kernel.fs().contents(out), Some(&b"hi there"[..]));

        let bad = [9, USER_STACK_BOTTOM.as_u32(), 8, 0, 0, 0];
        assert_eq!(
            kernel.syscall(Sysno::Write as u32, bad),
            Completion::Return(Errno::EBADF.as_return())
        );
    }

    #[test]
    fn huge_writes_fault_before_buffering() {
        let mut kernel = user_kernel();
        let out = kernel.fs_mut().open(b"");
        let fd = kernel.task_get_fd(out).unwrap();
        for (at, len) in [(USER_STACK_BOTTOM.as_u32(), u32::MAX), (0x0080_0000, 0x7FFF_FFFF)] {
            let args = [fd as u32, at, len, 0, 0, 0];
            assert_eq!(
                kernel.syscall(Sysno::Write as u32, args),
                Completion::Return(Errno::EFAULT.as_return())
            );
        }
        assert_eq!(kernel.fs().contents(out), Some(&b""[..]));
    }

    #[test]
    fn writes_span_several_pages() {
        let mut kernel = user_kernel();
        let data: Vec<u8> = (0..3 * 4096 + 100_usize).map(|i| u8::try_from(i % 251).unwrap()).collect();
        kernel.copy_to_user(USER_STACK_BOTTOM + 50, &data).unwrap();
        let out = kernel.fs_mut().open(b"");
        let fd = kernel.task_get_fd(out).unwrap();

        #[allow(clippy::cast_possible_truncation)]
        let args = [fd as u32, USER_STACK_BOTTOM.as_u32() + 50, data.len() as u32, 0, 0, 0];
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let expected = data.len() as i32;
        assert_eq!(kernel.syscall(Sysno::Write as u32, args), Completion::Return(expected));
        assert_eq!(kernel.fs().contents(out), Some(&data[..]));
    }

    #[test]
    fn anonymous_mmap_and_munmap() {
        let mut kernel = user_kernel();
        let args = [0, 4096, 0x3, 0x22, NO_FD, 0];
        #[allow(clippy::cast_possible_wrap)]
        let expected = USER_MMAP_ADDR.as_u32() as i32;
        assert_eq!(kernel.syscall(Sysno::Mmap as u32, args), Completion::Return(expected));
        let args = [USER_MMAP_ADDR.as_u32(), 4096, 0, 0, 0, 0];
        assert_eq!(kernel.syscall(Sysno::Munmap as u32, args), Completion::Return(0));
        let unknown_flag = [0, 4096, 0x3, 0x122, NO_FD, 0];
        assert_eq!(
            kernel.syscall(Sysno::Mmap as u32, unknown_flag),
            Completion::Return(Errno::EINVAL.as_return())
        );
    }

    #[test]
    fn fork_returns_the_child_pid() {
        let mut kernel = user_kernel();
        assert_eq!(kernel.syscall(Sysno::Fork as u32, [0; 6]), Completion::Return(2));
    }
}
