//! Task creation, `fork`, `exit` and `waitpid`.

use crate::context::{SwitchFrame, TrapFrame, trap_frame_addr};
use crate::error::{SyscallError, WaitError};
use crate::mm::new_vmap;
use crate::{Cpu, FileSystem, Kernel, Platform};
use kernel_info::memory::{KERNEL_PAGE_DIR, USER_EXEC_ADDR, USER_MMAP_ADDR, USER_STACK_TOP};
use kernel_info::task::TASK_FILE_NR;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::{CriticalSection, IrqGuard};
use kernel_task::{FileRef, MemoryLayout, Pid, Task, TaskState, WaitTarget};
use kernel_vmem::{Mmu, PageDirectory};
use log::{debug, info};

/// Index into a task's file table.
pub type Fd = usize;

/// Descriptors 0, 1 and 2 are the standard streams.
const FIRST_FREE_FD: Fd = 3;

/// Result of a `waitpid` that found a matching child.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The child has been reaped; its slot is free again.
    Reaped { pid: Pid, status: i32 },
    /// The caller is blocked until a matching child exits and must retry.
    Blocked,
}

impl<P: Platform> Kernel<P> {
    /// Creates a kernel task that starts at `entry` the first time it is
    /// scheduled.
    ///
    /// # Panics
    /// If the task table or the kernel window is full.
    pub fn task_create(&mut self, name: &str, priority: u32, uid: u32, entry: VirtualAddress) -> Pid {
        let pid = self.spawn_kernel_task(name, priority, uid);
        let stack = self.tasks.task(pid).kernel_stack;
        let frame_at = stack + (PAGE_SIZE - SwitchFrame::SIZE);
        SwitchFrame::returning_to(entry).write_to(&mut self.mmu, frame_at);

        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let _cs = guard.token();
        let task = self.tasks.task_mut(pid);
        task.stack_pointer = frame_at.as_u32();
        task.state = TaskState::Ready;
        pid
    }

    /// A kernel task with a zeroed kernel stack, left in [`TaskState::Init`].
    pub(crate) fn spawn_kernel_task(&mut self, name: &str, priority: u32, uid: u32) -> Pid {
        let stack = self.alloc_kpage(1);
        self.zero_kpage(stack);
        let root = self.fs.root_inode();
        let pwd = self.fs.iget(root);

        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let pid = self.tasks.insert(guard.token(), |pid| {
            let mut task = Task::new(pid, name, priority, uid, PageDirectory::KERNEL);
            task.kernel_stack = stack;
            task.iroot = Some(root);
            task.ipwd = Some(pwd);
            task
        });
        debug!("task {pid} ({name}) created, priority {priority}, uid {uid}");
        pid
    }

    /// Gives the current kernel task a private address space and leaves the
    /// kernel to `entry` in user mode, with the stack at the top of the user
    /// stack region.
    ///
    /// # Panics
    /// If the current task already runs in user mode.
    pub fn enter_user_mode(&mut self, entry: VirtualAddress) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let pid = self.current;
        assert!(!self.tasks.task(pid).is_user(), "task {pid} is already a user task");

        // The kernel directory has no user tables; the copy is the kernel
        // window plus a recursive slot of its own.
        let directory = self.new_directory(cs);
        let task = self.current_mut(cs);
        task.vmap = Some(new_vmap());
        task.directory = directory;
        task.layout = MemoryLayout {
            text: USER_EXEC_ADDR,
            data: USER_EXEC_ADDR,
            end: USER_EXEC_ADDR,
            brk: USER_EXEC_ADDR,
        };
        let stack = task.kernel_stack;

        // SAFETY: the new directory maps the kernel window like the old one.
        unsafe { self.mmu.load_directory(directory.physical_address()) };
        let frame_at = trap_frame_addr(stack);
        TrapFrame::user_entry(entry, USER_STACK_TOP).write_to(&mut self.mmu, frame_at);
        info!("task {pid} enters user mode at {entry}");
        // SAFETY: the trap frame was just written and its address space is loaded.
        unsafe { self.cpu.return_to_user(frame_at) };
    }

    /// Records where the loaded program image lives. The heap break starts
    /// at the first page boundary after `end`.
    ///
    /// # Panics
    /// If the markers are out of order or outside the program area.
    pub fn set_image_layout(&mut self, text: VirtualAddress, data: VirtualAddress, end: VirtualAddress) {
        assert!(
            USER_EXEC_ADDR <= text && text <= data && data <= end && end <= USER_MMAP_ADDR,
            "bad image layout {text}..{data}..{end}"
        );
        let brk = end.align_up().unwrap_or(USER_MMAP_ADDR);
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let task = self.current_mut(guard.token());
        task.layout = MemoryLayout {
            text,
            data,
            end,
            brk,
        };
    }

    /// Duplicates the current task.
    ///
    /// The child gets a copy of the TCB and file table, its own virtual
    /// bitmap and an address space whose private pages are shared
    /// copy-on-write with the parent. It becomes ready to resume from the
    /// same trap as the parent, with 0 as the system call result. Returns
    /// the child's pid.
    ///
    /// # Panics
    /// If the caller is not running, the task table or the kernel window is
    /// full, or physical memory runs out.
    pub fn fork(&mut self) -> Pid {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let parent = self.current;
        assert_eq!(self.tasks.task(parent).state, TaskState::Running, "fork from a task that is not running");
        assert!(!self.tasks.wait_lists().is_linked(parent), "fork from a waiting task");

        let mut child = self.tasks.task(parent).clone();
        for file in child.files.iter().flatten() {
            self.fs.dup(*file);
        }
        child.ipwd = child.ipwd.map(|inode| self.fs.iget(inode));
        child.iroot = child.iroot.map(|inode| self.fs.iget(inode));
        child.iexec = child.iexec.map(|inode| self.fs.iget(inode));

        // Kernel tasks have no user half to copy.
        let directory = if child.directory == PageDirectory::KERNEL {
            PageDirectory::KERNEL
        } else {
            self.new_directory(cs)
        };
        let stack = self.alloc_kpage(1);
        let stack_pointer = self.fork_stack(child.kernel_stack, stack);

        child.ppid = parent;
        child.directory = directory;
        child.kernel_stack = stack;
        child.stack_pointer = stack_pointer;
        child.state = TaskState::Ready;
        child.ticks = child.priority;
        child.status = 0;
        child.waiting_for = None;
        let pid = self.tasks.insert(cs, move |pid| {
            child.pid = pid;
            child
        });
        debug!("fork {parent} -> {pid}");
        pid
    }

    /// Copies the parent's kernel stack and arranges for the child to leave
    /// its first context switch through the trap exit with `eax` cleared.
    fn fork_stack(&mut self, parent: VirtualAddress, child: VirtualAddress) -> u32 {
        self.mmu.copy_page(parent.page(), child.page());
        let trap_at = trap_frame_addr(child);
        let mut trap = TrapFrame::read_from(&self.mmu, trap_at);
        trap.eax = 0;
        trap.write_to(&mut self.mmu, trap_at);

        let switch_at = VirtualAddress::new(trap_at.as_u32() - SwitchFrame::SIZE);
        SwitchFrame::returning_to(self.cpu.trap_return()).write_to(&mut self.mmu, switch_at);
        switch_at.as_u32()
    }

    /// A new directory holding a copy of the active address space.
    fn new_directory(&mut self, cs: CriticalSection<'_>) -> PageDirectory {
        let page = self.alloc_kpage(1);
        let directory = PageDirectory::new(PhysicalAddress::new(page.as_u32()));
        self.address_space().copy_into(cs, directory);
        directory
    }

    /// Terminates the current task and switches away.
    ///
    /// The address space, bitmap, inode references and open files are
    /// released at once and the children move to the parent. The slot stays
    /// behind as a zombie holding `status` until the parent reaps it.
    ///
    /// # Panics
    /// If called by the idle task or by a task on a wait list.
    pub fn exit(&mut self, status: i32) {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let pid = self.current;
        assert_ne!(pid, Pid::IDLE, "the idle task cannot exit");
        assert!(!self.tasks.wait_lists().is_linked(pid), "exit from a waiting task");

        let directory = self.tasks.task(pid).directory;
        if directory != PageDirectory::KERNEL {
            self.address_space().free_user_mappings(cs);
            // SAFETY: the boot directory maps the kernel window.
            unsafe { self.mmu.load_directory(KERNEL_PAGE_DIR) };
            self.free_kpage(directory.kernel_view(), 1);
        }

        let task = self.tasks.task_mut(pid);
        task.state = TaskState::Died;
        task.status = status;
        task.directory = PageDirectory::KERNEL;
        task.vmap = None;
        task.regions.clear();
        let inodes = [task.ipwd.take(), task.iroot.take(), task.iexec.take()];
        let files = core::mem::replace(&mut task.files, [None; TASK_FILE_NR]);
        let ppid = task.ppid;

        for inode in inodes.into_iter().flatten() {
            self.fs.iput(inode);
        }
        for file in files.into_iter().flatten() {
            self.fs.close(file);
        }
        for orphan in self.tasks.iter_mut().filter(|t| t.ppid == pid && t.pid != pid) {
            orphan.ppid = ppid;
        }

        if let Some(parent) = self.tasks.get_mut(ppid)
            && parent.state == TaskState::Waiting
            && parent.waiting_for.is_some_and(|target| target.matches(pid))
        {
            parent.waiting_for = None;
            self.tasks.unblock(cs, ppid);
        }

        info!("task {pid} exited with status {status}");
        self.schedule_locked(cs);
    }

    /// Reaps a dead child of the current task that matches `target`.
    ///
    /// If matching children exist but none has exited, the caller blocks in
    /// [`TaskState::Waiting`] and retries once an exiting child wakes it.
    ///
    /// # Errors
    /// [`WaitError::NoChild`] at once if no child matches, dead or alive.
    pub fn waitpid(&mut self, target: WaitTarget) -> Result<WaitOutcome, WaitError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        let me = self.current;

        let mut children = self
            .tasks
            .iter()
            .filter(|t| t.ppid == me && t.pid != me && target.matches(t.pid))
            .peekable();
        if children.peek().is_none() {
            return Err(WaitError::NoChild);
        }
        let zombie = children.find(|t| t.state == TaskState::Died).map(|t| t.pid);
        drop(children);

        if let Some(child) = zombie {
            let task = self.tasks.remove(cs, child);
            self.free_kpage(task.kernel_stack, 1);
            debug!("task {me} reaped {child}, status {}", task.status);
            return Ok(WaitOutcome::Reaped {
                pid: child,
                status: task.status,
            });
        }

        self.current_mut(cs).waiting_for = Some(target);
        self.task_block(cs, me, None, TaskState::Waiting);
        Ok(WaitOutcome::Blocked)
    }

    #[must_use]
    pub const fn getpid(&self) -> Pid {
        self.current
    }

    #[must_use]
    pub fn getppid(&self) -> Pid {
        self.current_task().ppid
    }

    /// Installs `file` in the lowest free descriptor above the standard
    /// streams.
    ///
    /// # Errors
    /// [`SyscallError::TooManyFiles`] if the file table is full.
    pub fn task_get_fd(&mut self, file: FileRef) -> Result<Fd, SyscallError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let task = self.current_mut(guard.token());
        let fd = (FIRST_FREE_FD..TASK_FILE_NR)
            .find(|&fd| task.files[fd].is_none())
            .ok_or(SyscallError::TooManyFiles)?;
        task.files[fd] = Some(file);
        Ok(fd)
    }

    /// Clears descriptor `fd` and returns the file it held. The file's
    /// reference moves to the caller.
    ///
    /// # Panics
    /// If `fd` is beyond the file table.
    pub fn task_put_fd(&mut self, fd: Fd) -> Option<FileRef> {
        assert!(fd < TASK_FILE_NR, "fd {fd} beyond the file table");
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        self.current_mut(guard.token()).files[fd].take()
    }

    /// Installs `file` as descriptor `fd` of the current task, replacing
    /// nothing.
    ///
    /// # Errors
    /// [`SyscallError::BadFile`] if `fd` is out of range or in use.
    pub fn task_set_fd(&mut self, fd: Fd, file: FileRef) -> Result<(), SyscallError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let task = self.current_mut(guard.token());
        match task.files.get_mut(fd) {
            Some(slot @ None) => {
                *slot = Some(file);
                Ok(())
            }
            _ => Err(SyscallError::BadFile),
        }
    }

    /// The file behind descriptor `fd` of the current task.
    pub(crate) fn file(&self, fd: Fd) -> Result<FileRef, SyscallError> {
        self.current_task()
            .files
            .get(fd)
            .copied()
            .flatten()
            .ok_or(SyscallError::BadFile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{self, MemoryFs};

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0010_0000);

    #[test]
    fn created_tasks_start_at_their_entry() {
        let mut kernel = hosted::boot(hosted::RAM);
        let pid = kernel.task_create("init", 5, 1000, ENTRY);
        let task = kernel.tasks().task(pid);
        assert_eq!(task.state, TaskState::Ready);
        let frame = SwitchFrame::read_from(kernel.mmu(), VirtualAddress::new(task.stack_pointer));
        assert_eq!(frame.eip, ENTRY.as_u32());
        assert_eq!(task.stack_pointer, task.kernel_stack.as_u32() + 4096 - 20);
        assert_eq!(task.iroot, Some(MemoryFs::ROOT));
    }

    #[test]
    fn forked_kernel_tasks_share_the_kernel_directory() {
        let mut kernel = hosted::boot(hosted::RAM);
        let worker = kernel.task_create("worker", 5, 0, ENTRY);
        kernel.schedule();
        assert_eq!(kernel.current(), worker);
        let kpages = kernel.kernel_map().count_ones();

        let child = kernel.fork();
        assert_eq!(kernel.tasks().task(child).directory, PageDirectory::KERNEL);
        // Only the kernel stack is new.
        assert_eq!(kernel.kernel_map().count_ones(), kpages + 1);

        kernel.task_yield();
        assert_eq!(kernel.current(), child);
        kernel.exit(0);
        assert_eq!(kernel.kernel_map().count_ones(), kpages + 1);
        kernel.waitpid(WaitTarget::Pid(child)).unwrap();
        assert_eq!(kernel.kernel_map().count_ones(), kpages);
    }

    #[test]
    fn fd_table_starts_above_the_standard_streams() {
        let mut kernel = hosted::boot(hosted::RAM);
        let file = FileRef(7);
        assert_eq!(kernel.task_get_fd(file), Ok(3));
        assert_eq!(kernel.task_get_fd(file), Ok(4));
        assert_eq!(kernel.task_put_fd(3), Some(file));
        assert_eq!(kernel.task_get_fd(file), Ok(3));
        assert_eq!(kernel.file(4), Ok(file));
        assert_eq!(kernel.file(9), Err(SyscallError::BadFile));
    }

    #[test]
    fn full_fd_table_is_an_error() {
        let mut kernel = hosted::boot(hosted::RAM);
        for _ in FIRST_FREE_FD..TASK_FILE_NR {
            kernel.task_get_fd(FileRef(1)).unwrap();
        }
        assert_eq!(kernel.task_get_fd(FileRef(1)), Err(SyscallError::TooManyFiles));
    }

    #[test]
    fn standard_streams_are_set_explicitly() {
        let mut kernel = hosted::boot(hosted::RAM);
        assert_eq!(kernel.task_set_fd(1, FileRef(2)), Ok(()));
        assert_eq!(kernel.task_set_fd(1, FileRef(2)), Err(SyscallError::BadFile));
        assert_eq!(kernel.task_set_fd(TASK_FILE_NR, FileRef(2)), Err(SyscallError::BadFile));
    }
}
