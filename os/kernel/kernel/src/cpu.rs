use kernel_memory_addresses::VirtualAddress;
use kernel_task::Pid;

/// The privileged processor operations the scheduler needs besides paging.
pub trait Cpu {
    /// Address of the common trap-exit path, which pops a [`TrapFrame`] and
    /// returns with `iret`.
    ///
    /// [`TrapFrame`]: crate::TrapFrame
    fn trap_return(&self) -> VirtualAddress;

    /// Sets the stack the processor loads on entry from user mode (`TSS.esp0`).
    fn set_kernel_stack(&mut self, top: VirtualAddress);

    /// Saves the callee-saved registers of `from` on its kernel stack, stores
    /// the resulting stack pointer in `save`, and resumes `to` from `resume`.
    ///
    /// # Safety
    /// `resume` must be a stack pointer produced by a previous switch away
    /// from `to`, or address a [`SwitchFrame`] laid out for it.
    ///
    /// [`SwitchFrame`]: crate::SwitchFrame
    unsafe fn switch_context(&mut self, from: Pid, save: &mut u32, to: Pid, resume: u32);

    /// Leaves the kernel through the trap frame at `frame`.
    ///
    /// # Safety
    /// `frame` must hold a valid [`TrapFrame`] on the current kernel stack and
    /// the address space it returns into must be loaded.
    ///
    /// [`TrapFrame`]: crate::TrapFrame
    unsafe fn return_to_user(&mut self, frame: VirtualAddress);
}
