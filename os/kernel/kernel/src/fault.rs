//! The page-fault handler: demand paging and copy-on-write.

use crate::mm::protect;
use crate::{Kernel, Platform};
use kernel_alloc::Frame;
use kernel_info::memory::{USER_EXEC_ADDR, USER_STACK_BOTTOM, USER_STACK_TOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{CriticalSection, IrqGuard};
use kernel_vmem::{PageEntry, PageFaultError};
use log::{error, trace, warn};

/// What became of the task that faulted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The mapping was fixed; the faulting instruction can be retried.
    Resolved,
    /// The task was killed with status -1 and another one runs now.
    Terminated,
}

/// Why a fault could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Unresolved {
    /// The task touched memory it has no business with.
    Segfault,
    /// The fault contradicts the kernel's own bookkeeping.
    Fatal,
}

impl<P: Platform> Kernel<P> {
    /// Handles a page fault of the current task at `va` (CR2).
    ///
    /// Write faults on present pages break copy-on-write sharing. Faults on
    /// absent pages below the heap break, in the stack region, or inside a
    /// reserved mmap range are backed with a zeroed frame. A user task that
    /// faults outside user space is terminated.
    ///
    /// # Panics
    /// If a kernel task faults, or a user fault inside user space matches
    /// none of the rules above.
    pub fn page_fault(&mut self, va: VirtualAddress, error: PageFaultError) -> FaultOutcome {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();

        match self.resolve_fault(cs, va, error) {
            Ok(()) => FaultOutcome::Resolved,
            Err(Unresolved::Segfault) => {
                let task = self.current_task();
                warn!(
                    "segmentation fault: task {} ({}) at {va}: {}",
                    task.pid,
                    task.name,
                    error.explain()
                );
                self.exit(-1);
                FaultOutcome::Terminated
            }
            Err(Unresolved::Fatal) => {
                let task = self.current_task();
                error!("unhandled page fault: {}", error.explain());
                panic!(
                    "task {} ({}) brk {} page fault at {va}",
                    task.pid, task.name, task.layout.brk
                );
            }
        }
    }

    /// Applies the fault rules for the current task without acting on a
    /// failure.
    pub(crate) fn resolve_fault(
        &mut self,
        cs: CriticalSection<'_>,
        va: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), Unresolved> {
        let task = self.current_task();
        let in_user_space = USER_EXEC_ADDR <= va && va < USER_STACK_TOP;
        if !task.is_user() {
            return Err(Unresolved::Fatal);
        }
        if !in_user_space {
            return Err(Unresolved::Segfault);
        }

        let page = va.align_down();
        if error.present() {
            return if error.write() {
                self.copy_on_write(cs, page)
            } else {
                Err(Unresolved::Fatal)
            };
        }

        let reserved = task.vmap.as_ref().is_some_and(|vmap| {
            let index = page.page().index();
            vmap.contains(index) && vmap.test(index)
        });
        if !(va < task.layout.brk || va >= USER_STACK_BOTTOM || reserved) {
            return Err(Unresolved::Fatal);
        }

        let region = task.region_at(page).copied();
        let mut space = self.address_space();
        space.link_page(cs, page);
        if let Some(region) = region {
            space.get_entry(cs, page, false).update(|entry| protect(entry, &region));
        }
        trace!("demand page {page}");
        Ok(())
    }

    /// Gives the current task a private, writable copy of `page`.
    fn copy_on_write(&mut self, cs: CriticalSection<'_>, page: VirtualAddress) -> Result<(), Unresolved> {
        let Some(entry) = self.address_space().entry(page).filter(PageEntry::present) else {
            return Err(Unresolved::Fatal);
        };
        if entry.is_write_protected() {
            return Err(Unresolved::Segfault);
        }
        if entry.shared() {
            // Shared pages are never write-protected.
            return Err(Unresolved::Fatal);
        }

        let frame = entry.frame();
        if self.frames.ref_count(frame) == 1 {
            self.address_space()
                .get_entry(cs, page, false)
                .update(|entry| entry.set_writable(true));
            trace!("cow {page}: last owner of {frame}");
            return Ok(());
        }

        let copy = self.frames.alloc(cs).into_page();
        let mut space = self.address_space();
        space.copy_page_to_frame(page.page(), copy);
        space
            .get_entry(cs, page, false)
            .set(entry.with_frame(copy).with_writable(true));
        // SAFETY: the entry now maps the copy; this was its reference.
        let old = unsafe { Frame::from_mapping(frame) };
        let remaining = self.frames.release(cs, old);
        trace!("cow {page}: {frame} -> {copy}, {remaining} refs left");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{self, Hosted};
    use kernel_memory_addresses::PAGE_SIZE;
    use kernel_task::TaskState;
    use kernel_vmem::{Access, HostedMmu};

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0080_0000);

    fn user_kernel() -> Kernel<Hosted> {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.task_create("init", 5, 1000, ENTRY);
        kernel.schedule();
        kernel.enter_user_mode(ENTRY);
        kernel
    }

    fn not_present(access: Access) -> PageFaultError {
        PageFaultError::for_access(access, false)
    }

    fn probe(kernel: &Kernel<Hosted>, va: VirtualAddress, access: Access) -> bool {
        HostedMmu::probe(kernel.mmu(), va, access).is_ok()
    }

    #[test]
    fn stack_pages_are_demand_paged() {
        let mut kernel = user_kernel();
        let va = VirtualAddress::new(USER_STACK_TOP.as_u32() - 4);
        let used = kernel.frames().used_frames();
        assert_eq!(kernel.page_fault(va, not_present(Access::USER_WRITE)), FaultOutcome::Resolved);
        // One table and one page.
        assert_eq!(kernel.frames().used_frames(), used + 2);
        assert!(probe(&kernel, va, Access::USER_WRITE));
    }

    #[test]
    fn heap_pages_below_brk_are_demand_paged() {
        let mut kernel = user_kernel();
        let end = VirtualAddress::new(0x0090_0000);
        kernel.set_image_layout(ENTRY, ENTRY, end);
        kernel.sys_brk(end + 2 * PAGE_SIZE).unwrap();
        let va = end + PAGE_SIZE + 12;
        assert_eq!(kernel.page_fault(va, not_present(Access::USER_READ)), FaultOutcome::Resolved);
        assert!(probe(&kernel, va, Access::USER_READ));
    }

    #[test]
    fn write_to_a_sole_owner_page_just_unprotects_it() {
        let mut kernel = user_kernel();
        let va = USER_STACK_BOTTOM;
        kernel.page_fault(va, not_present(Access::USER_WRITE));
        let irq = kernel.interrupts().clone();
        let guard = IrqGuard::new(&irq);
        kernel
            .address_space()
            .get_entry(guard.token(), va, false)
            .update(|e| e.set_writable(false));
        drop(guard);

        let frame = kernel.address_space().entry(va).unwrap().frame();
        let used = kernel.frames().used_frames();
        let err = PageFaultError::for_access(Access::USER_WRITE, true);
        assert_eq!(kernel.page_fault(va, err), FaultOutcome::Resolved);
        assert_eq!(kernel.frames().used_frames(), used);
        assert_eq!(kernel.address_space().entry(va).unwrap().frame(), frame);
        assert!(probe(&kernel, va, Access::USER_WRITE));
    }

    #[test]
    fn fault_outside_user_space_kills_the_task() {
        let mut kernel = user_kernel();
        let pid = kernel.current();
        let va = VirtualAddress::new(0x0010_0000);
        let outcome = kernel.page_fault(va, not_present(Access::USER_READ));
        assert_eq!(outcome, FaultOutcome::Terminated);
        let task = kernel.tasks().task(pid);
        assert_eq!(task.state, TaskState::Died);
        assert_eq!(task.status, -1);
        assert_ne!(kernel.current(), pid);
    }

    #[test]
    fn resolving_alone_does_not_kill() {
        let mut kernel = user_kernel();
        let pid = kernel.current();
        let irq = kernel.interrupts().clone();
        let guard = IrqGuard::new(&irq);
        assert_eq!(
            kernel.resolve_fault(guard.token(), VirtualAddress::new(0x10), not_present(Access::USER_READ)),
            Err(Unresolved::Segfault)
        );
        drop(guard);
        assert_eq!(kernel.current(), pid);
    }

    #[test]
    #[should_panic(expected = "page fault at")]
    fn unreserved_user_address_is_fatal() {
        let mut kernel = user_kernel();
        kernel.page_fault(VirtualAddress::new(0x0500_0000), not_present(Access::USER_READ));
    }

    #[test]
    #[should_panic(expected = "page fault at")]
    fn kernel_task_faults_are_fatal() {
        let mut kernel = hosted::boot(hosted::RAM);
        kernel.page_fault(USER_STACK_BOTTOM, not_present(Access::KERNEL_READ));
    }
}
