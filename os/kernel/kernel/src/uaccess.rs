//! Copying between kernel buffers and the current task's memory.
//!
//! User memory is touched only after the page tables say the task itself may
//! make the access. Missing pages and copy-on-write pages are brought in
//! through the same rules as a real fault, so the copy never trips over a
//! mapping the task could have used.

use crate::error::SyscallError;
use crate::{Kernel, Platform};
use kernel_info::memory::{USER_EXEC_ADDR, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::{CriticalSection, IrqGuard};
use kernel_vmem::{Access, Mmu};

/// A write can fault twice: once to back the page, once to unshare it.
const MAX_FAULTS_PER_PAGE: usize = 2;

impl<P: Platform> Kernel<P> {
    /// Copies `data` to `va` in the current task's address space.
    ///
    /// # Errors
    /// [`SyscallError::Fault`] if any byte lies outside user space or the
    /// task could not write it.
    pub fn copy_to_user(&mut self, va: VirtualAddress, data: &[u8]) -> Result<(), SyscallError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        for (at, range) in user_chunks(va, data.len())? {
            self.fault_in(cs, at, Access::USER_WRITE)?;
            self.mmu.write_bytes(at, &data[range]);
        }
        Ok(())
    }

    /// Fills `buf` from `va` in the current task's address space.
    ///
    /// # Errors
    /// [`SyscallError::Fault`] if any byte lies outside user space or the
    /// task could not read it.
    pub fn copy_from_user(&mut self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), SyscallError> {
        let irq = self.irq.clone();
        let guard = IrqGuard::new(&irq);
        let cs = guard.token();
        for (at, range) in user_chunks(va, buf.len())? {
            self.fault_in(cs, at, Access::USER_READ)?;
            self.mmu.read_bytes(at, &mut buf[range]);
        }
        Ok(())
    }

    fn fault_in(&mut self, cs: CriticalSection<'_>, va: VirtualAddress, access: Access) -> Result<(), SyscallError> {
        for _ in 0..MAX_FAULTS_PER_PAGE {
            match self.address_space().check_access(va, access) {
                Ok(_) => return Ok(()),
                Err(error) => self
                    .resolve_fault(cs, va, error)
                    .map_err(|_| SyscallError::Fault)?,
            }
        }
        self.address_space()
            .check_access(va, access)
            .map(|_| ())
            .map_err(|_| SyscallError::Fault)
    }
}

/// Fails with [`SyscallError::Fault`] unless `[va, va + len)` lies in user
/// space.
pub(crate) fn check_user_range(va: VirtualAddress, len: usize) -> Result<(), SyscallError> {
    let len32 = u32::try_from(len).map_err(|_| SyscallError::Fault)?;
    let end = va.as_u32().checked_add(len32).ok_or(SyscallError::Fault)?;
    if len > 0 && (va < USER_EXEC_ADDR || end > USER_STACK_TOP.as_u32()) {
        return Err(SyscallError::Fault);
    }
    Ok(())
}

/// Splits `[va, va + len)` at page boundaries into `(address, buffer range)`
/// pairs.
fn user_chunks(
    va: VirtualAddress,
    len: usize,
) -> Result<impl Iterator<Item = (VirtualAddress, core::ops::Range<usize>)>, SyscallError> {
    check_user_range(va, len)?;

    let mut done = 0;
    Ok(core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let at = va + done as u32;
        let n = ((PAGE_SIZE - at.offset()) as usize).min(len - done);
        let range = done..done + n;
        done += n;
        Some((at, range))
    }))
}
