//! A software machine for running the kernel on a development host.
//!
//! [`Hosted`] pairs the simulated MMU from `kernel-vmem` with a soft
//! interrupt flag, a CPU that records context switches instead of performing
//! them, and an in-memory file system. Tests drive the kernel through its
//! public entry points and inspect what the machine saw.

use crate::fs::{FileSystem, FsError};
use crate::{Cpu, Kernel, Machine, Platform};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SoftInterrupts;
use kernel_task::{FileRef, InodeRef, Pid};
use kernel_vmem::HostedMmu;

/// Default RAM size of a hosted machine (16 MiB).
pub const RAM: u32 = 0x0100_0000;

/// Where [`HostedCpu`] claims the trap-exit path lives.
pub const TRAP_RETURN: VirtualAddress = VirtualAddress::new(0x0010_0000);

pub struct Hosted;

impl Platform for Hosted {
    type Mmu = HostedMmu;
    type Interrupts = SoftInterrupts;
    type Cpu = HostedCpu;
    type Fs = MemoryFs;
}

/// A processor that records what the kernel asked of it.
///
/// A context switch only appends to [`switches`](Self::switches); the kernel
/// call that requested it returns right away with the new task current.
#[derive(Debug, Default)]
pub struct HostedCpu {
    kernel_stack: VirtualAddress,
    switches: Vec<(Pid, Pid)>,
    user_entries: Vec<VirtualAddress>,
}

impl HostedCpu {
    /// The last value written to `TSS.esp0`.
    #[must_use]
    pub const fn kernel_stack(&self) -> VirtualAddress {
        self.kernel_stack
    }

    /// Every context switch so far, as `(from, to)`.
    #[must_use]
    pub fn switches(&self) -> &[(Pid, Pid)] {
        &self.switches
    }

    /// Trap frames the kernel returned to user mode through.
    #[must_use]
    pub fn user_entries(&self) -> &[VirtualAddress] {
        &self.user_entries
    }
}

impl Cpu for HostedCpu {
    fn trap_return(&self) -> VirtualAddress {
        TRAP_RETURN
    }

    fn set_kernel_stack(&mut self, top: VirtualAddress) {
        self.kernel_stack = top;
    }

    unsafe fn switch_context(&mut self, from: Pid, _save: &mut u32, to: Pid, _resume: u32) {
        // No registers to push, so the saved stack pointer stays as it was.
        self.switches.push((from, to));
    }

    unsafe fn return_to_user(&mut self, frame: VirtualAddress) {
        self.user_entries.push(frame);
    }
}

#[derive(Debug)]
struct MemoryFile {
    data: Vec<u8>,
    pos: usize,
    refs: u32,
}

/// Reference-counted files and inodes kept in memory.
///
/// Closed files stay around with no references so tests can still look at
/// what was written to them.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: BTreeMap<u32, MemoryFile>,
    inodes: BTreeMap<u32, u32>,
}

impl MemoryFs {
    /// The root directory.
    pub const ROOT: InodeRef = InodeRef(1);

    /// Opens a new file holding `data`, with one reference and the position
    /// at the start.
    pub fn open(&mut self, data: &[u8]) -> FileRef {
        #[allow(clippy::cast_possible_truncation)]
        let id = self.files.len() as u32 + 1;
        self.files.insert(
            id,
            MemoryFile {
                data: data.to_vec(),
                pos: 0,
                refs: 1,
            },
        );
        FileRef(id)
    }

    /// What `file` holds now.
    #[must_use]
    pub fn contents(&self, file: FileRef) -> Option<&[u8]> {
        self.files.get(&file.0).map(|f| f.data.as_slice())
    }

    /// Open references to `file`.
    #[must_use]
    pub fn file_refs(&self, file: FileRef) -> u32 {
        self.files.get(&file.0).map_or(0, |f| f.refs)
    }

    /// References held on `inode`.
    #[must_use]
    pub fn inode_refs(&self, inode: InodeRef) -> u32 {
        self.inodes.get(&inode.0).copied().unwrap_or(0)
    }

    fn open_file(&mut self, file: FileRef) -> Result<&mut MemoryFile, FsError> {
        self.files
            .get_mut(&file.0)
            .filter(|f| f.refs > 0)
            .ok_or(FsError::BadFile)
    }
}

impl FileSystem for MemoryFs {
    fn read(&mut self, file: FileRef, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.open_file(file)?;
        let available = file.data.len().saturating_sub(file.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&file.data[file.pos..file.pos + n]);
        file.pos += n;
        Ok(n)
    }

    fn write(&mut self, file: FileRef, data: &[u8]) -> Result<usize, FsError> {
        let file = self.open_file(file)?;
        let end = file.pos + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[file.pos..end].copy_from_slice(data);
        file.pos = end;
        Ok(data.len())
    }

    fn lseek(&mut self, file: FileRef, offset: u32) -> Result<u32, FsError> {
        let file = self.open_file(file)?;
        file.pos = offset as usize;
        Ok(offset)
    }

    fn dup(&mut self, file: FileRef) {
        if let Some(file) = self.files.get_mut(&file.0) {
            file.refs += 1;
        }
    }

    fn close(&mut self, file: FileRef) {
        if let Some(open) = self.files.get_mut(&file.0) {
            assert!(open.refs > 0, "closing {file:?} with no references");
            open.refs -= 1;
        }
    }

    fn iget(&mut self, inode: InodeRef) -> InodeRef {
        *self.inodes.entry(inode.0).or_insert(0) += 1;
        inode
    }

    fn iput(&mut self, inode: InodeRef) {
        let refs = self.inodes.entry(inode.0).or_insert(0);
        assert!(*refs > 0, "releasing {inode:?} with no references");
        *refs -= 1;
    }

    fn root_inode(&mut self) -> InodeRef {
        self.iget(Self::ROOT)
    }
}

/// A hosted machine with `ram` bytes of RAM and interrupts enabled.
#[must_use]
pub fn machine(ram: u32) -> Machine<Hosted> {
    Machine {
        mmu: HostedMmu::new(ram),
        irq: SoftInterrupts::new(true),
        cpu: HostedCpu::default(),
        fs: MemoryFs::default(),
    }
}

/// The memory map a PC with `ram` bytes would report: conventional memory,
/// the BIOS hole, and everything above 1 MiB.
#[must_use]
pub fn memory_map(ram: u32) -> [MemoryRegion; 3] {
    [
        MemoryRegion::new(0, 0x9_F000, 1),
        MemoryRegion::new(0x9_F000, 0x6_1000, 2),
        MemoryRegion::new(0x10_0000, u64::from(ram) - 0x10_0000, 1),
    ]
}

/// A booted kernel on a hosted machine with `ram` bytes of RAM.
///
/// # Panics
/// If `ram` does not reach past the kernel window.
#[must_use]
pub fn boot(ram: u32) -> Kernel<Hosted> {
    // SAFETY: a fresh machine has paging off and nothing in its RAM.
    let kernel = unsafe { Kernel::boot(machine(ram), &memory_map(ram)) };
    kernel.unwrap_or_else(|err| panic!("hosted boot failed: {err}"))
}
