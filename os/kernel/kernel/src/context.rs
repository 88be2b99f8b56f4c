//! # Saved register frames on a task's kernel stack
//!
//! Every task owns one kernel page as its kernel stack. While the task is
//! switched out, the stack holds (from the top down) the [`TrapFrame`] pushed
//! when the task entered the kernel, and below it the [`SwitchFrame`] pushed
//! by the context switch. The task's saved stack pointer addresses the
//! switch frame.
//!
//! ```text
//! kernel_stack + 4096 ┌──────────────────────────┐
//!                     │ TrapFrame (user state)   │  ← user tasks only
//!                     ├──────────────────────────┤
//!                     │ SwitchFrame              │
//!  stack_pointer ───► └──────────────────────────┘
//! ```
//!
//! A new kernel task gets a switch frame whose return address is its entry
//! function. A forked child gets a copy of its parent's trap frame with `eax`
//! cleared and a switch frame returning into the common trap exit path, so
//! the child leaves its first switch as if it returned from `fork` with 0.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_registers::Eflags;
use kernel_vmem::Mmu;

/// Raw 16-bit segment selector.
///
/// ```text
///  15            3 2  1  0
/// +----------------+--+----+
/// |   Index[12:0]  |TI| RPL|
/// +----------------+--+----+
/// ```
#[bitfield(u16)]
#[derive(Eq, PartialEq)]
pub struct Selector {
    /// Requested privilege level.
    #[bits(2)]
    pub rpl: u8,
    /// Table indicator: LDT when set.
    pub ldt: bool,
    /// Descriptor index.
    #[bits(13)]
    pub index: u16,
}

impl Selector {
    pub const KERNEL_CODE: Self = Self::gdt(1, 0);
    pub const KERNEL_DATA: Self = Self::gdt(2, 0);
    pub const USER_CODE: Self = Self::gdt(4, 3);
    pub const USER_DATA: Self = Self::gdt(5, 3);

    #[must_use]
    pub const fn gdt(index: u16, rpl: u8) -> Self {
        Self::new().with_index(index).with_rpl(rpl)
    }
}

/// Registers preserved across a context switch, lowest address first.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SwitchFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    /// Where the switch returns to.
    pub eip: u32,
}

/// Registers pushed on entry to the kernel, lowest address first.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapFrame {
    pub vector: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Skipped by `popad`.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub vector0: u32,
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl SwitchFrame {
    pub const SIZE: u32 = 5 * 4;

    /// A frame whose switch returns to `eip`.
    #[must_use]
    pub const fn returning_to(eip: VirtualAddress) -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: eip.as_u32(),
        }
    }

    const fn words(&self) -> [u32; 5] {
        [self.edi, self.esi, self.ebx, self.ebp, self.eip]
    }

    pub fn write_to<M: Mmu>(&self, mmu: &mut M, at: VirtualAddress) {
        write_words(mmu, at, &self.words());
    }

    pub fn read_from<M: Mmu>(mmu: &M, at: VirtualAddress) -> Self {
        let [edi, esi, ebx, ebp, eip] = read_words(mmu, at);
        Self {
            edi,
            esi,
            ebx,
            ebp,
            eip,
        }
    }
}

impl TrapFrame {
    pub const SIZE: u32 = 20 * 4;

    /// The frame that enters user mode at `entry` with the stack at `stack`
    /// and interrupts enabled.
    #[must_use]
    pub fn user_entry(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        let data = u32::from(Selector::USER_DATA.into_bits());
        Self {
            gs: 0,
            fs: data,
            es: data,
            ds: data,
            eip: entry.as_u32(),
            cs: u32::from(Selector::USER_CODE.into_bits()),
            eflags: Eflags::new().with_if_interrupt_enable(true).into_bits(),
            esp: stack.as_u32(),
            ss: data,
            ..Self::default()
        }
    }

    const fn words(&self) -> [u32; 20] {
        [
            self.vector,
            self.edi,
            self.esi,
            self.ebp,
            self.esp_dummy,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.gs,
            self.fs,
            self.es,
            self.ds,
            self.vector0,
            self.error,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]
    }

    pub fn write_to<M: Mmu>(&self, mmu: &mut M, at: VirtualAddress) {
        write_words(mmu, at, &self.words());
    }

    pub fn read_from<M: Mmu>(mmu: &M, at: VirtualAddress) -> Self {
        let [
            vector,
            edi,
            esi,
            ebp,
            esp_dummy,
            ebx,
            edx,
            ecx,
            eax,
            gs,
            fs,
            es,
            ds,
            vector0,
            error,
            eip,
            cs,
            eflags,
            esp,
            ss,
        ] = read_words(mmu, at);
        Self {
            vector,
            edi,
            esi,
            ebp,
            esp_dummy,
            ebx,
            edx,
            ecx,
            eax,
            gs,
            fs,
            es,
            ds,
            vector0,
            error,
            eip,
            cs,
            eflags,
            esp,
            ss,
        }
    }
}

/// Where the trap frame of a task with kernel stack page `stack` lives.
pub(crate) fn trap_frame_addr(stack: VirtualAddress) -> VirtualAddress {
    stack + (PAGE_SIZE - TrapFrame::SIZE)
}

fn write_words<M: Mmu>(mmu: &mut M, at: VirtualAddress, words: &[u32]) {
    for (i, &word) in (0u32..).zip(words) {
        mmu.write_u32(at + i * 4, word);
    }
}

fn read_words<M: Mmu, const N: usize>(mmu: &M, at: VirtualAddress) -> [u32; N] {
    let mut words = [0; N];
    for (i, word) in (0u32..).zip(words.iter_mut()) {
        *word = mmu.read_u32(at + i * 4);
    }
    words
}

const _: () = {
    assert!(size_of::<SwitchFrame>() as u32 == SwitchFrame::SIZE);
    assert!(size_of::<TrapFrame>() as u32 == TrapFrame::SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_encode_index_and_privilege() {
        assert_eq!(Selector::KERNEL_CODE.into_bits(), 0x08);
        assert_eq!(Selector::KERNEL_DATA.into_bits(), 0x10);
        assert_eq!(Selector::USER_CODE.into_bits(), 0x23);
        assert_eq!(Selector::USER_DATA.into_bits(), 0x2B);
    }

    #[test]
    fn user_entry_frame() {
        let frame = TrapFrame::user_entry(
            VirtualAddress::new(0x0080_0000),
            VirtualAddress::new(0x0800_0000),
        );
        assert_eq!(frame.eip, 0x0080_0000);
        assert_eq!(frame.esp, 0x0800_0000);
        assert_eq!(frame.cs, 0x23);
        assert_eq!(frame.ss, 0x2B);
        assert_eq!(frame.eflags, 0x202);
        assert_eq!(frame.eax, 0);
    }
}
