use bitfield_struct::bitfield;

/// Page-fault error code layout (i386).
///
/// The CPU pushes this word before entering the page-fault handler; the
/// faulting linear address is in CR2. Each bit describes the condition that
/// caused the fault.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by a reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    #[bits(28)]
    __: u32,
}

impl PageFaultError {
    /// The error code the CPU would report for `access` on a page whose
    /// presence is `present`.
    #[must_use]
    pub const fn for_access(access: Access, present: bool) -> Self {
        Self::new()
            .with_present(present)
            .with_write(access.write)
            .with_user(access.user)
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (not mapped yet)"
        } else if self.write() {
            if self.user() {
                "User-mode write to protected page (read-only or copy-on-write)"
            } else {
                "Kernel write to protected page (copy-on-write)"
            }
        } else if self.user() {
            "User-mode read of supervisor page"
        } else {
            "Read access to protected page"
        }
    }
}

/// The kind of access being checked against the page tables.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
}

impl Access {
    pub const USER_READ: Self = Self {
        write: false,
        user: true,
    };
    pub const USER_WRITE: Self = Self {
        write: true,
        user: true,
    };
    pub const KERNEL_READ: Self = Self {
        write: false,
        user: false,
    };
    pub const KERNEL_WRITE: Self = Self {
        write: true,
        user: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        assert_eq!(PageFaultError::for_access(Access::KERNEL_READ, false).into_bits(), 0);
        assert_eq!(PageFaultError::for_access(Access::USER_WRITE, true).into_bits(), 0b111);
        assert_eq!(PageFaultError::for_access(Access::USER_READ, false).into_bits(), 0b100);
    }

    #[test]
    fn explanations() {
        let e = PageFaultError::for_access(Access::USER_WRITE, false);
        assert!(e.explain().starts_with("Non-present"));
        let e = PageFaultError::for_access(Access::KERNEL_WRITE, true);
        assert!(e.explain().contains("copy-on-write"));
    }
}
