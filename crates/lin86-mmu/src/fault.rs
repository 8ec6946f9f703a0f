use crate::AccessKind;

pub const PF_ERR_PRESENT: u32 = 1 << 0;
pub const PF_ERR_WRITE: u32 = 1 << 1;
pub const PF_ERR_USER: u32 = 1 << 2;

/// A failed translation. The caller turns this into vector 14 with `error_code` pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    pub error_code: u32,
}

impl PageFault {
    pub fn not_present(addr: u32, access: AccessKind, user: bool) -> Self {
        Self {
            addr,
            error_code: Self::base_error_code(access, user),
        }
    }

    pub fn protection(addr: u32, access: AccessKind, user: bool) -> Self {
        Self {
            addr,
            error_code: Self::base_error_code(access, user) | PF_ERR_PRESENT,
        }
    }

    fn base_error_code(access: AccessKind, user: bool) -> u32 {
        let mut error_code = 0;
        if access == AccessKind::Write {
            error_code |= PF_ERR_WRITE;
        }
        if user {
            error_code |= PF_ERR_USER;
        }
        error_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        assert_eq!(PageFault::not_present(0x1234, AccessKind::Read, false).error_code, 0);
        assert_eq!(
            PageFault::not_present(0x1234, AccessKind::Write, true).error_code,
            PF_ERR_WRITE | PF_ERR_USER
        );
        let pf = PageFault::protection(0xdead_b000, AccessKind::Write, false);
        assert_eq!(pf.addr, 0xdead_b000);
        assert_eq!(pf.error_code, PF_ERR_PRESENT | PF_ERR_WRITE);
    }
}
