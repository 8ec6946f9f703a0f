use lin86_mmu::PageFault;
use thiserror::Error;

/// Architectural exceptions raised while executing an instruction.
///
/// Every variant except [`Exception::Unsupported`] is delivered to the guest through its IDT or
/// IVT. `Unsupported` unwinds all the way to the host as [`EmulationError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DB debug")]
    Debug,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS ({0:#x})")]
    InvalidTss(u16),
    #[error("#NP segment not present ({0:#x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack fault ({0:#x})")]
    StackFault(u16),
    #[error("#GP general protection ({0:#x})")]
    GeneralProtection(u16),
    #[error("#PF page fault at {addr:#010x} (error code {error_code:#x})")]
    PageFault { addr: u32, error_code: u32 },
    #[error("#AC alignment check")]
    AlignmentCheck,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl Exception {
    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::AlignmentCheck => 17,
            Exception::Unsupported(_) => 0xFF,
        }
    }

    /// Error code pushed with the exception frame, for the vectors that carry one.
    pub fn error_code(self) -> Option<u32> {
        match self {
            Exception::DoubleFault | Exception::AlignmentCheck => Some(0),
            Exception::InvalidTss(sel)
            | Exception::SegmentNotPresent(sel)
            | Exception::StackFault(sel)
            | Exception::GeneralProtection(sel) => Some(u32::from(sel)),
            Exception::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }
}

impl From<PageFault> for Exception {
    fn from(pf: PageFault) -> Self {
        Exception::PageFault {
            addr: pf.addr,
            error_code: pf.error_code,
        }
    }
}

/// Vectors whose frames carry an error code when raised as faults.
pub(crate) fn vector_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
}

/// Host-fatal conditions. These end the emulation session instead of being delivered to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulationError {
    #[error("triple fault: could not deliver #DF after {first} / {second}")]
    TripleFault { first: Exception, second: Exception },
    #[error("unsupported guest operation: {0}")]
    Unsupported(&'static str),
}
