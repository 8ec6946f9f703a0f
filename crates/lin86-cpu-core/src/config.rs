/// Cycle budget per `Cpu::execute` slice used by `Cpu::run` and the native runner.
pub const DEFAULT_SLICE_CYCLES: u64 = 100_000;

pub const DEFAULT_MEM_SIZE: usize = 32 * 1024 * 1024;

pub const CPUID_FEAT_EDX_TSC: u32 = 1 << 4;
pub const CPUID_FEAT_EDX_PSE: u32 = 1 << 3;
pub const CPUID_FEAT_EDX_CX8: u32 = 1 << 8;

/// What CPUID reports. The default describes an FPU-less 486-class part with TSC, CX8 and 4 MiB
/// pages, which keeps the guest from probing for features this core does not execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuidPolicy {
    pub vendor: [u8; 12],
    pub family: u8,
    pub model: u8,
    pub stepping: u8,
    pub features_edx: u32,
    pub features_ecx: u32,
}

impl Default for CpuidPolicy {
    fn default() -> Self {
        Self {
            vendor: *b"GenuineIntel",
            family: 5,
            model: 4,
            stepping: 3,
            features_edx: CPUID_FEAT_EDX_TSC | CPUID_FEAT_EDX_PSE | CPUID_FEAT_EDX_CX8,
            features_ecx: 0,
        }
    }
}

impl CpuidPolicy {
    /// EAX for leaf 1: stepping | model << 4 | family << 8.
    pub fn signature(&self) -> u32 {
        u32::from(self.stepping & 0xF)
            | (u32::from(self.model & 0xF) << 4)
            | (u32::from(self.family & 0xF) << 8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Guest RAM size in bytes; must be a non-zero multiple of 4 KiB.
    pub mem_size: usize,
    pub cpuid: CpuidPolicy,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            mem_size: DEFAULT_MEM_SIZE,
            cpuid: CpuidPolicy::default(),
        }
    }
}

impl CpuConfig {
    pub fn with_mem_size(mem_size: usize) -> Self {
        Self {
            mem_size,
            ..Self::default()
        }
    }
}
