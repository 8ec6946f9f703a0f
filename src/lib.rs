//! lin86: a 32-bit x86 emulator core.
//!
//! This crate only re-exports the workspace members so hosts can depend on a single package:
//! [`mem`] for guest RAM, [`mmu`] for paging and the TLB, and [`cpu`] for the interpreter.

pub use lin86_cpu_core as cpu;
pub use lin86_mem as mem;
pub use lin86_mmu as mmu;

pub use lin86_cpu_core::{
    Cpu, CpuConfig, EmulationError, Exception, ExitStatus, InterruptController, IoPortBus,
    PortIoDevice,
};
