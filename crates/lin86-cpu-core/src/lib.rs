//! 32-bit x86 interpreter core.
//!
//! [`Cpu`] is the owned aggregate for an emulation session: register and segment state, the
//! address translation unit, guest RAM, the port I/O dispatch table and the hardware interrupt
//! line. The host drives it by calling [`Cpu::execute`] (or [`Cpu::run`]) with a cycle budget and
//! re-polling its peripherals between slices.

#![forbid(unsafe_code)]

mod config;
mod cpu;
mod exceptions;
mod exec;
pub mod flags;
mod interp;
mod interrupts;
pub mod io;
mod segmentation;
pub mod state;
mod transfer;

pub use config::{CpuConfig, CpuidPolicy, DEFAULT_MEM_SIZE, DEFAULT_SLICE_CYCLES};
pub use cpu::Cpu;
pub use exceptions::{EmulationError, Exception};
pub use exec::ExitStatus;
pub use interrupts::{InterruptController, IrqLine};
pub use io::{DeviceId, IoAccess, IoPortBus, IoSize, IoWidths, PortIoDevice, IO_SLOTS};
pub use state::{CpuState, DescriptorTable, SegReg, Segment};

pub use lin86_mem::PhysicalMemory;
pub use lin86_mmu::{AccessKind, Mmu, MmuStats};
