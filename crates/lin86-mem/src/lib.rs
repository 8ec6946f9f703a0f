//! Guest physical memory.
//!
//! [`PhysicalMemory`] is the flat RAM buffer the guest sees. [`MemoryBus`] is the narrow interface
//! the address translation unit uses to read and update page tables, so the walker can be tested
//! against instrumented buses.

mod bus;
mod phys;

pub use bus::MemoryBus;
pub use phys::{MemoryError, PhysicalMemory, PAGE_SIZE};
