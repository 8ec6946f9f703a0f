use thiserror::Error;

use crate::MemoryBus;

pub const PAGE_SIZE: usize = 4096;

/// Errors returned when the host populates guest memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("guest memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}")]
    OutOfRange { paddr: u32, len: usize, size: usize },
    #[error("guest memory size 0x{size:x} is not a non-zero multiple of the page size")]
    InvalidSize { size: usize },
}

/// Flat, fixed-size guest RAM.
///
/// Guest accesses outside the buffer behave like an unpopulated bus: reads return all-ones and
/// writes are dropped. Host-side loading through [`PhysicalMemory::load`] is checked instead.
pub struct PhysicalMemory {
    data: Vec<u8>,
}

impl PhysicalMemory {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 || size % PAGE_SIZE != 0 || size as u64 > u64::from(u32::MAX) + 1 {
            return Err(MemoryError::InvalidSize { size });
        }
        Ok(Self {
            data: vec![0; size],
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copies a raw image into guest memory at an absolute physical address.
    pub fn load(&mut self, paddr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.checked_range(paddr, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn slice(&self, paddr: u32, len: usize) -> Result<&[u8], MemoryError> {
        let range = self.checked_range(paddr, len)?;
        Ok(&self.data[range])
    }

    pub fn slice_mut(&mut self, paddr: u32, len: usize) -> Result<&mut [u8], MemoryError> {
        let range = self.checked_range(paddr, len)?;
        Ok(&mut self.data[range])
    }

    fn checked_range(&self, paddr: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = paddr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfRange {
                paddr,
                len,
                size: self.data.len(),
            }),
        }
    }

    #[inline]
    pub fn read_u8(&self, paddr: u32) -> u8 {
        self.data.get(paddr as usize).copied().unwrap_or(0xFF)
    }

    #[inline]
    pub fn read_u16(&self, paddr: u32) -> u16 {
        let p = paddr as usize;
        match self.data.get(p..p.wrapping_add(2)) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr.wrapping_add(1))]),
        }
    }

    #[inline]
    pub fn read_u32(&self, paddr: u32) -> u32 {
        let p = paddr as usize;
        match self.data.get(p..p.wrapping_add(4)) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => {
                u32::from(self.read_u16(paddr)) | (u32::from(self.read_u16(paddr.wrapping_add(2))) << 16)
            }
        }
    }

    #[inline]
    pub fn write_u8(&mut self, paddr: u32, val: u8) {
        if let Some(b) = self.data.get_mut(paddr as usize) {
            *b = val;
        }
    }

    #[inline]
    pub fn write_u16(&mut self, paddr: u32, val: u16) {
        let p = paddr as usize;
        match self.data.get_mut(p..p.wrapping_add(2)) {
            Some(b) => b.copy_from_slice(&val.to_le_bytes()),
            None => {
                let [lo, hi] = val.to_le_bytes();
                self.write_u8(paddr, lo);
                self.write_u8(paddr.wrapping_add(1), hi);
            }
        }
    }

    #[inline]
    pub fn write_u32(&mut self, paddr: u32, val: u32) {
        let p = paddr as usize;
        match self.data.get_mut(p..p.wrapping_add(4)) {
            Some(b) => b.copy_from_slice(&val.to_le_bytes()),
            None => {
                self.write_u16(paddr, val as u16);
                self.write_u16(paddr.wrapping_add(2), (val >> 16) as u16);
            }
        }
    }
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("size", &self.data.len())
            .finish()
    }
}

impl MemoryBus for PhysicalMemory {
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = PhysicalMemory::read_u8(self, paddr.wrapping_add(i as u32));
        }
    }

    fn write_physical(&mut self, paddr: u32, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            PhysicalMemory::write_u8(self, paddr.wrapping_add(i as u32), *b);
        }
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        PhysicalMemory::read_u32(self, paddr)
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        PhysicalMemory::write_u32(self, paddr, val)
    }
}
