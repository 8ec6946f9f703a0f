/// Abstraction for guest physical memory access.
///
/// The MMU performs page table walks by reading and writing guest physical memory. Reads take
/// `&mut self` so implementations may count or otherwise observe accesses.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u32, buf: &[u8]);

    fn read_u8(&mut self, paddr: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read_physical(paddr, &mut buf);
        buf[0]
    }

    fn read_u16(&mut self, paddr: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&mut self, paddr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u8(&mut self, paddr: u32, val: u8) {
        self.write_physical(paddr, &[val]);
    }

    fn write_u16(&mut self, paddr: u32, val: u16) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u32, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]) {
        <T as MemoryBus>::read_physical(&mut **self, paddr, buf)
    }

    #[inline]
    fn write_physical(&mut self, paddr: u32, buf: &[u8]) {
        <T as MemoryBus>::write_physical(&mut **self, paddr, buf)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u32) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u32, val: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, val)
    }
}
