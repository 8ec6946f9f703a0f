//! Port I/O dispatch.
//!
//! Each direction has a 1024-slot table per access width. Ports alias modulo 1024, which covers
//! every legacy PC port the guest touches. Unclaimed reads float high and unclaimed writes are
//! dropped. A word or dword access with no handler at that width is split into two narrower
//! accesses, bottoming out at bytes.

use bitflags::bitflags;

pub const IO_SLOTS: usize = 1024;

pub trait PortIoDevice {
    /// `size` is 1, 2 or 4.
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IoWidths: u8 {
        const BYTE = 1 << 0;
        const WORD = 1 << 1;
        const DWORD = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IoAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Access width of one port instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSize {
    Byte,
    Word,
    Dword,
}

impl IoSize {
    pub fn bytes(self) -> u8 {
        match self {
            IoSize::Byte => 1,
            IoSize::Word => 2,
            IoSize::Dword => 4,
        }
    }

    fn slot_table(self) -> usize {
        match self {
            IoSize::Byte => 0,
            IoSize::Word => 1,
            IoSize::Dword => 2,
        }
    }

    fn all_ones(self) -> u32 {
        match self {
            IoSize::Byte => 0xFF,
            IoSize::Word => 0xFFFF,
            IoSize::Dword => 0xFFFF_FFFF,
        }
    }
}

/// Handle to a device owned by an [`IoPortBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

type SlotTable = Box<[Option<DeviceId>]>;

pub struct IoPortBus {
    devices: Vec<Box<dyn PortIoDevice>>,
    read_slots: [SlotTable; 3],
    write_slots: [SlotTable; 3],
}

fn empty_table() -> SlotTable {
    vec![None; IO_SLOTS].into_boxed_slice()
}

impl IoPortBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            read_slots: [empty_table(), empty_table(), empty_table()],
            write_slots: [empty_table(), empty_table(), empty_table()],
        }
    }

    /// Takes ownership of `device` and routes `len` ports starting at `start` to it.
    ///
    /// Later registrations overwrite earlier ones slot by slot.
    pub fn register(
        &mut self,
        start: u16,
        len: u16,
        widths: IoWidths,
        access: IoAccess,
        device: Box<dyn PortIoDevice>,
    ) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(device);
        self.map(start, len, widths, access, id);
        id
    }

    /// Routes an additional port range to an already registered device.
    pub fn map(&mut self, start: u16, len: u16, widths: IoWidths, access: IoAccess, id: DeviceId) {
        for (size, flag) in [
            (IoSize::Byte, IoWidths::BYTE),
            (IoSize::Word, IoWidths::WORD),
            (IoSize::Dword, IoWidths::DWORD),
        ] {
            if !widths.contains(flag) {
                continue;
            }
            let table = size.slot_table();
            for offset in 0..len {
                let slot = usize::from(start.wrapping_add(offset)) % IO_SLOTS;
                if access.contains(IoAccess::READ) {
                    self.read_slots[table][slot] = Some(id);
                }
                if access.contains(IoAccess::WRITE) {
                    self.write_slots[table][slot] = Some(id);
                }
            }
        }
    }

    pub fn read(&mut self, port: u16, size: IoSize) -> u32 {
        let slot = usize::from(port) % IO_SLOTS;
        if let Some(DeviceId(idx)) = self.read_slots[size.slot_table()][slot] {
            if let Some(dev) = self.devices.get_mut(idx) {
                return dev.read(port, size.bytes()) & size.all_ones();
            }
        }
        match size {
            IoSize::Byte => size.all_ones(),
            IoSize::Word => {
                self.read(port, IoSize::Byte) | (self.read(port.wrapping_add(1), IoSize::Byte) << 8)
            }
            IoSize::Dword => {
                self.read(port, IoSize::Word) | (self.read(port.wrapping_add(2), IoSize::Word) << 16)
            }
        }
    }

    pub fn write(&mut self, port: u16, size: IoSize, value: u32) {
        let slot = usize::from(port) % IO_SLOTS;
        if let Some(DeviceId(idx)) = self.write_slots[size.slot_table()][slot] {
            if let Some(dev) = self.devices.get_mut(idx) {
                dev.write(port, size.bytes(), value & size.all_ones());
                return;
            }
        }
        match size {
            IoSize::Byte => {}
            IoSize::Word => {
                self.write(port, IoSize::Byte, value & 0xFF);
                self.write(port.wrapping_add(1), IoSize::Byte, (value >> 8) & 0xFF);
            }
            IoSize::Dword => {
                self.write(port, IoSize::Word, value & 0xFFFF);
                self.write(port.wrapping_add(2), IoSize::Word, value >> 16);
            }
        }
    }

    pub fn reset(&mut self) {
        for dev in &mut self.devices {
            dev.reset();
        }
    }
}

impl Default for IoPortBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoPortBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPortBus")
            .field("devices", &self.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        reads: Vec<(u16, u8)>,
        writes: Vec<(u16, u8, u32)>,
    }

    struct Recorder {
        log: Rc<RefCell<Log>>,
        value: u32,
    }

    impl PortIoDevice for Recorder {
        fn read(&mut self, port: u16, size: u8) -> u32 {
            self.log.borrow_mut().reads.push((port, size));
            self.value.wrapping_add(u32::from(port))
        }

        fn write(&mut self, port: u16, size: u8, value: u32) {
            self.log.borrow_mut().writes.push((port, size, value));
        }
    }

    fn recorder(value: u32) -> (Rc<RefCell<Log>>, Box<dyn PortIoDevice>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let dev = Recorder {
            log: log.clone(),
            value,
        };
        (log, Box::new(dev))
    }

    #[test]
    fn unclaimed_ports_float_high() {
        let mut bus = IoPortBus::new();
        assert_eq!(bus.read(0x3F8, IoSize::Byte), 0xFF);
        assert_eq!(bus.read(0x3F8, IoSize::Word), 0xFFFF);
        assert_eq!(bus.read(0x3F8, IoSize::Dword), 0xFFFF_FFFF);
        bus.write(0x3F8, IoSize::Dword, 0x1234_5678);
    }

    #[test]
    fn word_access_splits_into_bytes_without_word_handler() {
        let mut bus = IoPortBus::new();
        let (log, dev) = recorder(0x10);
        bus.register(0x70, 2, IoWidths::BYTE, IoAccess::READ | IoAccess::WRITE, dev);

        // 0x10 + 0x70 = 0x80, 0x10 + 0x71 = 0x81.
        assert_eq!(bus.read(0x70, IoSize::Word), 0x8180);
        bus.write(0x70, IoSize::Word, 0xBEEF);
        let log = log.borrow();
        assert_eq!(log.reads, vec![(0x70, 1), (0x71, 1)]);
        assert_eq!(log.writes, vec![(0x70, 1, 0xEF), (0x71, 1, 0xBE)]);
    }

    #[test]
    fn dword_access_prefers_word_handlers() {
        let mut bus = IoPortBus::new();
        let (log, dev) = recorder(0);
        bus.register(0x1F0, 4, IoWidths::WORD, IoAccess::READ, dev);
        assert_eq!(bus.read(0x1F0, IoSize::Dword), 0x01F2_01F0);
        assert_eq!(log.borrow().reads, vec![(0x1F0, 2), (0x1F2, 2)]);
        // Byte reads at the same port are still unclaimed.
        assert_eq!(bus.read(0x1F0, IoSize::Byte), 0xFF);
    }

    #[test]
    fn later_registration_overwrites_and_directions_are_independent() {
        let mut bus = IoPortBus::new();
        let (first, dev1) = recorder(0);
        let (second, dev2) = recorder(0);
        bus.register(0x20, 2, IoWidths::BYTE, IoAccess::READ | IoAccess::WRITE, dev1);
        bus.register(0x21, 1, IoWidths::BYTE, IoAccess::WRITE, dev2);

        bus.write(0x20, IoSize::Byte, 1);
        bus.write(0x21, IoSize::Byte, 2);
        bus.read(0x21, IoSize::Byte);
        assert_eq!(first.borrow().writes, vec![(0x20, 1, 1)]);
        assert_eq!(first.borrow().reads, vec![(0x21, 1)]);
        assert_eq!(second.borrow().writes, vec![(0x21, 1, 2)]);
    }

    #[test]
    fn shared_device_across_ranges() {
        let mut bus = IoPortBus::new();
        let (log, dev) = recorder(0);
        let id = bus.register(0x20, 2, IoWidths::BYTE, IoAccess::WRITE, dev);
        bus.map(0xA0, 2, IoWidths::BYTE, IoAccess::WRITE, id);
        bus.write(0xA1, IoSize::Byte, 0xFF);
        assert_eq!(log.borrow().writes, vec![(0xA1, 1, 0xFF)]);
    }

    #[test]
    fn ports_alias_modulo_slot_count() {
        let mut bus = IoPortBus::new();
        let (log, dev) = recorder(0);
        bus.register(0x80, 1, IoWidths::BYTE, IoAccess::WRITE, dev);
        bus.write(0x480, IoSize::Byte, 7);
        assert_eq!(log.borrow().writes, vec![(0x480, 1, 7)]);
    }
}
