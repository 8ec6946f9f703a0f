#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use lin86_cpu_core::{Cpu, CpuConfig, PortIoDevice};

pub const GDT_BASE: u32 = 0x800;
pub const TSS_BASE: u32 = 0x900;
pub const IDT_BASE: u32 = 0x1000;
pub const KERNEL_CODE: u32 = 0x2000;
pub const USER_CODE: u32 = 0x3000;
pub const USER_STACK: u32 = 0x7000;
pub const KERNEL_STACK: u32 = 0x9000;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1B;
pub const USER_DS: u16 = 0x23;
pub const TSS_SEL: u16 = 0x28;

pub fn cpu_with_mem(size: usize) -> Cpu {
    Cpu::new(CpuConfig::with_mem_size(size)).unwrap()
}

/// Real-mode CPU with `code` at 0000:7C00 and SP = 0x1000.
pub fn real_mode(code: &[u8]) -> Cpu {
    let mut cpu = cpu_with_mem(1 << 20);
    cpu.mem.load(0x7C00, code).unwrap();
    cpu.set_real_mode_entry(0, 0x7C00);
    cpu.state.regs[lin86_cpu_core::state::ESP] = 0x1000;
    cpu
}

/// Flat 32-bit protected-mode CPU with `code` at 0x1000 and ESP = 0x8000.
pub fn flat(code: &[u8]) -> Cpu {
    let mut cpu = cpu_with_mem(1 << 20);
    cpu.mem.load(0x1000, code).unwrap();
    cpu.set_flat_protected_mode(0x1000);
    cpu.state.regs[lin86_cpu_core::state::ESP] = 0x8000;
    cpu
}

/// Real-mode IVT entry.
pub fn set_ivt(cpu: &mut Cpu, vector: u8, seg: u16, off: u16) {
    let addr = u32::from(vector) * 4;
    cpu.mem.write_u16(addr, off);
    cpu.mem.write_u16(addr + 2, seg);
}

pub fn segment_descriptor(base: u32, limit: u32, access: u8) -> u64 {
    let limit = limit >> 12;
    (u64::from(limit) & 0xFFFF)
        | ((u64::from(base) & 0xFF_FFFF) << 16)
        | (u64::from(access) << 40)
        | ((u64::from(limit) >> 16 & 0xF) << 48)
        | (0xC << 52)
        | ((u64::from(base) >> 24) << 56)
}

pub fn tss_descriptor(base: u32, limit: u32) -> u64 {
    (u64::from(limit) & 0xFFFF)
        | ((u64::from(base) & 0xFF_FFFF) << 16)
        | (0x89 << 40)
        | ((u64::from(base) >> 24) << 56)
}

pub fn write_gdt(cpu: &mut Cpu, entries: &[u64]) {
    for (i, e) in entries.iter().enumerate() {
        let addr = GDT_BASE + i as u32 * 8;
        cpu.mem.write_u32(addr, *e as u32);
        cpu.mem.write_u32(addr + 4, (*e >> 32) as u32);
    }
    cpu.state.gdt.base = GDT_BASE;
    cpu.state.gdt.limit = (entries.len() * 8 - 1) as u16;
}

/// 32-bit interrupt (`trap == false`) or trap gate to `KERNEL_CS:offset`.
pub fn set_gate(cpu: &mut Cpu, vector: u8, offset: u32, dpl: u32, trap: bool) {
    let addr = IDT_BASE + u32::from(vector) * 8;
    let kind = if trap { 0x8F00 } else { 0x8E00 };
    cpu.mem
        .write_u32(addr, (offset & 0xFFFF) | (u32::from(KERNEL_CS) << 16));
    cpu.mem
        .write_u32(addr + 4, (offset & 0xFFFF_0000) | kind | (dpl << 13));
}

/// Protected-mode machine with the standard kernel/user GDT, a TSS holding the ring-0 stack and an
/// empty 256-entry IDT. Execution starts at `KERNEL_CODE` in flat ring 0.
pub fn protected_machine() -> Cpu {
    let mut cpu = cpu_with_mem(1 << 20);
    write_gdt(
        &mut cpu,
        &[
            0,
            segment_descriptor(0, 0xFFFF_FFFF, 0x9A),
            segment_descriptor(0, 0xFFFF_FFFF, 0x92),
            segment_descriptor(0, 0xFFFF_FFFF, 0xFA),
            segment_descriptor(0, 0xFFFF_FFFF, 0xF2),
            tss_descriptor(TSS_BASE, 0x67),
        ],
    );
    cpu.mem.write_u32(TSS_BASE + 4, KERNEL_STACK);
    cpu.mem.write_u16(TSS_BASE + 8, KERNEL_DS);
    cpu.state.idt.base = IDT_BASE;
    cpu.state.idt.limit = 256 * 8 - 1;
    cpu.set_flat_protected_mode(KERNEL_CODE);
    cpu.state.regs[lin86_cpu_core::state::ESP] = KERNEL_STACK;
    cpu
}

/// Kernel prologue: `ltr 0x28`, then IRET to `USER_CS:USER_CODE` on the user stack with `eflags`.
pub fn enter_user_mode_code(eflags: u32) -> Vec<u8> {
    let mut code = vec![
        0x66, 0xB8, TSS_SEL as u8, 0x00, // mov ax, TSS_SEL
        0x0F, 0x00, 0xD8, // ltr ax
        0x6A, USER_DS as u8, // push USER_DS
        0x68, // push USER_STACK
    ];
    code.extend_from_slice(&USER_STACK.to_le_bytes());
    code.push(0x68); // push eflags
    code.extend_from_slice(&eflags.to_le_bytes());
    code.extend_from_slice(&[0x6A, USER_CS as u8]); // push USER_CS
    code.push(0x68); // push USER_CODE
    code.extend_from_slice(&USER_CODE.to_le_bytes());
    code.push(0xCF); // iret
    code
}

/// Port device that records every write and answers reads with a fixed value.
#[derive(Clone, Default)]
pub struct PortRecorder {
    pub writes: Rc<RefCell<Vec<(u16, u8, u32)>>>,
    pub read_value: u32,
}

impl PortIoDevice for PortRecorder {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        self.read_value
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        self.writes.borrow_mut().push((port, size, value));
    }
}
