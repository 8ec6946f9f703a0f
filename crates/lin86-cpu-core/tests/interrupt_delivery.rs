mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::*;
use lin86_cpu_core::state::{EAX, ESP, FLAG_IF};
use lin86_cpu_core::{EmulationError, Exception, ExitStatus, InterruptController, SegReg};

struct FixedPic {
    vector: u8,
    acks: Rc<Cell<u32>>,
}

impl InterruptController for FixedPic {
    fn get_pending_vector(&mut self) -> u8 {
        self.acks.set(self.acks.get() + 1);
        self.vector
    }
}

/// Boots to ring 3 running `user` and returns the machine halted in a kernel handler.
fn run_user(user: &[u8], gates: &[(u8, u32, u32)], handlers: &[(u32, &[u8])]) -> lin86_cpu_core::Cpu {
    let mut cpu = protected_machine();
    cpu.mem.load(KERNEL_CODE, &enter_user_mode_code(0x2)).unwrap();
    cpu.mem.load(USER_CODE, user).unwrap();
    for &(vector, offset, dpl) in gates {
        set_gate(&mut cpu, vector, offset, dpl, false);
    }
    for &(addr, code) in handlers {
        cpu.mem.load(addr, code).unwrap();
    }
    assert_eq!(cpu.run(10_000).unwrap(), ExitStatus::Halted);
    cpu
}

#[test]
fn int_0x80_through_user_gate_switches_to_kernel_stack() {
    // user: int 0x80; kernel handler: mov eax, 0x80; hlt
    let cpu = run_user(
        &[0xCD, 0x80],
        &[(0x80, 0x2100, 3)],
        &[(0x2100, &[0xB8, 0x80, 0, 0, 0, 0xF4])],
    );

    assert_eq!(cpu.state.cpl, 0);
    assert_eq!(cpu.state.regs[EAX], 0x80);
    assert_eq!(cpu.state.seg(SegReg::Cs).selector, KERNEL_CS);
    assert_eq!(cpu.state.seg(SegReg::Ss).selector, KERNEL_DS);
    let esp = cpu.state.regs[ESP];
    assert_eq!(esp, KERNEL_STACK - 20);
    assert_eq!(cpu.mem.read_u32(esp), USER_CODE + 2);
    assert_eq!(cpu.mem.read_u32(esp + 4), u32::from(USER_CS));
    assert_eq!(cpu.mem.read_u32(esp + 8) & 0x3000, 0);
    assert_eq!(cpu.mem.read_u32(esp + 12), USER_STACK);
    assert_eq!(cpu.mem.read_u32(esp + 16), u32::from(USER_DS));
}

#[test]
fn int_0x80_through_kernel_only_gate_raises_gp() {
    // The #GP handler stores the error code in EAX and halts: pop eax; hlt
    let cpu = run_user(
        &[0xCD, 0x80],
        &[(0x80, 0x2100, 0), (13, 0x2200, 0)],
        &[(0x2100, &[0xF4]), (0x2200, &[0x58, 0xF4])],
    );

    assert_eq!(cpu.state.cpl, 0);
    assert_eq!(cpu.state.regs[EAX], 0x80 * 8 + 2);
    // The frame after the error code points back at the INT instruction.
    let esp = cpu.state.regs[ESP];
    assert_eq!(cpu.mem.read_u32(esp), USER_CODE);
}

#[test]
fn hlt_in_user_mode_is_a_general_protection_fault() {
    let cpu = run_user(&[0xF4], &[(13, 0x2200, 0)], &[(0x2200, &[0x58, 0xF4])]);
    assert_eq!(cpu.state.regs[EAX], 0);
    assert_eq!(cpu.mem.read_u32(cpu.state.regs[ESP]), USER_CODE);
}

#[test]
fn iret_returns_to_user_mode_after_syscall() {
    // user: int 0x80; mov ebx, eax; int 0x81
    // 0x80 handler: mov eax, 7; iretd. 0x81 handler: hlt.
    let cpu = run_user(
        &[0xCD, 0x80, 0x89, 0xC3, 0xCD, 0x81],
        &[(0x80, 0x2100, 3), (0x81, 0x2200, 3)],
        &[(0x2100, &[0xB8, 7, 0, 0, 0, 0xCF]), (0x2200, &[0xF4])],
    );
    assert_eq!(cpu.state.regs[lin86_cpu_core::state::EBX], 7);
    assert_eq!(cpu.mem.read_u32(cpu.state.regs[ESP]), USER_CODE + 6);
}

#[test]
fn hardware_interrupt_waits_out_the_sti_shadow() {
    // sti; nop; jmp $. IRQ handler at 0000:0600: mov al, 0x55; hlt
    let mut cpu = real_mode(&[0xFB, 0x90, 0xEB, 0xFE]);
    set_ivt(&mut cpu, 0x20, 0, 0x600);
    cpu.mem.load(0x600, &[0xB0, 0x55, 0xF4]).unwrap();
    let acks = Rc::new(Cell::new(0));
    cpu.set_interrupt_controller(Box::new(FixedPic {
        vector: 0x20,
        acks: acks.clone(),
    }));
    cpu.set_irq(true);

    assert_eq!(cpu.execute(100).unwrap(), ExitStatus::Continue);
    assert_eq!(acks.get(), 0);
    assert_eq!(cpu.execute(100).unwrap(), ExitStatus::Halted);
    assert_eq!(acks.get(), 1);
    assert_eq!(cpu.state.regs[EAX] & 0xFF, 0x55);
    // Exactly one instruction (the NOP) ran between STI and delivery.
    assert_eq!(cpu.mem.read_u16(0x1000 - 6), 0x7C02);
    assert_eq!(cpu.state.eflags & FLAG_IF, 0);
}

#[test]
fn masked_interrupt_line_is_not_acknowledged() {
    // cli; hlt
    let mut cpu = real_mode(&[0xFA, 0xF4]);
    let acks = Rc::new(Cell::new(0));
    cpu.set_interrupt_controller(Box::new(FixedPic {
        vector: 0x20,
        acks: acks.clone(),
    }));
    cpu.irq_line().set(true);
    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(acks.get(), 0);
}

#[test]
fn queued_interrupt_wakes_a_halted_cpu() {
    // sti; hlt; mov bl, 1; hlt. Handler at 0000:0600: mov al, 0x21; iret
    let mut cpu = real_mode(&[0xFB, 0xF4, 0xB3, 0x01, 0xF4]);
    set_ivt(&mut cpu, 0x21, 0, 0x600);
    cpu.mem.load(0x600, &[0xB0, 0x21, 0xCF]).unwrap();

    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert!(cpu.halted());
    assert_eq!(cpu.state.eip, 0x7C02);

    cpu.request_interrupt(0x21);
    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[EAX] & 0xFF, 0x21);
    assert_eq!(cpu.state.regs[lin86_cpu_core::state::EBX] & 0xFF, 1);
    assert_eq!(cpu.state.eip, 0x7C05);
}

#[test]
fn divide_error_frame_points_at_the_div() {
    // xor cx, cx; div cx. #DE handler: hlt
    let mut cpu = real_mode(&[0x31, 0xC9, 0xF7, 0xF1]);
    set_ivt(&mut cpu, 0, 0, 0x600);
    cpu.mem.load(0x600, &[0xF4]).unwrap();
    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.mem.read_u16(0x1000 - 6), 0x7C02);
}

#[test]
fn unreachable_idt_escalates_to_triple_fault() {
    // ud2 with an IDT too small to hold any gate.
    let mut cpu = flat(&[0x0F, 0x0B]);
    cpu.state.idt.limit = 0;
    assert_eq!(cpu.execute(100).unwrap(), ExitStatus::FaultPending);
    match cpu.execute(100) {
        Err(EmulationError::TripleFault { first, second }) => {
            assert_eq!(first, Exception::DoubleFault);
            assert_eq!(second, Exception::GeneralProtection(8 * 8 + 2));
        }
        other => panic!("expected triple fault, got {other:?}"),
    }
}

#[test]
fn task_gate_in_idt_is_unsupported() {
    // int 0x40 through a task gate.
    let mut cpu = protected_machine();
    cpu.mem.load(KERNEL_CODE, &[0xCD, 0x40]).unwrap();
    let addr = IDT_BASE + 0x40 * 8;
    cpu.mem.write_u32(addr, u32::from(TSS_SEL) << 16);
    cpu.mem.write_u32(addr + 4, 0x8500);
    assert!(matches!(
        cpu.run(100),
        Err(EmulationError::Unsupported(_))
    ));
}
