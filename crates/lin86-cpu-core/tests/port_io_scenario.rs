mod common;

use common::{real_mode, PortRecorder};
use lin86_cpu_core::state::EAX;
use lin86_cpu_core::{Cpu, CpuConfig, ExitStatus, IoAccess, IoWidths};

#[test]
fn mov_out_hlt_from_reset() {
    let mut cpu = Cpu::new(CpuConfig::with_mem_size(1 << 20)).unwrap();
    // mov eax, 1; out 0x80, al; hlt
    cpu.mem
        .load(0, &[0x66, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xE6, 0x80, 0xF4])
        .unwrap();
    let recorder = PortRecorder::default();
    let writes = recorder.writes.clone();
    cpu.io.register(
        0x80,
        1,
        IoWidths::BYTE,
        IoAccess::WRITE,
        Box::new(recorder),
    );

    assert_eq!(cpu.state.eip, 0);
    assert!(!cpu.mmu.paging_enabled());
    assert_eq!(cpu.execute(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[EAX], 1);
    assert_eq!(*writes.borrow(), vec![(0x80, 1, 1)]);
}

#[test]
fn in_reads_device_and_unclaimed_ports_float() {
    // in al, 0x60; mov bl, al; in ax, dx; hlt
    let mut cpu = real_mode(&[0xE4, 0x60, 0x88, 0xC3, 0xED, 0xF4]);
    cpu.io.register(
        0x60,
        1,
        IoWidths::BYTE,
        IoAccess::READ,
        Box::new(PortRecorder {
            read_value: 0x1C,
            ..PortRecorder::default()
        }),
    );
    cpu.state.regs[lin86_cpu_core::state::EDX] = 0x3F0;
    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[lin86_cpu_core::state::EBX] & 0xFF, 0x1C);
    assert_eq!(cpu.state.regs[EAX] & 0xFFFF, 0xFFFF);
}

#[test]
fn rep_outsb_streams_a_buffer() {
    // mov si, 0x500; mov cx, 5; mov dx, 0xe9; cld; rep outsb; hlt
    let mut cpu = real_mode(&[
        0xBE, 0x00, 0x05, 0xB9, 0x05, 0x00, 0xBA, 0xE9, 0x00, 0xFC, 0xF3, 0x6E, 0xF4,
    ]);
    cpu.mem.load(0x500, b"hello").unwrap();
    let recorder = PortRecorder::default();
    let writes = recorder.writes.clone();
    cpu.io
        .register(0xE9, 1, IoWidths::BYTE, IoAccess::WRITE, Box::new(recorder));

    assert_eq!(cpu.run(1_000).unwrap(), ExitStatus::Halted);
    let bytes: Vec<u8> = writes.borrow().iter().map(|&(_, _, v)| v as u8).collect();
    assert_eq!(bytes, b"hello");
}
