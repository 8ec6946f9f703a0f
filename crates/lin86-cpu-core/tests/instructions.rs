mod common;

use common::{flat, real_mode, set_ivt};
use lin86_cpu_core::state::{EAX, EBX, ECX, EDI, EDX, ESI, ESP};
use lin86_cpu_core::{Cpu, ExitStatus};

fn run_flat(code: &[u8]) -> Cpu {
    let mut cpu = flat(code);
    assert_eq!(cpu.run(10_000).unwrap(), ExitStatus::Halted);
    cpu
}

#[test]
fn add_wraps_and_sets_carry_and_zero() {
    let cpu = run_flat(&[
        0xB8, 0xFF, 0xFF, 0xFF, 0xFF, // mov eax, -1
        0x83, 0xC0, 0x01, // add eax, 1
        0x0F, 0x92, 0xC3, // setc bl
        0x0F, 0x94, 0xC7, // setz bh
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], 0);
    assert_eq!(cpu.state.regs[EBX] & 0xFFFF, 0x0101);
}

#[test]
fn unsigned_division_leaves_quotient_and_remainder() {
    let cpu = run_flat(&[
        0xB8, 100, 0, 0, 0, // mov eax, 100
        0xB9, 7, 0, 0, 0, // mov ecx, 7
        0x31, 0xD2, // xor edx, edx
        0xF7, 0xF1, // div ecx
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], 14);
    assert_eq!(cpu.state.regs[EDX], 2);
}

#[test]
fn signed_multiply_sets_overflow_when_high_half_is_significant() {
    let cpu = run_flat(&[
        0xB8, 0x00, 0x00, 0x01, 0x00, // mov eax, 0x10000
        0x69, 0xC0, 0x00, 0x00, 0x01, 0x00, // imul eax, eax, 0x10000
        0x0F, 0x90, 0xC3, // seto bl
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], 0);
    assert_eq!(cpu.state.regs[EBX] & 0xFF, 1);
}

#[test]
fn shift_out_of_the_top_bit_sets_carry() {
    let cpu = run_flat(&[
        0xB8, 0x01, 0x00, 0x00, 0x80, // mov eax, 0x80000001
        0xD1, 0xE0, // shl eax, 1
        0x0F, 0x92, 0xC3, // setc bl
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], 2);
    assert_eq!(cpu.state.regs[EBX] & 0xFF, 1);
}

#[test]
fn near_call_and_return() {
    let cpu = run_flat(&[
        0xE8, 0x01, 0x00, 0x00, 0x00, // call +1
        0xF4, // hlt
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0xC3, // ret
    ]);
    assert_eq!(cpu.state.regs[EAX], 42);
    assert_eq!(cpu.state.regs[ESP], 0x8000);
    assert_eq!(cpu.state.eip, 0x1006);
}

#[test]
fn push_pop_and_bswap() {
    let cpu = run_flat(&[
        0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax, 0x12345678
        0x50, // push eax
        0x0F, 0xC8, // bswap eax
        0x5B, // pop ebx
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], 0x7856_3412);
    assert_eq!(cpu.state.regs[EBX], 0x1234_5678);
    assert_eq!(cpu.mem.read_u32(0x8000 - 4), 0x1234_5678);
}

#[test]
fn rep_movsd_copies_and_advances_indices() {
    let mut cpu = flat(&[
        0xBE, 0x00, 0x20, 0x00, 0x00, // mov esi, 0x2000
        0xBF, 0x00, 0x30, 0x00, 0x00, // mov edi, 0x3000
        0xB9, 0x04, 0x00, 0x00, 0x00, // mov ecx, 4
        0xFC, // cld
        0xF3, 0xA5, // rep movsd
        0xF4,
    ]);
    cpu.mem.load(0x2000, &(1u8..=16).collect::<Vec<_>>()).unwrap();
    assert_eq!(cpu.run(1_000).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.mem.slice(0x3000, 16).unwrap(), cpu.mem.slice(0x2000, 16).unwrap());
    assert_eq!(cpu.state.regs[ESI], 0x2010);
    assert_eq!(cpu.state.regs[EDI], 0x3010);
    assert_eq!(cpu.state.regs[ECX], 0);
}

#[test]
fn repne_scasb_finds_the_terminator() {
    let mut cpu = flat(&[
        0xBF, 0x00, 0x20, 0x00, 0x00, // mov edi, 0x2000
        0x31, 0xC0, // xor eax, eax
        0xB9, 0xFF, 0xFF, 0xFF, 0xFF, // mov ecx, -1
        0xFC, // cld
        0xF2, 0xAE, // repne scasb
        0xF4,
    ]);
    cpu.mem.load(0x2000, b"hello\0").unwrap();
    assert_eq!(cpu.run(1_000).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[EDI], 0x2006);
    assert_eq!(cpu.state.regs[ECX], u32::MAX - 6);
}

#[test]
fn rep_stosb_resumes_after_the_slice_ends() {
    // mov cx, 10; mov di, 0x500; rep stosb; hlt
    let mut cpu = real_mode(&[0xB9, 10, 0, 0xBF, 0x00, 0x05, 0xF3, 0xAA, 0xF4]);
    cpu.state.regs[EAX] = 0xAB;

    assert_eq!(cpu.execute(6).unwrap(), ExitStatus::Continue);
    assert_eq!(cpu.state.regs[ECX], 6);
    assert_eq!(cpu.state.regs[EDI], 0x504);
    assert_eq!(cpu.state.eip, 0x7C06);
    assert_eq!(cpu.cycles(), 6);

    assert_eq!(cpu.execute(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[ECX], 0);
    // Two MOVs, ten iterations, HLT.
    assert_eq!(cpu.cycles(), 13);
    assert_eq!(cpu.mem.slice(0x500, 10).unwrap(), &[0xAB; 10]);
    assert_eq!(cpu.mem.read_u8(0x50A), 0);
}

#[test]
fn icebp_traps_through_the_debug_vector() {
    let mut cpu = real_mode(&[0xF1, 0xF4]);
    set_ivt(&mut cpu, 1, 0, 0x600);
    // mov ax, 0x1234; hlt
    cpu.mem.load(0x600, &[0xB8, 0x34, 0x12, 0xF4]).unwrap();

    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.state.regs[EAX] & 0xFFFF, 0x1234);
    // Trap frame: the saved IP is the instruction after ICEBP.
    assert_eq!(cpu.mem.read_u16(0x1000 - 6), 0x7C01);
}

#[test]
fn cpuid_reports_vendor_and_features() {
    let cpu = run_flat(&[
        0x31, 0xC0, // xor eax, eax
        0x0F, 0xA2, // cpuid
        0xF4,
    ]);
    let mut vendor = Vec::new();
    for r in [EBX, EDX, ECX] {
        vendor.extend_from_slice(&cpu.state.regs[r].to_le_bytes());
    }
    assert_eq!(&vendor[..], &cpu.config().cpuid.vendor[..]);
    assert_eq!(cpu.state.regs[EAX], 1);

    let cpu = run_flat(&[
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x0F, 0xA2, // cpuid
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX], cpu.config().cpuid.signature());
    assert_eq!(cpu.state.regs[EDX], cpu.config().cpuid.features_edx);
}

#[test]
fn rdtsc_counts_retired_instructions() {
    let cpu = run_flat(&[
        0x0F, 0x31, // rdtsc
        0x89, 0xC3, // mov ebx, eax
        0x90, // nop
        0x0F, 0x31, // rdtsc
        0xF4,
    ]);
    assert_eq!(cpu.state.regs[EAX] - cpu.state.regs[EBX], 3);
}

#[test]
fn lock_prefix_on_register_destination_is_undefined() {
    // lock add eax, ebx
    let mut cpu = flat(&[0xF0, 0x01, 0xD8]);
    assert_eq!(cpu.execute(10).unwrap(), ExitStatus::FaultPending);
    assert_eq!(cpu.state.eip, 0x1000);
}

#[test]
fn cmpxchg_swaps_on_match() {
    let mut cpu = flat(&[
        0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0xBB, 0x09, 0x00, 0x00, 0x00, // mov ebx, 9
        0xF0, 0x0F, 0xB1, 0x1D, 0x00, 0x20, 0x00, 0x00, // lock cmpxchg [0x2000], ebx
        0x0F, 0x94, 0xC1, // setz cl
        0xF4,
    ]);
    cpu.mem.write_u32(0x2000, 5);
    assert_eq!(cpu.run(100).unwrap(), ExitStatus::Halted);
    assert_eq!(cpu.mem.read_u32(0x2000), 9);
    assert_eq!(cpu.state.regs[ECX] & 0xFF, 1);
}

#[test]
fn x87_escape_is_skipped_without_em_and_traps_with_it() {
    // fninit; hlt
    let cpu = run_flat(&[0xDB, 0xE3, 0xF4]);
    assert_eq!(cpu.state.eip, 0x1003);

    let mut cpu = flat(&[0xDB, 0xE3, 0xF4]);
    let cr0 = cpu.mmu.cr0();
    cpu.mmu.set_cr0(cr0 | lin86_mmu::CR0_EM);
    assert_eq!(cpu.execute(10).unwrap(), ExitStatus::FaultPending);
}
