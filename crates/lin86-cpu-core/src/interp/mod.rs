//! Single-step interpreter: decode one instruction at CS:EIP and run its handler.
//!
//! Handlers are grouped by concern (`ops_alu`, `ops_data`, `ops_cf`, `ops_string`,
//! `ops_system`) and all share the same shape, `fn(&mut Cpu, &Instr) -> Result<Flow, Exception>`.
//! A handler that fails leaves EIP pointing after the instruction; the execute loop rewinds it
//! to `insn_start` before the fault is delivered.

pub(crate) mod decode;
mod operand;
mod ops_alu;
mod ops_cf;
mod ops_data;
mod ops_string;
mod ops_system;

use crate::cpu::Cpu;
use crate::exceptions::Exception;
use decode::Instr;

/// What the execute loop does after an instruction retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    /// HLT: stop the slice until an interrupt arrives.
    Halt,
    /// End the batch early so a newly unmasked interrupt is sampled promptly.
    Yield,
}

fn lock_allowed(i: &Instr) -> bool {
    if i.mem.is_none() {
        return false;
    }
    match i.opcode {
        0x00..=0x3F => i.opcode & 7 <= 1 && i.opcode & 0x38 != 0x38,
        0x80..=0x83 => i.reg() != 7,
        0x86 | 0x87 => true,
        0xF6 | 0xF7 => matches!(i.reg(), 2 | 3),
        0xFE | 0xFF => i.reg() <= 1,
        0x1AB | 0x1B3 | 0x1BB | 0x1B0 | 0x1B1 | 0x1C0 | 0x1C1 | 0x1C7 => true,
        0x1BA => i.reg() >= 5,
        _ => false,
    }
}

impl Cpu {
    /// Decodes and executes the instruction at CS:EIP.
    pub(crate) fn step(&mut self) -> Result<Flow, Exception> {
        let start = self.state.eip;
        self.insn_start = start;
        let code32 = self.state.code32();
        let ip_mask = if code32 { u32::MAX } else { 0xFFFF };
        let instr = decode::decode(
            &mut |idx| self.fetch_u8(start.wrapping_add(idx) & ip_mask),
            code32,
        )?;
        self.state.eip = start.wrapping_add(instr.len) & ip_mask;
        if instr.lock && !lock_allowed(&instr) {
            return Err(Exception::InvalidOpcode);
        }
        self.dispatch(&instr)
    }

    fn dispatch(&mut self, i: &Instr) -> Result<Flow, Exception> {
        match i.opcode {
            0x00..=0x3F => match i.opcode & 7 {
                0..=5 => self.exec_alu_classic(i),
                6 => self.exec_push_sreg(i),
                _ if i.opcode < 0x20 => self.exec_pop_sreg(i),
                _ => self.exec_bcd(i),
            },
            0x40..=0x4F => self.exec_inc_dec_reg(i),
            0x50..=0x57 | 0x68 | 0x6A => self.exec_push(i),
            0x58..=0x5F => self.exec_pop_reg(i),
            0x60 => self.exec_pusha(i),
            0x61 => self.exec_popa(i),
            0x62 => self.exec_bound(i),
            0x63 => self.exec_arpl(i),
            0x69 | 0x6B | 0x1AF => self.exec_imul(i),
            0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF => self.exec_string(i),
            0x70..=0x7F | 0x180..=0x18F => self.exec_jcc(i),
            0x80..=0x83 => self.exec_group1(i),
            0x84 | 0x85 | 0xA8 | 0xA9 => self.exec_test(i),
            0x86 | 0x87 | 0x90..=0x97 => self.exec_xchg(i),
            0x88..=0x8B | 0xA0..=0xA3 | 0xB0..=0xBF | 0xC6 | 0xC7 => self.exec_mov(i),
            0x8C | 0x8E => self.exec_mov_sreg(i),
            0x8D => self.exec_lea(i),
            0x8F => self.exec_pop_rm(i),
            0x98 | 0x99 => self.exec_convert(i),
            0x9A | 0xEA => self.exec_far_direct(i),
            0x9B => self.exec_wait(i),
            0x9C | 0x9D => self.exec_pushf_popf(i),
            0x9E | 0x9F => self.exec_ahf(i),
            0xC0 | 0xC1 | 0xD0..=0xD3 => self.exec_group2(i),
            0xC2 | 0xC3 => self.exec_ret_near(i),
            0xC4 | 0xC5 | 0x1B2 | 0x1B4 | 0x1B5 => self.exec_load_far_pointer(i),
            0xC8 => self.exec_enter(i),
            0xC9 => self.exec_leave(i),
            0xCA | 0xCB => self.exec_retf(i),
            0xCC..=0xCE | 0xF1 => self.exec_int(i),
            0xCF => self.exec_iret(i),
            0xD4..=0xD6 => self.exec_bcd(i),
            0xD7 => self.exec_xlat(i),
            0xD8..=0xDF => self.exec_fpu_escape(i),
            0xE0..=0xE3 => self.exec_loop(i),
            0xE4..=0xE7 | 0xEC..=0xEF => self.exec_in_out(i),
            0xE8 => self.exec_call_near(i),
            0xE9 | 0xEB => self.exec_jmp_near(i),
            0xF4 => self.exec_hlt(i),
            0xF5 | 0xF8..=0xFD => self.exec_flag_op(i),
            0xF6 | 0xF7 => self.exec_group3(i),
            0xFE => self.exec_group4(i),
            0xFF => self.exec_group5(i),

            0x100 => self.exec_group6(i),
            0x101 => self.exec_group7(i),
            0x102 | 0x103 => self.exec_lar_lsl(i),
            0x106 | 0x108 | 0x109 => self.exec_cache_control(i),
            // Hint NOPs (prefetch and the 0F 1F multi-byte NOP).
            0x118..=0x11F => Ok(Flow::Next),
            0x120..=0x123 => self.exec_mov_control(i),
            0x130..=0x132 => self.exec_msr_tsc(i),
            0x140..=0x14F => self.exec_cmovcc(i),
            0x190..=0x19F => self.exec_setcc(i),
            0x1A0 | 0x1A8 => self.exec_push_sreg(i),
            0x1A1 | 0x1A9 => self.exec_pop_sreg(i),
            0x1A2 => self.exec_cpuid(i),
            0x1A3 | 0x1AB | 0x1B3 | 0x1BB | 0x1BA => self.exec_bit_test(i),
            0x1A4 | 0x1A5 | 0x1AC | 0x1AD => self.exec_double_shift(i),
            0x1B0 | 0x1B1 => self.exec_cmpxchg(i),
            0x1B6 | 0x1B7 | 0x1BE | 0x1BF => self.exec_movx(i),
            0x1BC | 0x1BD => self.exec_bit_scan(i),
            0x1C0 | 0x1C1 => self.exec_xadd(i),
            0x1C7 => self.exec_cmpxchg8b(i),
            0x1C8..=0x1CF => self.exec_bswap(i),
            // UD2 (0F 0B) and anything the decoder let through without a handler.
            _ => Err(Exception::InvalidOpcode),
        }
    }
}
