//! String instructions with optional REP/REPE/REPNE prefixes.
//!
//! A repeated instruction retires one cycle per element. When the slice runs out mid-loop, EIP
//! is rewound to the instruction so the next slice resumes it with the updated ECX/ESI/EDI.

use super::decode::{Instr, Rep};
use super::ops_alu::AluOp;
use super::Flow;
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::Width;
use crate::io::IoSize;
use crate::state::{SegReg, EAX, ECX, EDI, EDX, ESI, FLAG_DF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Ins,
    Outs,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

impl StringOp {
    fn from_opcode(opcode: u16) -> StringOp {
        match opcode {
            0x6C | 0x6D => StringOp::Ins,
            0x6E | 0x6F => StringOp::Outs,
            0xA4 | 0xA5 => StringOp::Movs,
            0xA6 | 0xA7 => StringOp::Cmps,
            0xAA | 0xAB => StringOp::Stos,
            0xAC | 0xAD => StringOp::Lods,
            _ => StringOp::Scas,
        }
    }

    /// CMPS and SCAS terminate a REPE/REPNE loop on the ZF outcome.
    fn tests_zf(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

pub(super) fn io_size(w: Width) -> IoSize {
    match w {
        Width::Byte => IoSize::Byte,
        Width::Word => IoSize::Word,
        Width::Dword => IoSize::Dword,
    }
}

impl Cpu {
    pub(super) fn exec_string(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let op = StringOp::from_opcode(i.opcode);
        let w = i.width_from_low_bit();
        if matches!(op, StringOp::Ins | StringOp::Outs) {
            self.check_io_privilege()?;
        }
        let Some(rep) = i.rep else {
            self.string_element(i, op, w)?;
            return Ok(Flow::Next);
        };

        // One cycle per iteration. The step loop's charge for the instruction covers the first.
        let mask = if i.addr32 { u32::MAX } else { 0xFFFF };
        let mut first = true;
        loop {
            let ecx = self.state.regs[ECX];
            if ecx & mask == 0 {
                return Ok(Flow::Next);
            }
            if !first {
                self.cycles += 1;
            }
            first = false;
            self.string_element(i, op, w)?;
            let remaining = ecx.wrapping_sub(1) & mask;
            self.state.regs[ECX] = (ecx & !mask) | remaining;

            if op.tests_zf() {
                let zf = self.state.flags.zf();
                if (rep == Rep::Rep && !zf) || (rep == Rep::Repne && zf) {
                    return Ok(Flow::Next);
                }
            }
            if remaining == 0 {
                return Ok(Flow::Next);
            }
            if self.cycles + 1 >= self.slice_end {
                self.state.eip = self.insn_start;
                return Ok(Flow::Next);
            }
        }
    }

    fn advance_index(&mut self, reg: usize, i: &Instr, w: Width) {
        let step = if self.state.eflags & FLAG_DF != 0 {
            w.bytes().wrapping_neg()
        } else {
            w.bytes()
        };
        let v = self.state.regs[reg];
        self.state.regs[reg] = if i.addr32 {
            v.wrapping_add(step)
        } else {
            (v & 0xFFFF_0000) | (v.wrapping_add(step) & 0xFFFF)
        };
    }

    fn index(&self, reg: usize, i: &Instr) -> u32 {
        let v = self.state.regs[reg];
        if i.addr32 {
            v
        } else {
            v & 0xFFFF
        }
    }

    fn string_element(&mut self, i: &Instr, op: StringOp, w: Width) -> Result<(), Exception> {
        let src_seg = i.seg_or(SegReg::Ds);
        match op {
            StringOp::Movs => {
                let v = self.read_mem(src_seg, self.index(ESI, i), w)?;
                self.write_mem(SegReg::Es, self.index(EDI, i), w, v)?;
                self.advance_index(ESI, i, w);
                self.advance_index(EDI, i, w);
            }
            StringOp::Cmps => {
                let a = self.read_mem(src_seg, self.index(ESI, i), w)?;
                let b = self.read_mem(SegReg::Es, self.index(EDI, i), w)?;
                self.alu(AluOp::Cmp, w, a, b);
                self.advance_index(ESI, i, w);
                self.advance_index(EDI, i, w);
            }
            StringOp::Stos => {
                let v = self.reg_read(EAX, w);
                self.write_mem(SegReg::Es, self.index(EDI, i), w, v)?;
                self.advance_index(EDI, i, w);
            }
            StringOp::Lods => {
                let v = self.read_mem(src_seg, self.index(ESI, i), w)?;
                self.reg_write(EAX, w, v);
                self.advance_index(ESI, i, w);
            }
            StringOp::Scas => {
                let a = self.reg_read(EAX, w);
                let b = self.read_mem(SegReg::Es, self.index(EDI, i), w)?;
                self.alu(AluOp::Cmp, w, a, b);
                self.advance_index(EDI, i, w);
            }
            StringOp::Ins => {
                let off = self.index(EDI, i);
                // The port read has side effects, so the store must not fault after it.
                self.check_writable(SegReg::Es, off, w)?;
                let port = self.state.regs[EDX] as u16;
                let v = self.io.read(port, io_size(w));
                self.write_mem(SegReg::Es, off, w, v)?;
                self.advance_index(EDI, i, w);
            }
            StringOp::Outs => {
                let v = self.read_mem(src_seg, self.index(ESI, i), w)?;
                let port = self.state.regs[EDX] as u16;
                self.io.write(port, io_size(w), v);
                self.advance_index(ESI, i, w);
            }
        }
        Ok(())
    }
}
