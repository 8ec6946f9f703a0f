//! Branches, calls, returns, loops and software interrupts.

use super::decode::Instr;
use super::Flow;
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::Width;
use crate::state::{ECX, ESP};

impl Instr {
    /// Relative displacement of a branch, sign-extended from its encoded width.
    fn rel(&self) -> u32 {
        match self.opcode {
            0x70..=0x7F | 0xE0..=0xE3 | 0xEB => Width::Byte.sign_extend(self.imm),
            _ if self.op32 => self.imm,
            _ => Width::Word.sign_extend(self.imm),
        }
    }
}

impl Cpu {
    /// Jcc rel8 (70-7F) and Jcc rel16/32 (0F 80-8F).
    pub(super) fn exec_jcc(&mut self, i: &Instr) -> Result<Flow, Exception> {
        if self.state.flags.condition((i.opcode & 0xF) as u8) {
            self.state.eip = self.branch_target(i, i.rel());
        }
        Ok(Flow::Next)
    }

    /// JMP rel8/rel16/32 (EB, E9).
    pub(super) fn exec_jmp_near(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.state.eip = self.branch_target(i, i.rel());
        Ok(Flow::Next)
    }

    /// CALL rel16/32 (E8).
    pub(super) fn exec_call_near(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let target = self.branch_target(i, i.rel());
        self.push(i.op32, self.state.eip)?;
        self.state.eip = target;
        Ok(Flow::Next)
    }

    /// RET and RET imm16 (C3, C2).
    pub(super) fn exec_ret_near(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let target = self.peek(i.op32, 0)?;
        let size = if i.op32 { 4 } else { 2 };
        let release = if i.opcode == 0xC2 { i.imm } else { 0 };
        self.state.regs[ESP] = self.sp_offset(size + release);
        self.state.eip = if i.op32 { target } else { target & 0xFFFF };
        Ok(Flow::Next)
    }

    /// RETF and RETF imm16 (CB, CA). A return to an outer privilege level ends the batch.
    pub(super) fn exec_retf(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let release = if i.opcode == 0xCA { i.imm as u16 } else { 0 };
        if self.retf(i.op32, release)? {
            Ok(Flow::Yield)
        } else {
            Ok(Flow::Next)
        }
    }

    /// IRET (CF). Always ends the batch since IF may have been re-enabled.
    pub(super) fn exec_iret(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.iret(i.op32)?;
        Ok(Flow::Yield)
    }

    /// JMP ptr16:16/32 (EA) and CALL ptr16:16/32 (9A).
    pub(super) fn exec_far_direct(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let selector = i.imm2 as u16;
        if i.opcode == 0xEA {
            self.jmp_far(selector, i.imm, i.op32)?;
        } else {
            self.call_far(selector, i.imm, i.op32)?;
        }
        Ok(Flow::Next)
    }

    /// LOOPNE, LOOPE, LOOP, JCXZ/JECXZ (E0-E3). The counter width follows the address size.
    pub(super) fn exec_loop(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let mask = if i.addr32 { u32::MAX } else { 0xFFFF };
        let ecx = self.state.regs[ECX];
        let taken = if i.opcode == 0xE3 {
            ecx & mask == 0
        } else {
            let count = ecx.wrapping_sub(1) & mask;
            self.state.regs[ECX] = (ecx & !mask) | count;
            count != 0
                && match i.opcode {
                    0xE0 => !self.state.flags.zf(),
                    0xE1 => self.state.flags.zf(),
                    _ => true,
                }
        };
        if taken {
            self.state.eip = self.branch_target(i, i.rel());
        }
        Ok(Flow::Next)
    }

    /// INT3 (CC), INT imm8 (CD), INTO (CE) and ICEBP (F1).
    pub(super) fn exec_int(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let vector = match i.opcode {
            // #DB without the gate DPL check.
            0xF1 => {
                self.deliver(1, false, None, false)?;
                return Ok(Flow::Next);
            }
            0xCC => 3,
            0xCD => i.imm as u8,
            _ => {
                if !self.state.flags.of() {
                    return Ok(Flow::Next);
                }
                4
            }
        };
        self.deliver(vector, true, None, false)?;
        Ok(Flow::Next)
    }

    /// Group 4 (FE): INC/DEC r/m8.
    pub(super) fn exec_group4(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let inc = i.reg() == 0;
        self.rm_modify(i, Width::Byte, |cpu, v| cpu.inc_dec(Width::Byte, v, inc))?;
        Ok(Flow::Next)
    }

    /// Group 5 (FF): INC, DEC, indirect near/far CALL and JMP, PUSH r/m.
    pub(super) fn exec_group5(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        match i.reg() {
            0 | 1 => {
                let inc = i.reg() == 0;
                self.rm_modify(i, w, |cpu, v| cpu.inc_dec(w, v, inc))?;
            }
            2 => {
                let target = self.rm_read(i, w)?;
                self.push(i.op32, self.state.eip)?;
                self.state.eip = target;
            }
            4 => self.state.eip = self.rm_read(i, w)?,
            3 | 5 => {
                let (seg, off) = self.mem_addr(i)?;
                let offset = self.read_mem(seg, off, w)?;
                let selector = self.seg_read_u16(seg, off.wrapping_add(w.bytes()))?;
                if i.reg() == 3 {
                    self.call_far(selector, offset, i.op32)?;
                } else {
                    self.jmp_far(selector, offset, i.op32)?;
                }
            }
            _ => {
                let v = self.rm_read(i, w)?;
                self.push(i.op32, v)?;
            }
        }
        Ok(Flow::Next)
    }
}
