//! Data movement: MOV forms, exchanges, stack operations, segment loads and conversions.

use super::decode::Instr;
use super::operand::imm_sx8;
use super::Flow;
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::Width;
use crate::interrupts::FrameWriter;
use crate::state::{SegReg, EAX, EBP, EBX, EDX, ESP, FLAGS_ARITH, FLAG_OF, FLAG_RESERVED1};

impl Cpu {
    /// MOV in its 88-8B, A0-A3, B0-BF and C6/C7 forms.
    pub(super) fn exec_mov(&mut self, i: &Instr) -> Result<Flow, Exception> {
        match i.opcode {
            0x88 | 0x89 => {
                let w = i.width_from_low_bit();
                let v = self.reg_read(i.reg(), w);
                self.rm_write(i, w, v)?;
            }
            0x8A | 0x8B => {
                let w = i.width_from_low_bit();
                let v = self.rm_read(i, w)?;
                self.reg_write(i.reg(), w, v);
            }
            0xA0..=0xA3 => {
                let w = i.width_from_low_bit();
                let seg = i.seg_or(SegReg::Ds);
                if i.opcode < 0xA2 {
                    let v = self.read_mem(seg, i.imm, w)?;
                    self.reg_write(EAX, w, v);
                } else {
                    let v = self.reg_read(EAX, w);
                    self.write_mem(seg, i.imm, w, v)?;
                }
            }
            0xB0..=0xB7 => self.reg_write(usize::from(i.opcode & 7), Width::Byte, i.imm),
            0xB8..=0xBF => self.reg_write(usize::from(i.opcode & 7), i.op_width(), i.imm),
            _ => {
                let w = i.width_from_low_bit();
                self.rm_write(i, w, i.imm)?;
            }
        }
        Ok(Flow::Next)
    }

    /// MOV r/m, Sreg (8C) and MOV Sreg, r/m (8E).
    pub(super) fn exec_mov_sreg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let seg = SegReg::from_index(i.reg()).ok_or(Exception::InvalidOpcode)?;
        if i.opcode == 0x8C {
            let sel = u32::from(self.state.seg(seg).selector);
            if i.mem.is_some() {
                self.rm_write(i, Width::Word, sel)?;
            } else {
                self.reg_write(i.rm(), i.op_width(), sel);
            }
            return Ok(Flow::Next);
        }
        if seg == SegReg::Cs {
            return Err(Exception::InvalidOpcode);
        }
        let sel = self.rm_read(i, Width::Word)? as u16;
        self.load_segment(seg, sel)?;
        if seg == SegReg::Ss {
            self.interrupt_shadow = 1;
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_lea(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let m = i.mem.as_ref().ok_or(Exception::InvalidOpcode)?;
        let ea = self.effective_offset(i, m);
        self.reg_write(i.reg(), i.op_width(), ea);
        Ok(Flow::Next)
    }

    /// XCHG r/m, reg (86/87) and XCHG eAX, reg (91-97). 90 is NOP.
    pub(super) fn exec_xchg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        if let 0x90..=0x97 = i.opcode {
            let r = usize::from(i.opcode & 7);
            let w = i.op_width();
            let a = self.reg_read(EAX, w);
            let b = self.reg_read(r, w);
            self.reg_write(EAX, w, b);
            self.reg_write(r, w, a);
            return Ok(Flow::Next);
        }
        let w = i.width_from_low_bit();
        let reg = i.reg();
        let src = self.reg_read(reg, w);
        self.rm_modify(i, w, |cpu, old| {
            cpu.reg_write(reg, w, old);
            src
        })?;
        Ok(Flow::Next)
    }

    /// PUSH r (50-57), PUSH imm (68/6A).
    pub(super) fn exec_push(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let v = match i.opcode {
            0x50..=0x57 => self.state.regs[usize::from(i.opcode & 7)],
            0x68 => i.imm,
            _ => imm_sx8(i, Width::Dword),
        };
        self.push(i.op32, v)?;
        Ok(Flow::Next)
    }

    /// POP r (58-5F).
    pub(super) fn exec_pop_reg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let v = self.pop(i.op32)?;
        self.reg_write(usize::from(i.opcode & 7), i.op_width(), v);
        Ok(Flow::Next)
    }

    /// POP r/m (8F /0). ESP is already incremented when the destination address is formed.
    pub(super) fn exec_pop_rm(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let v = self.peek(i.op32, 0)?;
        let old_esp = self.state.regs[ESP];
        self.state.regs[ESP] = self.sp_offset(if i.op32 { 4 } else { 2 });
        if let Err(e) = self.rm_write(i, i.op_width(), v) {
            self.state.regs[ESP] = old_esp;
            return Err(e);
        }
        Ok(Flow::Next)
    }

    /// PUSH of a segment register (06, 0E, 16, 1E, 0F A0, 0F A8).
    pub(super) fn exec_push_sreg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let seg = match i.opcode {
            0x06 => SegReg::Es,
            0x0E => SegReg::Cs,
            0x16 => SegReg::Ss,
            0x1E => SegReg::Ds,
            0x1A0 => SegReg::Fs,
            _ => SegReg::Gs,
        };
        let sel = u32::from(self.state.seg(seg).selector);
        self.push(i.op32, sel)?;
        Ok(Flow::Next)
    }

    /// POP of a segment register (07, 17, 1F, 0F A1, 0F A9).
    pub(super) fn exec_pop_sreg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let seg = match i.opcode {
            0x07 => SegReg::Es,
            0x17 => SegReg::Ss,
            0x1F => SegReg::Ds,
            0x1A1 => SegReg::Fs,
            _ => SegReg::Gs,
        };
        let sel = self.peek(i.op32, 0)? as u16;
        self.load_segment(seg, sel)?;
        self.state.regs[ESP] = self.sp_offset(if i.op32 { 4 } else { 2 });
        if seg == SegReg::Ss {
            self.interrupt_shadow = 1;
        }
        Ok(Flow::Next)
    }

    /// PUSHA (60): the whole frame is written before ESP moves.
    pub(super) fn exec_pusha(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let regs = self.state.regs;
        let mut frame = FrameWriter::on_current_stack(self, i.op32);
        for v in regs {
            frame.push(self, v)?;
        }
        self.state.regs[ESP] = frame.esp(regs[ESP]);
        Ok(Flow::Next)
    }

    /// POPA (61). The saved ESP slot is skipped.
    pub(super) fn exec_popa(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let size = if i.op32 { 4 } else { 2 };
        let w = i.op_width();
        let mut vals = [0u32; 8];
        for (n, v) in vals.iter_mut().enumerate() {
            *v = self.peek(i.op32, n as u32 * size)?;
        }
        for (n, v) in vals.into_iter().enumerate() {
            let r = 7 - n;
            if r != ESP {
                self.reg_write(r, w, v);
            }
        }
        self.state.regs[ESP] = self.sp_offset(8 * size);
        Ok(Flow::Next)
    }

    /// MOVZX/MOVSX (0F B6/B7/BE/BF).
    pub(super) fn exec_movx(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let src_w = if i.opcode & 1 == 0 {
            Width::Byte
        } else {
            Width::Word
        };
        let v = self.rm_read(i, src_w)?;
        let v = if i.opcode >= 0x1BE {
            src_w.sign_extend(v)
        } else {
            v
        };
        self.reg_write(i.reg(), i.op_width(), v);
        Ok(Flow::Next)
    }

    /// CBW/CWDE (98) and CWD/CDQ (99).
    pub(super) fn exec_convert(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let eax = self.state.regs[EAX];
        match (i.opcode, i.op32) {
            (0x98, true) => self.state.regs[EAX] = Width::Word.sign_extend(eax),
            (0x98, false) => self.state.set_reg16(EAX, Width::Byte.sign_extend(eax) as u16),
            (_, true) => self.state.regs[EDX] = if eax & 0x8000_0000 != 0 { u32::MAX } else { 0 },
            (_, false) => self.state.set_reg16(EDX, if eax & 0x8000 != 0 { 0xFFFF } else { 0 }),
        }
        Ok(Flow::Next)
    }

    /// BSWAP r32 (0F C8-CF).
    pub(super) fn exec_bswap(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let r = usize::from(i.opcode & 7);
        self.state.regs[r] = self.state.regs[r].swap_bytes();
        Ok(Flow::Next)
    }

    /// XLAT (D7): AL = [seg:eBX + AL].
    pub(super) fn exec_xlat(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let mut off = self.state.regs[EBX].wrapping_add(u32::from(self.state.reg8(0)));
        if !i.addr32 {
            off &= 0xFFFF;
        }
        let v = self.seg_read_u8(i.seg_or(SegReg::Ds), off)?;
        self.state.set_reg8(0, v);
        Ok(Flow::Next)
    }

    /// LES/LDS (C4/C5) and LSS/LFS/LGS (0F B2/B4/B5).
    pub(super) fn exec_load_far_pointer(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let seg = match i.opcode {
            0xC4 => SegReg::Es,
            0xC5 => SegReg::Ds,
            0x1B2 => SegReg::Ss,
            0x1B4 => SegReg::Fs,
            _ => SegReg::Gs,
        };
        let w = i.op_width();
        let (mseg, off) = self.mem_addr(i)?;
        let offset = self.read_mem(mseg, off, w)?;
        let sel = self.seg_read_u16(mseg, off.wrapping_add(w.bytes()))?;
        self.load_segment(seg, sel)?;
        self.reg_write(i.reg(), w, offset);
        Ok(Flow::Next)
    }

    /// ENTER imm16, imm8 (C8).
    pub(super) fn exec_enter(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let size = if i.op32 { 4 } else { 2 };
        let level = i.imm2 & 0x1F;
        let mask = self.state.stack_mask();
        let ebp = self.state.regs[EBP];
        self.push(i.op32, ebp)?;
        let frame_temp = self.state.regs[ESP];
        if level > 0 {
            let mut bp = ebp;
            for _ in 1..level {
                bp = (bp & !mask) | (bp.wrapping_sub(size) & mask);
                let v = if i.op32 {
                    self.seg_read_u32(SegReg::Ss, bp & mask)?
                } else {
                    u32::from(self.seg_read_u16(SegReg::Ss, bp & mask)?)
                };
                self.push(i.op32, v)?;
            }
            self.push(i.op32, frame_temp)?;
        }
        self.reg_write(EBP, i.op_width(), frame_temp);
        self.state.regs[ESP] = self.sp_offset(i.imm.wrapping_neg());
        Ok(Flow::Next)
    }

    /// LEAVE (C9).
    pub(super) fn exec_leave(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let mask = self.state.stack_mask();
        let esp = self.state.regs[ESP];
        let new_esp = (esp & !mask) | (self.state.regs[EBP] & mask);
        let saved_esp = esp;
        self.state.regs[ESP] = new_esp;
        match self.pop(i.op32) {
            Ok(v) => {
                self.reg_write(EBP, i.op_width(), v);
                Ok(Flow::Next)
            }
            Err(e) => {
                self.state.regs[ESP] = saved_esp;
                Err(e)
            }
        }
    }

    /// BOUND r, m (62).
    pub(super) fn exec_bound(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let (seg, off) = self.mem_addr(i)?;
        let lower = w.sign_extend(self.read_mem(seg, off, w)?) as i32;
        let upper = w.sign_extend(self.read_mem(seg, off.wrapping_add(w.bytes()), w)?) as i32;
        let index = w.sign_extend(self.reg_read(i.reg(), w)) as i32;
        if index < lower || index > upper {
            return Err(Exception::BoundRange);
        }
        Ok(Flow::Next)
    }

    /// LAHF (9F) and SAHF (9E).
    pub(super) fn exec_ahf(&mut self, i: &Instr) -> Result<Flow, Exception> {
        if i.opcode == 0x9F {
            let f = (self.state.flags.compute() & 0xFF) | FLAG_RESERVED1;
            self.state.set_reg8(4, f as u8);
        } else {
            let ah = u32::from(self.state.reg8(4));
            let f = self.state.flags.compute();
            let low = FLAGS_ARITH & !FLAG_OF;
            self.state.flags.set_materialized((f & !low) | (ah & low));
        }
        Ok(Flow::Next)
    }
}
