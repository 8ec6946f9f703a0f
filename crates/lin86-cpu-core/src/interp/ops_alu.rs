//! Integer arithmetic, logic, shifts, bit operations and BCD adjustment.

use super::decode::Instr;
use super::operand::imm_sx8;
use super::Flow;
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::{CcOp, Width};
use crate::state::{EAX, EBX, ECX, EDX, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_ZF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_index(idx: usize) -> AluOp {
        match idx & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

impl Cpu {
    /// `dst op src` at width `w`, recording the condition codes.
    pub(super) fn alu(&mut self, op: AluOp, w: Width, dst: u32, src: u32) -> u32 {
        let m = w.mask();
        let (dst, src) = (dst & m, src & m);
        let flags = &mut self.state.flags;
        match op {
            AluOp::Add => {
                let r = dst.wrapping_add(src) & m;
                flags.record(CcOp::Add(w), r, src);
                r
            }
            AluOp::Adc => {
                let carry = flags.cf();
                let r = dst.wrapping_add(src).wrapping_add(u32::from(carry)) & m;
                flags.record(if carry { CcOp::Adc(w) } else { CcOp::Add(w) }, r, src);
                r
            }
            AluOp::Sub | AluOp::Cmp => {
                let r = dst.wrapping_sub(src) & m;
                flags.record(CcOp::Sub(w), r, src);
                r
            }
            AluOp::Sbb => {
                let borrow = flags.cf();
                let r = dst.wrapping_sub(src).wrapping_sub(u32::from(borrow)) & m;
                flags.record(if borrow { CcOp::Sbb(w) } else { CcOp::Sub(w) }, r, src);
                r
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {
                let r = match op {
                    AluOp::And => dst & src,
                    AluOp::Or => dst | src,
                    _ => dst ^ src,
                };
                flags.record(CcOp::Logic(w), r, 0);
                r
            }
        }
    }

    /// Replaces individual arithmetic flags, keeping the others as currently computed.
    pub(super) fn update_flags(&mut self, set: u32, clear: u32) {
        let f = self.state.flags.compute();
        self.state.flags.set_materialized((f & !clear) | set);
    }

    fn set_cf_of(&mut self, cf: bool, of: bool) {
        let set = if cf { FLAG_CF } else { 0 } | if of { FLAG_OF } else { 0 };
        self.update_flags(set, FLAG_CF | FLAG_OF);
    }

    fn set_flag(&mut self, flag: u32, value: bool) {
        if value {
            self.update_flags(flag, 0);
        } else {
            self.update_flags(0, flag);
        }
    }

    fn alu_to_rm(&mut self, i: &Instr, op: AluOp, w: Width, src: u32) -> Result<(), Exception> {
        if op == AluOp::Cmp {
            let dst = self.rm_read(i, w)?;
            self.alu(op, w, dst, src);
            Ok(())
        } else {
            self.rm_modify(i, w, |cpu, dst| cpu.alu(op, w, dst, src))
        }
    }

    /// Opcodes 00-3D: the eight ALU operations in their Eb/Ev/Gb/Gv/AL/eAX forms.
    pub(super) fn exec_alu_classic(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let op = AluOp::from_index(usize::from(i.opcode >> 3));
        let w = i.width_from_low_bit();
        match i.opcode & 7 {
            0 | 1 => {
                let src = self.reg_read(i.reg(), w);
                self.alu_to_rm(i, op, w, src)?;
            }
            2 | 3 => {
                let src = self.rm_read(i, w)?;
                let dst = self.reg_read(i.reg(), w);
                let r = self.alu(op, w, dst, src);
                if op != AluOp::Cmp {
                    self.reg_write(i.reg(), w, r);
                }
            }
            _ => {
                let dst = self.reg_read(EAX, w);
                let r = self.alu(op, w, dst, i.imm);
                if op != AluOp::Cmp {
                    self.reg_write(EAX, w, r);
                }
            }
        }
        Ok(Flow::Next)
    }

    /// 80-83: ALU operation with an immediate, selected by ModRM.reg.
    pub(super) fn exec_group1(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let op = AluOp::from_index(i.reg());
        let (w, src) = match i.opcode {
            0x80 | 0x82 => (Width::Byte, i.imm),
            0x81 => (i.op_width(), i.imm),
            _ => (i.op_width(), imm_sx8(i, i.op_width())),
        };
        self.alu_to_rm(i, op, w, src)?;
        Ok(Flow::Next)
    }

    /// TEST in its 84/85, A8/A9 and F6/F7 /0 forms.
    pub(super) fn exec_test(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.width_from_low_bit();
        let (a, b) = match i.opcode {
            0x84 | 0x85 => (self.rm_read(i, w)?, self.reg_read(i.reg(), w)),
            0xA8 | 0xA9 => (self.reg_read(EAX, w), i.imm),
            _ => (self.rm_read(i, w)?, i.imm),
        };
        self.alu(AluOp::And, w, a, b);
        Ok(Flow::Next)
    }

    pub(super) fn inc_dec(&mut self, w: Width, v: u32, inc: bool) -> u32 {
        if inc {
            let r = v.wrapping_add(1) & w.mask();
            self.state.flags.record_inc_dec(CcOp::Inc(w), r);
            r
        } else {
            let r = v.wrapping_sub(1) & w.mask();
            self.state.flags.record_inc_dec(CcOp::Dec(w), r);
            r
        }
    }

    /// 40-4F: INC/DEC of a full-size register.
    pub(super) fn exec_inc_dec_reg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let r = usize::from(i.opcode & 7);
        let w = i.op_width();
        let v = self.reg_read(r, w);
        let res = self.inc_dec(w, v, i.opcode < 0x48);
        self.reg_write(r, w, res);
        Ok(Flow::Next)
    }

    /// Group 2 shifts and rotates: C0/C1 by imm8, D0/D1 by one, D2/D3 by CL.
    pub(super) fn exec_group2(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.width_from_low_bit();
        let count = match i.opcode {
            0xC0 | 0xC1 => i.imm,
            0xD0 | 0xD1 => 1,
            _ => self.state.regs[ECX],
        } & 0x1F;
        if count == 0 {
            // Reads still fault even though nothing changes.
            self.rm_read(i, w)?;
            return Ok(Flow::Next);
        }
        let kind = i.reg();
        self.rm_modify(i, w, |cpu, v| cpu.shift(kind, w, v, count))?;
        Ok(Flow::Next)
    }

    /// One shift or rotate by a non-zero `count` (already masked to 5 bits).
    fn shift(&mut self, kind: usize, w: Width, v: u32, count: u32) -> u32 {
        let bits = w.bits();
        let m = w.mask();
        let msb = |x: u32| (x >> (bits - 1)) & 1 != 0;
        match kind {
            0 | 1 => {
                let n = count % bits;
                let r = if n == 0 {
                    v
                } else if kind == 0 {
                    ((v << n) | (v >> (bits - n))) & m
                } else {
                    ((v >> n) | (v << (bits - n))) & m
                };
                let (cf, of) = if kind == 0 {
                    let cf = r & 1 != 0;
                    (cf, msb(r) ^ cf)
                } else {
                    (msb(r), msb(r) ^ ((r >> (bits - 2)) & 1 != 0))
                };
                self.set_cf_of(cf, of);
                r
            }
            2 | 3 => {
                let n = count % (bits + 1);
                if n == 0 {
                    return v;
                }
                let mut cf = self.state.flags.cf();
                let mut r = v;
                for _ in 0..n {
                    if kind == 2 {
                        let out = msb(r);
                        r = ((r << 1) | u32::from(cf)) & m;
                        cf = out;
                    } else {
                        let out = r & 1 != 0;
                        r = (r >> 1) | (u32::from(cf) << (bits - 1));
                        cf = out;
                    }
                }
                let of = if kind == 2 {
                    msb(r) ^ cf
                } else {
                    msb(r) ^ ((r >> (bits - 2)) & 1 != 0)
                };
                self.set_cf_of(cf, of);
                r
            }
            4 | 6 => {
                let wide = u64::from(v) << count;
                let r = (wide as u32) & m;
                let cf = ((wide >> bits) & 1) as u32;
                self.state.flags.record(CcOp::Shl(w), r, cf);
                r
            }
            5 => {
                let r = v >> count;
                let cf = (v >> (count - 1)) & 1;
                self.state.flags.record(CcOp::Shr(w), r, cf);
                r
            }
            _ => {
                let sv = w.sign_extend(v) as i32;
                let r = ((sv >> count) as u32) & m;
                let cf = ((sv >> (count - 1)) & 1) as u32;
                self.state.flags.record(CcOp::Sar(w), r, cf);
                r
            }
        }
    }

    /// SHLD/SHRD (0F A4/A5/AC/AD).
    pub(super) fn exec_double_shift(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let bits = w.bits();
        let count = if matches!(i.opcode, 0x1A4 | 0x1AC) {
            i.imm
        } else {
            self.state.regs[ECX]
        } & 0x1F;
        if count == 0 {
            self.rm_read(i, w)?;
            return Ok(Flow::Next);
        }
        let src = self.reg_read(i.reg(), w);
        let left = i.opcode < 0x1A8;
        self.rm_modify(i, w, |cpu, dst| {
            let m = w.mask();
            if left {
                let wide = (u128::from(dst) << bits) | u128::from(src);
                let shifted = wide << count;
                let r = ((shifted >> bits) as u32) & m;
                let cf = ((shifted >> (2 * bits)) & 1) as u32;
                cpu.state.flags.record(CcOp::Shl(w), r, cf);
                r
            } else {
                let wide = (u64::from(src) << bits) | u64::from(dst);
                let r = ((wide >> count) as u32) & m;
                let cf = ((wide >> (count - 1)) & 1) as u32;
                cpu.state.flags.record(CcOp::Shr(w), r, cf);
                let of = (r ^ dst) & w.sign_bit() != 0;
                cpu.set_flag(FLAG_OF, of);
                r
            }
        })?;
        Ok(Flow::Next)
    }

    /// Group 3 (F6/F7): TEST, NOT, NEG, MUL, IMUL, DIV, IDIV.
    pub(super) fn exec_group3(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.width_from_low_bit();
        match i.reg() {
            0 | 1 => return self.exec_test(i),
            2 => self.rm_modify(i, w, |_, v| !v & w.mask())?,
            3 => self.rm_modify(i, w, |cpu, v| {
                let r = 0u32.wrapping_sub(v) & w.mask();
                cpu.state.flags.record(CcOp::Sub(w), r, v & w.mask());
                r
            })?,
            4 => {
                let src = self.rm_read(i, w)?;
                self.mul(w, src, false);
            }
            5 => {
                let src = self.rm_read(i, w)?;
                self.mul(w, src, true);
            }
            6 => {
                let src = self.rm_read(i, w)?;
                self.div(w, src)?;
            }
            _ => {
                let src = self.rm_read(i, w)?;
                self.idiv(w, src)?;
            }
        }
        Ok(Flow::Next)
    }

    /// One-operand MUL/IMUL into AX, DX:AX or EDX:EAX.
    fn mul(&mut self, w: Width, src: u32, signed: bool) {
        let acc = self.reg_read(EAX, w);
        let (lo, hi, overflow) = match w {
            Width::Byte => {
                let p = if signed {
                    (i32::from(acc as u8 as i8) * i32::from(src as u8 as i8)) as u32
                } else {
                    acc * src
                };
                self.state.set_reg16(EAX, p as u16);
                let lo = p & 0xFF;
                let overflow = if signed {
                    Width::Byte.sign_extend(lo) & 0xFFFF != p & 0xFFFF
                } else {
                    p & 0xFF00 != 0
                };
                (lo, 0, overflow)
            }
            Width::Word => {
                let p = if signed {
                    (i32::from(acc as u16 as i16) * i32::from(src as u16 as i16)) as u32
                } else {
                    acc * src
                };
                let (lo, hi) = (p & 0xFFFF, p >> 16);
                let overflow = if signed {
                    Width::Word.sign_extend(lo) != p
                } else {
                    hi != 0
                };
                (lo, hi, overflow)
            }
            Width::Dword => {
                let p = if signed {
                    (i64::from(acc as i32) * i64::from(src as i32)) as u64
                } else {
                    u64::from(acc) * u64::from(src)
                };
                let (lo, hi) = (p as u32, (p >> 32) as u32);
                let overflow = if signed {
                    i64::from(lo as i32) as u64 != p
                } else {
                    hi != 0
                };
                (lo, hi, overflow)
            }
        };
        if w != Width::Byte {
            self.reg_write(EAX, w, lo);
            self.reg_write(EDX, w, hi);
        }
        self.state.flags.record(CcOp::Mul(w), lo, u32::from(overflow));
    }

    fn div(&mut self, w: Width, divisor: u32) -> Result<(), Exception> {
        if divisor == 0 {
            return Err(Exception::DivideError);
        }
        match w {
            Width::Byte => {
                let n = self.state.regs[EAX] & 0xFFFF;
                let (q, r) = (n / divisor, n % divisor);
                if q > 0xFF {
                    return Err(Exception::DivideError);
                }
                self.state.set_reg16(EAX, ((r << 8) | q) as u16);
            }
            Width::Word => {
                let n = ((self.state.regs[EDX] & 0xFFFF) << 16) | (self.state.regs[EAX] & 0xFFFF);
                let (q, r) = (n / divisor, n % divisor);
                if q > 0xFFFF {
                    return Err(Exception::DivideError);
                }
                self.state.set_reg16(EAX, q as u16);
                self.state.set_reg16(EDX, r as u16);
            }
            Width::Dword => {
                let n = (u64::from(self.state.regs[EDX]) << 32) | u64::from(self.state.regs[EAX]);
                let d = u64::from(divisor);
                let q = n / d;
                if q > u64::from(u32::MAX) {
                    return Err(Exception::DivideError);
                }
                self.state.regs[EAX] = q as u32;
                self.state.regs[EDX] = (n % d) as u32;
            }
        }
        Ok(())
    }

    fn idiv(&mut self, w: Width, divisor: u32) -> Result<(), Exception> {
        let d = i64::from(w.sign_extend(divisor) as i32);
        if d == 0 {
            return Err(Exception::DivideError);
        }
        let n = match w {
            Width::Byte => i64::from(self.state.regs[EAX] as u16 as i16),
            Width::Word => {
                i64::from((((self.state.regs[EDX] & 0xFFFF) << 16) | (self.state.regs[EAX] & 0xFFFF)) as i32)
            }
            Width::Dword => ((u64::from(self.state.regs[EDX]) << 32) | u64::from(self.state.regs[EAX])) as i64,
        };
        let q = n.checked_div(d).ok_or(Exception::DivideError)?;
        let r = n.checked_rem(d).ok_or(Exception::DivideError)?;
        let limit = i64::from(w.sign_bit());
        if q >= limit || q < -limit {
            return Err(Exception::DivideError);
        }
        match w {
            Width::Byte => self.state.set_reg16(EAX, (((r as u32 & 0xFF) << 8) | (q as u32 & 0xFF)) as u16),
            Width::Word => {
                self.state.set_reg16(EAX, q as u16);
                self.state.set_reg16(EDX, r as u16);
            }
            Width::Dword => {
                self.state.regs[EAX] = q as u32;
                self.state.regs[EDX] = r as u32;
            }
        }
        Ok(())
    }

    /// Two- and three-operand IMUL (0F AF, 69, 6B).
    pub(super) fn exec_imul(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let a = self.rm_read(i, w)?;
        let (a, b) = match i.opcode {
            0x1AF => (self.reg_read(i.reg(), w), a),
            0x69 => (a, i.imm),
            _ => (a, imm_sx8(i, w)),
        };
        let full = i64::from(w.sign_extend(a) as i32) * i64::from(w.sign_extend(b) as i32);
        let r = (full as u32) & w.mask();
        let overflow = i64::from(w.sign_extend(r) as i32) != full;
        self.reg_write(i.reg(), w, r);
        self.state.flags.record(CcOp::Mul(w), r, u32::from(overflow));
        Ok(Flow::Next)
    }

    /// DAA, DAS, AAA, AAS, AAM, AAD and SALC.
    pub(super) fn exec_bcd(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let al = self.state.reg8(0);
        let cf = self.state.flags.cf();
        let af = self.state.flags.af();
        match i.opcode {
            0x27 | 0x2F => {
                let daa = i.opcode == 0x27;
                let mut r = al;
                let mut new_cf = false;
                let new_af = (al & 0xF) > 9 || af;
                if new_af {
                    let (v, carry) = if daa {
                        al.overflowing_add(6)
                    } else {
                        al.overflowing_sub(6)
                    };
                    r = v;
                    new_cf = !daa && (cf || carry);
                }
                if al > 0x99 || cf {
                    r = if daa { r.wrapping_add(0x60) } else { r.wrapping_sub(0x60) };
                    new_cf = true;
                }
                self.state.set_reg8(0, r);
                self.set_szp_byte(r, new_cf, new_af);
            }
            0x37 | 0x3F => {
                let adjust = (al & 0xF) > 9 || af;
                let mut ax = self.state.regs[EAX] as u16;
                if adjust {
                    ax = if i.opcode == 0x37 {
                        ax.wrapping_add(0x106)
                    } else {
                        ax.wrapping_sub(6).wrapping_sub(0x100)
                    };
                }
                ax &= 0xFF0F;
                self.state.set_reg16(EAX, ax);
                self.set_szp_byte(ax as u8, adjust, adjust);
            }
            0xD4 => {
                let base = i.imm as u8;
                if base == 0 {
                    return Err(Exception::DivideError);
                }
                let r = al % base;
                self.state.set_reg16(EAX, (u16::from(al / base) << 8) | u16::from(r));
                self.alu(AluOp::Or, Width::Byte, u32::from(r), 0);
            }
            0xD5 => {
                let ah = self.state.reg8(4);
                let r = al.wrapping_add(ah.wrapping_mul(i.imm as u8));
                self.state.set_reg16(EAX, u16::from(r));
                self.alu(AluOp::Or, Width::Byte, u32::from(r), 0);
            }
            _ => self.state.set_reg8(0, if cf { 0xFF } else { 0 }),
        }
        Ok(Flow::Next)
    }

    fn set_szp_byte(&mut self, r: u8, cf: bool, af: bool) {
        self.alu(AluOp::Or, Width::Byte, u32::from(r), 0);
        let f = self.state.flags.compute() & !(FLAG_CF | FLAG_AF | FLAG_OF);
        let f = f | if cf { FLAG_CF } else { 0 } | if af { FLAG_AF } else { 0 };
        self.state.flags.set_materialized(f);
    }

    /// BT, BTS, BTR, BTC with a register (0F A3/AB/B3/BB) or immediate (0F BA) bit offset.
    pub(super) fn exec_bit_test(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let bits = w.bits();
        let (kind, offset) = if i.opcode == 0x1BA {
            (i.reg() - 4, i.imm)
        } else {
            (usize::from((i.opcode >> 3) & 3), self.reg_read(i.reg(), w))
        };
        let bit = offset & (bits - 1);
        let apply = |v: u32| match kind {
            1 => v | (1 << bit),
            2 => v & !(1 << bit),
            3 => v ^ (1 << bit),
            _ => v,
        };

        let old = if i.mem.is_some() {
            let (seg, mut off) = self.mem_addr(i)?;
            if i.opcode != 0x1BA {
                // Register bit offsets are signed and may address outside the operand.
                let disp = (w.sign_extend(offset) as i32 >> (bits.trailing_zeros())) * w.bytes() as i32;
                off = off.wrapping_add(disp as u32);
                if !i.addr32 {
                    off &= 0xFFFF;
                }
            }
            if kind == 0 {
                self.read_mem(seg, off, w)?
            } else {
                self.check_writable(seg, off, w)?;
                let v = self.read_mem(seg, off, w)?;
                self.write_mem(seg, off, w, apply(v))?;
                v
            }
        } else {
            let v = self.reg_read(i.rm(), w);
            if kind != 0 {
                self.reg_write(i.rm(), w, apply(v));
            }
            v
        };
        self.set_flag(FLAG_CF, (old >> bit) & 1 != 0);
        Ok(Flow::Next)
    }

    /// BSF/BSR (0F BC/BD). A zero source sets ZF and leaves the destination unchanged.
    pub(super) fn exec_bit_scan(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let src = self.rm_read(i, w)?;
        if src == 0 {
            self.set_flag(FLAG_ZF, true);
            return Ok(Flow::Next);
        }
        let idx = if i.opcode == 0x1BC {
            src.trailing_zeros()
        } else {
            31 - src.leading_zeros()
        };
        self.reg_write(i.reg(), w, idx);
        self.set_flag(FLAG_ZF, false);
        Ok(Flow::Next)
    }

    /// CMPXCHG (0F B0/B1).
    pub(super) fn exec_cmpxchg(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.width_from_low_bit();
        let src = self.reg_read(i.reg(), w);
        let acc = self.reg_read(EAX, w);
        let mut current = 0;
        self.rm_modify(i, w, |cpu, dst| {
            current = dst;
            cpu.alu(AluOp::Cmp, w, acc, dst);
            if acc == dst {
                src
            } else {
                dst
            }
        })?;
        if acc != current {
            self.reg_write(EAX, w, current);
        }
        Ok(Flow::Next)
    }

    /// XADD (0F C0/C1).
    pub(super) fn exec_xadd(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.width_from_low_bit();
        let src = self.reg_read(i.reg(), w);
        let reg = i.reg();
        self.rm_modify(i, w, |cpu, dst| {
            let sum = cpu.alu(AluOp::Add, w, dst, src);
            cpu.reg_write(reg, w, dst);
            sum
        })?;
        Ok(Flow::Next)
    }

    /// CMPXCHG8B m64 (0F C7 /1).
    pub(super) fn exec_cmpxchg8b(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let (seg, off) = self.mem_addr(i)?;
        self.check_writable(seg, off, Width::Dword)?;
        self.check_writable(seg, off.wrapping_add(4), Width::Dword)?;
        let lo = self.seg_read_u32(seg, off)?;
        let hi = self.seg_read_u32(seg, off.wrapping_add(4))?;
        let equal = lo == self.state.regs[EAX] && hi == self.state.regs[EDX];
        if equal {
            self.seg_write_u32(seg, off, self.state.regs[EBX])?;
            self.seg_write_u32(seg, off.wrapping_add(4), self.state.regs[ECX])?;
        } else {
            self.seg_write_u32(seg, off, lo)?;
            self.seg_write_u32(seg, off.wrapping_add(4), hi)?;
            self.state.regs[EAX] = lo;
            self.state.regs[EDX] = hi;
        }
        self.set_flag(FLAG_ZF, equal);
        Ok(Flow::Next)
    }

    /// SETcc r/m8 (0F 90-9F).
    pub(super) fn exec_setcc(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let v = self.state.flags.condition((i.opcode & 0xF) as u8);
        self.rm_write(i, Width::Byte, u32::from(v))?;
        Ok(Flow::Next)
    }

    /// CMOVcc (0F 40-4F). The source is read even when the condition is false.
    pub(super) fn exec_cmovcc(&mut self, i: &Instr) -> Result<Flow, Exception> {
        let w = i.op_width();
        let v = self.rm_read(i, w)?;
        if self.state.flags.condition((i.opcode & 0xF) as u8) {
            self.reg_write(i.reg(), w, v);
        }
        Ok(Flow::Next)
    }
}
