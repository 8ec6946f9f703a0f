//! Register and memory operand access for decoded instructions.

use lin86_mmu::AccessKind;

use super::decode::{Instr, MemOperand};
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::Width;
use crate::state::SegReg;

impl Cpu {
    /// Offset part of a memory operand, wrapped to the address size.
    pub(super) fn effective_offset(&self, i: &Instr, m: &MemOperand) -> u32 {
        let mut ea = m.disp;
        if let Some(b) = m.base {
            ea = ea.wrapping_add(self.state.regs[usize::from(b)]);
        }
        if let Some(x) = m.index {
            ea = ea.wrapping_add(self.state.regs[usize::from(x)] << m.scale);
        }
        if i.addr32 {
            ea
        } else {
            ea & 0xFFFF
        }
    }

    /// Segment and offset of the instruction's memory operand.
    pub(super) fn mem_addr(&self, i: &Instr) -> Result<(SegReg, u32), Exception> {
        let m = i.mem.as_ref().ok_or(Exception::InvalidOpcode)?;
        Ok((i.seg_or(m.default_seg), self.effective_offset(i, m)))
    }

    pub(super) fn read_mem(&mut self, seg: SegReg, off: u32, w: Width) -> Result<u32, Exception> {
        Ok(match w {
            Width::Byte => u32::from(self.seg_read_u8(seg, off)?),
            Width::Word => u32::from(self.seg_read_u16(seg, off)?),
            Width::Dword => self.seg_read_u32(seg, off)?,
        })
    }

    pub(super) fn write_mem(&mut self, seg: SegReg, off: u32, w: Width, val: u32) -> Result<(), Exception> {
        match w {
            Width::Byte => self.seg_write_u8(seg, off, val as u8),
            Width::Word => self.seg_write_u16(seg, off, val as u16),
            Width::Dword => self.seg_write_u32(seg, off, val),
        }
    }

    /// Checks that every page of a `w`-sized store at `seg:off` is writable without storing.
    pub(super) fn check_writable(&mut self, seg: SegReg, off: u32, w: Width) -> Result<(), Exception> {
        let la = self.state.linear(seg, off);
        let user = self.user();
        self.translate(la, AccessKind::Write, user)?;
        let last = la.wrapping_add(w.bytes() - 1);
        if last & !0xFFF != la & !0xFFF {
            self.translate(last, AccessKind::Write, user)?;
        }
        Ok(())
    }

    #[inline]
    pub(super) fn reg_read(&self, r: usize, w: Width) -> u32 {
        match w {
            Width::Byte => u32::from(self.state.reg8(r)),
            Width::Word => self.state.regs[r] & 0xFFFF,
            Width::Dword => self.state.regs[r],
        }
    }

    #[inline]
    pub(super) fn reg_write(&mut self, r: usize, w: Width, val: u32) {
        match w {
            Width::Byte => self.state.set_reg8(r, val as u8),
            Width::Word => self.state.set_reg16(r, val as u16),
            Width::Dword => self.state.regs[r] = val,
        }
    }

    pub(super) fn rm_read(&mut self, i: &Instr, w: Width) -> Result<u32, Exception> {
        if i.mem.is_some() {
            let (seg, off) = self.mem_addr(i)?;
            self.read_mem(seg, off, w)
        } else {
            Ok(self.reg_read(i.rm(), w))
        }
    }

    pub(super) fn rm_write(&mut self, i: &Instr, w: Width, val: u32) -> Result<(), Exception> {
        if i.mem.is_some() {
            let (seg, off) = self.mem_addr(i)?;
            self.write_mem(seg, off, w, val)
        } else {
            self.reg_write(i.rm(), w, val);
            Ok(())
        }
    }

    /// Read-modify-write of the r/m operand. Memory destinations are checked for write access
    /// before the read so a fault leaves both memory and registers untouched.
    pub(super) fn rm_modify(
        &mut self,
        i: &Instr,
        w: Width,
        op: impl FnOnce(&mut Self, u32) -> u32,
    ) -> Result<(), Exception> {
        if i.mem.is_some() {
            let (seg, off) = self.mem_addr(i)?;
            self.check_writable(seg, off, w)?;
            let old = self.read_mem(seg, off, w)?;
            let new = op(self, old);
            self.write_mem(seg, off, w, new)
        } else {
            let old = self.reg_read(i.rm(), w);
            let new = op(self, old);
            self.reg_write(i.rm(), w, new);
            Ok(())
        }
    }

    /// Relative branch target, wrapped to 16 bits for 16-bit operand size.
    #[inline]
    pub(super) fn branch_target(&self, i: &Instr, rel: u32) -> u32 {
        let target = self.state.eip.wrapping_add(rel);
        if i.op32 {
            target
        } else {
            target & 0xFFFF
        }
    }
}

/// Sign-extended 8-bit immediate at the operand width.
#[inline]
pub(super) fn imm_sx8(i: &Instr, w: Width) -> u32 {
    Width::Byte.sign_extend(i.imm) & w.mask()
}
