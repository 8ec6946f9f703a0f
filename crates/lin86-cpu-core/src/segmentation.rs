//! Selector resolution against the GDT/LDT, and the protection checks done when a segment
//! register, LDTR or TR is loaded.

use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::state::{
    SegReg, Segment, DESC_A, DESC_ATTR_MASK, DESC_C, DESC_CODE, DESC_DPL_SHIFT, DESC_G, DESC_P, DESC_R,
    DESC_S, DESC_TYPE_SHIFT, DESC_W,
};

/// System descriptor types (S = 0).
pub(crate) const SYS_TSS16_AVAIL: u32 = 1;
pub(crate) const SYS_LDT: u32 = 2;
pub(crate) const SYS_TSS16_BUSY: u32 = 3;
pub(crate) const SYS_CALL_GATE16: u32 = 4;
pub(crate) const SYS_TASK_GATE: u32 = 5;
pub(crate) const SYS_INT_GATE16: u32 = 6;
pub(crate) const SYS_TRAP_GATE16: u32 = 7;
pub(crate) const SYS_TSS32_AVAIL: u32 = 9;
pub(crate) const SYS_TSS32_BUSY: u32 = 11;
pub(crate) const SYS_CALL_GATE32: u32 = 12;
pub(crate) const SYS_INT_GATE32: u32 = 14;
pub(crate) const SYS_TRAP_GATE32: u32 = 15;

const TSS_BUSY_BIT: u32 = 1 << 9;

/// Raw 8-byte descriptor as read from a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub lo: u32,
    pub hi: u32,
}

impl Descriptor {
    pub fn base(&self) -> u32 {
        (self.lo >> 16) | ((self.hi & 0xFF) << 16) | (self.hi & 0xFF00_0000)
    }

    pub fn limit(&self) -> u32 {
        let raw = (self.lo & 0xFFFF) | (self.hi & 0x000F_0000);
        if self.hi & DESC_G != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn dpl(&self) -> u8 {
        ((self.hi >> DESC_DPL_SHIFT) & 3) as u8
    }

    pub fn present(&self) -> bool {
        self.hi & DESC_P != 0
    }

    /// Code or data segment (as opposed to a system descriptor or gate).
    pub fn is_segment(&self) -> bool {
        self.hi & DESC_S != 0
    }

    pub fn is_code(&self) -> bool {
        self.is_segment() && self.hi & DESC_CODE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.hi & DESC_C != 0
    }

    pub fn is_readable(&self) -> bool {
        !self.is_code() || self.hi & DESC_R != 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_segment() && self.hi & DESC_CODE == 0 && self.hi & DESC_W != 0
    }

    pub fn system_type(&self) -> u32 {
        (self.hi >> DESC_TYPE_SHIFT) & 0xF
    }

    pub fn to_segment(&self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            flags: self.hi & DESC_ATTR_MASK,
        }
    }

    /// Gate target `(selector, offset)`; 16-bit gates only carry the low offset word.
    pub fn gate_target(&self) -> (u16, u32) {
        let selector = (self.lo >> 16) as u16;
        let offset = (self.lo & 0xFFFF) | (self.hi & 0xFFFF_0000);
        if self.system_type() & 8 != 0 {
            (selector, offset)
        } else {
            (selector, offset & 0xFFFF)
        }
    }
}

#[inline]
pub(crate) fn is_null(selector: u16) -> bool {
    selector & 0xFFFC == 0
}

#[inline]
fn gp_sel(selector: u16) -> Exception {
    Exception::GeneralProtection(selector & 0xFFFC)
}

impl Cpu {
    /// Linear address of the descriptor for `selector`, or `None` when it lies beyond the table
    /// limit.
    fn descriptor_addr(&self, selector: u16) -> Option<u32> {
        let (base, limit) = if selector & 4 != 0 {
            let ldt = self.state.seg(SegReg::Ldtr);
            (ldt.base, ldt.limit)
        } else {
            (self.state.gdt.base, u32::from(self.state.gdt.limit))
        };
        let index = u32::from(selector & !7);
        if index + 7 > limit {
            return None;
        }
        Some(base.wrapping_add(index))
    }

    /// Reads the descriptor for `selector`; out-of-table selectors fault with #GP(selector).
    pub(crate) fn read_descriptor(&mut self, selector: u16) -> Result<Descriptor, Exception> {
        let addr = self.descriptor_addr(selector).ok_or(gp_sel(selector))?;
        Ok(Descriptor {
            lo: self.read_sys_u32(addr)?,
            hi: self.read_sys_u32(addr.wrapping_add(4))?,
        })
    }

    fn write_descriptor_hi(&mut self, selector: u16, hi: u32) -> Result<(), Exception> {
        let addr = self.descriptor_addr(selector).ok_or(gp_sel(selector))?;
        self.write_u32_as(addr.wrapping_add(4), hi, false)
    }

    /// Sets the accessed bit of a descriptor in its table the first time it is loaded.
    fn mark_accessed(&mut self, selector: u16, desc: &mut Descriptor) -> Result<(), Exception> {
        if desc.hi & DESC_A == 0 {
            desc.hi |= DESC_A;
            self.write_descriptor_hi(selector, desc.hi)?;
        }
        Ok(())
    }

    /// Loads a data or stack segment register (ES, SS, DS, FS, GS).
    ///
    /// Real mode just shifts the selector into the base. Protected mode resolves the selector and
    /// applies the presence, type and privilege checks, faulting with #GP, #SS or #NP.
    pub fn load_segment(&mut self, seg: SegReg, selector: u16) -> Result<(), Exception> {
        if !self.protected_mode() {
            self.load_real_segment(seg, selector);
            return Ok(());
        }
        let cpl = self.state.cpl;
        let rpl = (selector & 3) as u8;

        match seg {
            SegReg::Ss => {
                if is_null(selector) {
                    return Err(Exception::gp0());
                }
                let mut desc = self.read_descriptor(selector)?;
                if rpl != cpl || !desc.is_writable_data() || desc.dpl() != cpl {
                    return Err(gp_sel(selector));
                }
                if !desc.present() {
                    return Err(Exception::StackFault(selector & 0xFFFC));
                }
                self.mark_accessed(selector, &mut desc)?;
                *self.state.seg_mut(seg) = desc.to_segment(selector);
            }
            SegReg::Es | SegReg::Ds | SegReg::Fs | SegReg::Gs => {
                if is_null(selector) {
                    *self.state.seg_mut(seg) = Segment {
                        selector,
                        ..Segment::default()
                    };
                    self.state.update_flat();
                    return Ok(());
                }
                let mut desc = self.read_descriptor(selector)?;
                if !desc.is_segment() || !desc.is_readable() {
                    return Err(gp_sel(selector));
                }
                if !desc.is_conforming() && (desc.dpl() < cpl || desc.dpl() < rpl) {
                    return Err(gp_sel(selector));
                }
                if !desc.present() {
                    return Err(Exception::SegmentNotPresent(selector & 0xFFFC));
                }
                self.mark_accessed(selector, &mut desc)?;
                *self.state.seg_mut(seg) = desc.to_segment(selector);
            }
            SegReg::Cs | SegReg::Ldtr | SegReg::Tr => return Err(Exception::InvalidOpcode),
        }
        self.state.update_flat();
        Ok(())
    }

    /// Installs a CS descriptor that has already passed the transfer's checks and sets CPL.
    pub(crate) fn set_code_segment(&mut self, selector: u16, desc: &Descriptor, cpl: u8) {
        let sel = (selector & !3) | u16::from(cpl);
        *self.state.seg_mut(SegReg::Cs) = desc.to_segment(sel);
        self.state.cpl = cpl;
        self.state.update_flat();
    }

    pub(crate) fn set_stack_segment(&mut self, selector: u16, desc: &Descriptor) {
        *self.state.seg_mut(SegReg::Ss) = desc.to_segment(selector);
        self.state.update_flat();
    }

    /// Validates the SS a privilege transition switches to: it must be a present, writable data
    /// segment whose RPL and DPL both equal `cpl`. `fault` builds the exception for a bad
    /// selector (#GP for returns, #TS for inner-stack loads from the TSS).
    pub(crate) fn check_new_ss(
        &mut self,
        selector: u16,
        cpl: u8,
        fault: fn(u16) -> Exception,
    ) -> Result<Descriptor, Exception> {
        if is_null(selector) {
            return Err(fault(selector & 0xFFFC));
        }
        if (selector & 3) as u8 != cpl {
            return Err(fault(selector & 0xFFFC));
        }
        let desc = match self.read_descriptor(selector) {
            Ok(desc) => desc,
            Err(Exception::GeneralProtection(_)) => return Err(fault(selector & 0xFFFC)),
            Err(e) => return Err(e),
        };
        if !desc.is_writable_data() || desc.dpl() != cpl {
            return Err(fault(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::StackFault(selector & 0xFFFC));
        }
        Ok(desc)
    }

    /// After a return to an outer privilege level, data segment registers that the new CPL may
    /// not use are nulled.
    pub(crate) fn null_inaccessible_segments(&mut self) {
        let cpl = self.state.cpl;
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let s = self.state.seg(seg);
            if !s.is_conforming_code() && s.dpl() < cpl {
                *self.state.seg_mut(seg) = Segment::default();
            }
        }
        self.state.update_flat();
    }

    /// LLDT.
    pub(crate) fn lldt(&mut self, selector: u16) -> Result<(), Exception> {
        if is_null(selector) {
            *self.state.seg_mut(SegReg::Ldtr) = Segment::default();
            return Ok(());
        }
        if selector & 4 != 0 {
            return Err(gp_sel(selector));
        }
        let desc = self.read_descriptor(selector)?;
        if desc.is_segment() || desc.system_type() != SYS_LDT {
            return Err(gp_sel(selector));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & 0xFFFC));
        }
        *self.state.seg_mut(SegReg::Ldtr) = desc.to_segment(selector);
        Ok(())
    }

    /// LTR: loads TR from an available TSS descriptor and marks it busy.
    pub(crate) fn ltr(&mut self, selector: u16) -> Result<(), Exception> {
        if is_null(selector) || selector & 4 != 0 {
            return Err(gp_sel(selector));
        }
        let desc = self.read_descriptor(selector)?;
        let ty = desc.system_type();
        if desc.is_segment() || (ty != SYS_TSS16_AVAIL && ty != SYS_TSS32_AVAIL) {
            return Err(gp_sel(selector));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & 0xFFFC));
        }
        self.write_descriptor_hi(selector, desc.hi | TSS_BUSY_BIT)?;
        let busy = Descriptor {
            lo: desc.lo,
            hi: desc.hi | TSS_BUSY_BIT,
        };
        *self.state.seg_mut(SegReg::Tr) = busy.to_segment(selector);
        Ok(())
    }

    /// SS:ESP for privilege level `dpl`, read from the current TSS.
    pub(crate) fn tss_stack(&mut self, dpl: u8) -> Result<(u16, u32), Exception> {
        let tr = *self.state.seg(SegReg::Tr);
        let ty = tr.system_type();
        let is32 = match ty {
            SYS_TSS32_AVAIL | SYS_TSS32_BUSY => true,
            SYS_TSS16_AVAIL | SYS_TSS16_BUSY => false,
            _ => return Err(Exception::InvalidTss(tr.selector & 0xFFFC)),
        };
        let dpl = u32::from(dpl);
        if is32 {
            let off = 4 + dpl * 8;
            if off + 5 > tr.limit {
                return Err(Exception::InvalidTss(tr.selector & 0xFFFC));
            }
            let esp = self.read_sys_u32(tr.base.wrapping_add(off))?;
            let ss = self.read_sys_u16(tr.base.wrapping_add(off + 4))?;
            Ok((ss, esp))
        } else {
            let off = 2 + dpl * 4;
            if off + 3 > tr.limit {
                return Err(Exception::InvalidTss(tr.selector & 0xFFFC));
            }
            let sp = self.read_sys_u16(tr.base.wrapping_add(off))?;
            let ss = self.read_sys_u16(tr.base.wrapping_add(off + 2))?;
            Ok((ss, u32::from(sp)))
        }
    }

    /// Access-rights check shared by LAR, LSL, VERR and VERW: `None` when the selector is not
    /// visible at the current privilege level (ZF is then cleared).
    pub(crate) fn visible_descriptor(&mut self, selector: u16) -> Result<Option<Descriptor>, Exception> {
        if is_null(selector) || self.descriptor_addr(selector).is_none() {
            return Ok(None);
        }
        let desc = self.read_descriptor(selector)?;
        let rpl = (selector & 3) as u8;
        if !desc.is_conforming() && (desc.dpl() < self.state.cpl || desc.dpl() < rpl) {
            return Ok(None);
        }
        Ok(Some(desc))
    }
}

/// System descriptor types LAR accepts (LSL additionally rejects gates, which have no limit).
pub(crate) fn lar_type_ok(desc: &Descriptor) -> bool {
    desc.is_segment()
        || matches!(
            desc.system_type(),
            SYS_TSS16_AVAIL
                | SYS_LDT
                | SYS_TSS16_BUSY
                | SYS_CALL_GATE16
                | SYS_TASK_GATE
                | SYS_TSS32_AVAIL
                | SYS_TSS32_BUSY
                | SYS_CALL_GATE32
        )
}

pub(crate) fn lsl_type_ok(desc: &Descriptor) -> bool {
    desc.is_segment()
        || matches!(
            desc.system_type(),
            SYS_TSS16_AVAIL | SYS_LDT | SYS_TSS16_BUSY | SYS_TSS32_AVAIL | SYS_TSS32_BUSY
        )
}
