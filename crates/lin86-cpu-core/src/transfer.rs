//! Far control transfers: JMP/CALL through a code segment or call gate, RETF and the
//! protected-mode half of IRET.

use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::interrupts::FrameWriter;
use crate::segmentation::{
    is_null, Descriptor, SYS_CALL_GATE16, SYS_CALL_GATE32, SYS_TASK_GATE, SYS_TSS16_AVAIL,
    SYS_TSS32_AVAIL,
};
use crate::state::{SegReg, ESP, FLAG_VM};

fn gp_sel(selector: u16) -> Exception {
    Exception::GeneralProtection(selector & 0xFFFC)
}

fn np_sel(selector: u16) -> Exception {
    Exception::SegmentNotPresent(selector & 0xFFFC)
}

impl Cpu {
    /// Checks a code segment reached directly by JMP or CALL (no gate).
    fn check_direct_code(&self, selector: u16, desc: &Descriptor) -> Result<(), Exception> {
        let cpl = self.state.cpl;
        let rpl = (selector & 3) as u8;
        if desc.is_conforming() {
            if desc.dpl() > cpl {
                return Err(gp_sel(selector));
            }
        } else if rpl > cpl || desc.dpl() != cpl {
            return Err(gp_sel(selector));
        }
        if !desc.present() {
            return Err(np_sel(selector));
        }
        Ok(())
    }

    /// Reads a call gate's target code descriptor and checks it may be entered from `cpl`.
    fn gate_target_code(&mut self, gate: &Descriptor) -> Result<(u16, u32, Descriptor), Exception> {
        let (selector, offset) = gate.gate_target();
        if is_null(selector) {
            return Err(Exception::gp0());
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_code() || desc.dpl() > self.state.cpl {
            return Err(gp_sel(selector));
        }
        if !desc.present() {
            return Err(np_sel(selector));
        }
        Ok((selector, offset, desc))
    }

    /// Reads a gate descriptor for JMP/CALL and applies the gate's own privilege checks.
    fn check_call_gate(&self, selector: u16, gate: &Descriptor) -> Result<(), Exception> {
        let rpl = (selector & 3) as u8;
        if gate.dpl() < self.state.cpl || gate.dpl() < rpl {
            return Err(gp_sel(selector));
        }
        if !gate.present() {
            return Err(np_sel(selector));
        }
        Ok(())
    }

    pub(crate) fn jmp_far(&mut self, selector: u16, offset: u32, op32: bool) -> Result<(), Exception> {
        let offset = if op32 { offset } else { offset & 0xFFFF };
        if !self.protected_mode() {
            self.load_real_segment(SegReg::Cs, selector);
            self.state.eip = offset;
            return Ok(());
        }
        if is_null(selector) {
            return Err(Exception::gp0());
        }
        let cpl = self.state.cpl;
        let desc = self.read_descriptor(selector)?;
        if desc.is_segment() {
            if !desc.is_code() {
                return Err(gp_sel(selector));
            }
            self.check_direct_code(selector, &desc)?;
            self.set_code_segment(selector, &desc, cpl);
            self.state.eip = offset;
            return Ok(());
        }
        match desc.system_type() {
            SYS_CALL_GATE16 | SYS_CALL_GATE32 => {
                self.check_call_gate(selector, &desc)?;
                let (target, target_off, code) = self.gate_target_code(&desc)?;
                if !code.is_conforming() && code.dpl() != cpl {
                    return Err(gp_sel(target));
                }
                self.set_code_segment(target, &code, cpl);
                self.state.eip = target_off;
                Ok(())
            }
            SYS_TASK_GATE | SYS_TSS16_AVAIL | SYS_TSS32_AVAIL => {
                Err(Exception::Unsupported("task switch via far JMP"))
            }
            _ => Err(gp_sel(selector)),
        }
    }

    /// Far CALL. EIP already points past the CALL instruction.
    pub(crate) fn call_far(&mut self, selector: u16, offset: u32, op32: bool) -> Result<(), Exception> {
        let offset = if op32 { offset } else { offset & 0xFFFF };
        let return_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        let return_eip = self.state.eip;

        if !self.protected_mode() {
            let mut frame = FrameWriter::on_current_stack(self, op32);
            frame.push(self, return_cs)?;
            frame.push(self, return_eip)?;
            self.state.regs[ESP] = frame.esp(self.state.regs[ESP]);
            self.load_real_segment(SegReg::Cs, selector);
            self.state.eip = offset;
            return Ok(());
        }
        if is_null(selector) {
            return Err(Exception::gp0());
        }
        let cpl = self.state.cpl;
        let desc = self.read_descriptor(selector)?;
        if desc.is_segment() {
            if !desc.is_code() {
                return Err(gp_sel(selector));
            }
            self.check_direct_code(selector, &desc)?;
            let mut frame = FrameWriter::on_current_stack(self, op32);
            frame.push(self, return_cs)?;
            frame.push(self, return_eip)?;
            self.state.regs[ESP] = frame.esp(self.state.regs[ESP]);
            self.set_code_segment(selector, &desc, cpl);
            self.state.eip = offset;
            return Ok(());
        }
        match desc.system_type() {
            SYS_CALL_GATE16 | SYS_CALL_GATE32 => self.call_gate(selector, &desc, return_cs, return_eip),
            SYS_TASK_GATE | SYS_TSS16_AVAIL | SYS_TSS32_AVAIL => {
                Err(Exception::Unsupported("task switch via far CALL"))
            }
            _ => Err(gp_sel(selector)),
        }
    }

    fn call_gate(
        &mut self,
        selector: u16,
        gate: &Descriptor,
        return_cs: u32,
        return_eip: u32,
    ) -> Result<(), Exception> {
        self.check_call_gate(selector, gate)?;
        let (target, target_off, code) = self.gate_target_code(gate)?;
        let cpl = self.state.cpl;
        let gate32 = gate.system_type() == SYS_CALL_GATE32;

        if code.is_conforming() || code.dpl() == cpl {
            let mut frame = FrameWriter::on_current_stack(self, gate32);
            frame.push(self, return_cs)?;
            frame.push(self, return_eip)?;
            self.state.regs[ESP] = frame.esp(self.state.regs[ESP]);
            self.set_code_segment(target, &code, cpl);
            self.state.eip = target_off;
            return Ok(());
        }

        let new_cpl = code.dpl();
        let (ss_sel, esp) = self.tss_stack(new_cpl)?;
        let ss_desc = self.check_new_ss(ss_sel, new_cpl, Exception::InvalidTss)?;

        let old_ss = self.state.seg(SegReg::Ss).selector;
        let old_esp = self.state.regs[ESP];
        let size = if gate32 { 4 } else { 2 };
        let param_count = gate.hi & 0x1F;
        let mut params = Vec::with_capacity(param_count as usize);
        for i in 0..param_count {
            params.push(self.peek(gate32, i * size)?);
        }

        let mut frame = FrameWriter::on_new_stack(&ss_desc, esp, gate32, new_cpl);
        frame.push(self, u32::from(old_ss))?;
        frame.push(self, old_esp)?;
        for &param in params.iter().rev() {
            frame.push(self, param)?;
        }
        frame.push(self, return_cs)?;
        frame.push(self, return_eip)?;

        tracing::trace!(
            from = cpl,
            to = new_cpl,
            param_count,
            "call gate privilege change"
        );
        self.set_stack_segment(ss_sel, &ss_desc);
        self.state.regs[ESP] = frame.esp(esp);
        self.set_code_segment(target, &code, new_cpl);
        self.state.eip = target_off;
        Ok(())
    }

    /// RETF [imm16]. Returns `true` when the return changed privilege level.
    pub(crate) fn retf(&mut self, op32: bool, imm: u16) -> Result<bool, Exception> {
        if !self.protected_mode() {
            let size = if op32 { 4 } else { 2 };
            let eip = self.peek(op32, 0)?;
            let cs = self.peek(op32, size)? as u16;
            self.state.regs[ESP] = self.sp_offset(2 * size + u32::from(imm));
            self.load_real_segment(SegReg::Cs, cs);
            self.state.eip = if op32 { eip } else { eip & 0xFFFF };
            return Ok(false);
        }
        self.return_far_protected(op32, imm, false)
    }

    /// Protected-mode far return shared by RETF and IRET. For IRET the popped EFLAGS image is
    /// merged under the privilege rules of the level being returned from.
    pub(crate) fn return_far_protected(
        &mut self,
        op32: bool,
        imm: u16,
        is_iret: bool,
    ) -> Result<bool, Exception> {
        let size = if op32 { 4 } else { 2 };
        let new_eip = self.peek(op32, 0)?;
        let new_cs = self.peek(op32, size)? as u16;
        let new_flags = if is_iret {
            let flags = self.peek(op32, 2 * size)?;
            if op32 && flags & FLAG_VM != 0 && self.state.cpl == 0 {
                return Err(Exception::Unsupported("IRET to virtual-8086 mode"));
            }
            Some(flags)
        } else {
            None
        };
        let frame = if is_iret { 3 * size } else { 2 * size } + u32::from(imm);
        let new_eip = if op32 { new_eip } else { new_eip & 0xFFFF };

        let cpl = self.state.cpl;
        let rpl = (new_cs & 3) as u8;
        if is_null(new_cs) {
            return Err(Exception::gp0());
        }
        if rpl < cpl {
            return Err(gp_sel(new_cs));
        }
        let code = self.read_descriptor(new_cs)?;
        if !code.is_code() {
            return Err(gp_sel(new_cs));
        }
        if code.is_conforming() {
            if code.dpl() > rpl {
                return Err(gp_sel(new_cs));
            }
        } else if code.dpl() != rpl {
            return Err(gp_sel(new_cs));
        }
        if !code.present() {
            return Err(np_sel(new_cs));
        }
        let flags_mask = self.flags_write_mask(op32, true);

        if rpl == cpl {
            self.state.regs[ESP] = self.sp_offset(frame);
            self.set_code_segment(new_cs, &code, cpl);
            self.state.eip = new_eip;
            if let Some(flags) = new_flags {
                self.state.set_eflags(flags, flags_mask);
            }
            return Ok(false);
        }

        let new_esp = self.peek(op32, frame)?;
        let new_ss = self.peek(op32, frame + size)? as u16;
        let new_esp = if op32 { new_esp } else { new_esp & 0xFFFF };
        let ss_desc = self.check_new_ss(new_ss, rpl, Exception::GeneralProtection)?;

        if let Some(flags) = new_flags {
            self.state.set_eflags(flags, flags_mask);
        }
        self.set_code_segment(new_cs, &code, rpl);
        self.set_stack_segment(new_ss, &ss_desc);
        let esp = if is_iret {
            new_esp
        } else {
            new_esp.wrapping_add(u32::from(imm))
        };
        let mask = self.state.stack_mask();
        self.state.regs[ESP] = (self.state.regs[ESP] & !mask) | (esp & mask);
        self.state.eip = new_eip;
        self.null_inaccessible_segments();
        tracing::trace!(from = cpl, to = rpl, is_iret, "return to outer privilege level");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::state::{FLAG_IF, FLAG_RESERVED1};

    const GDT_BASE: u32 = 0x800;
    const TSS_BASE: u32 = 0x900;
    const KERNEL_CS: u16 = 0x08;
    const KERNEL_DS: u16 = 0x10;
    const USER_CS: u16 = 0x1B;
    const USER_DS: u16 = 0x23;
    const TSS_SEL: u16 = 0x28;
    const GATE_SEL: u16 = 0x30;
    const TASK_GATE_SEL: u16 = 0x3B;

    fn write_gdt(cpu: &mut Cpu, entries: &[u64]) {
        for (i, e) in entries.iter().enumerate() {
            let addr = GDT_BASE + i as u32 * 8;
            cpu.mem.write_u32(addr, *e as u32);
            cpu.mem.write_u32(addr + 4, (*e >> 32) as u32);
        }
        cpu.state.gdt.base = GDT_BASE;
        cpu.state.gdt.limit = (entries.len() * 8 - 1) as u16;
    }

    fn call_gate(selector: u16, offset: u32, dpl: u64, params: u64) -> u64 {
        (u64::from(offset) & 0xFFFF)
            | (u64::from(selector) << 16)
            | (params << 32)
            | (0x8C00 << 32)
            | (dpl << 45)
            | ((u64::from(offset) >> 16) << 48)
    }

    fn tss_descriptor(base: u32, limit: u32) -> u64 {
        (u64::from(limit) & 0xFFFF)
            | ((u64::from(base) & 0xFF_FFFF) << 16)
            | (0x89 << 40)
            | ((u64::from(base) >> 24) << 56)
    }

    /// Ring-3 CPU with a kernel stack in the TSS and a DPL-3 call gate to ring 0.
    fn user_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::with_mem_size(1 << 20)).unwrap();
        write_gdt(
            &mut cpu,
            &[
                0,
                0x00CF_9A00_0000_FFFF,
                0x00CF_9200_0000_FFFF,
                0x00CF_FA00_0000_FFFF,
                0x00CF_F200_0000_FFFF,
                tss_descriptor(TSS_BASE, 0x67),
                call_gate(KERNEL_CS, 0x4000, 3, 2),
                0x0000_E500_0028_0000,
            ],
        );
        cpu.mem.write_u32(TSS_BASE + 4, 0x9000);
        cpu.mem.write_u16(TSS_BASE + 8, KERNEL_DS);
        cpu.set_flat_protected_mode(0);
        cpu.ltr(TSS_SEL).unwrap();

        let user_code = cpu.read_descriptor(USER_CS).unwrap();
        cpu.set_code_segment(USER_CS, &user_code, 3);
        let user_data = cpu.read_descriptor(USER_DS).unwrap();
        cpu.set_stack_segment(USER_DS, &user_data);
        for seg in [SegReg::Ds, SegReg::Es] {
            cpu.load_segment(seg, USER_DS).unwrap();
        }
        cpu.state.regs[ESP] = 0x7000;
        cpu.state.eip = 0x1234;
        cpu
    }

    #[test]
    fn real_mode_far_call_and_return() {
        let mut cpu = Cpu::new(CpuConfig::with_mem_size(1 << 20)).unwrap();
        cpu.set_real_mode_entry(0x1000, 0x0010);
        cpu.state.regs[ESP] = 0x100;
        cpu.call_far(0x2000, 0x0040, false).unwrap();
        assert_eq!(cpu.state.seg(SegReg::Cs).base, 0x20000);
        assert_eq!(cpu.state.eip, 0x40);
        assert_eq!(cpu.state.regs[ESP], 0xFC);
        assert!(!cpu.retf(false, 4).unwrap());
        assert_eq!(cpu.state.seg(SegReg::Cs).selector, 0x1000);
        assert_eq!(cpu.state.eip, 0x10);
        assert_eq!(cpu.state.regs[ESP], 0x104);
    }

    #[test]
    fn call_gate_switches_to_kernel_stack_and_copies_params() {
        let mut cpu = user_cpu();
        cpu.mem.write_u32(0x7000, 0xAAAA_0001);
        cpu.mem.write_u32(0x7004, 0xBBBB_0002);
        cpu.call_far(GATE_SEL | 3, 0, true).unwrap();

        assert_eq!(cpu.state.cpl, 0);
        assert_eq!(cpu.state.seg(SegReg::Cs).selector, KERNEL_CS);
        assert_eq!(cpu.state.seg(SegReg::Ss).selector, KERNEL_DS);
        assert_eq!(cpu.state.eip, 0x4000);
        let esp = cpu.state.regs[ESP];
        assert_eq!(esp, 0x9000 - 6 * 4);
        assert_eq!(cpu.mem.read_u32(esp), 0x1234);
        assert_eq!(cpu.mem.read_u32(esp + 4), u32::from(USER_CS));
        assert_eq!(cpu.mem.read_u32(esp + 8), 0xAAAA_0001);
        assert_eq!(cpu.mem.read_u32(esp + 12), 0xBBBB_0002);
        assert_eq!(cpu.mem.read_u32(esp + 16), 0x7000);
        assert_eq!(cpu.mem.read_u32(esp + 20), u32::from(USER_DS));

        assert!(cpu.retf(true, 8).unwrap());
        assert_eq!(cpu.state.cpl, 3);
        assert_eq!(cpu.state.eip, 0x1234);
        assert_eq!(cpu.state.seg(SegReg::Ss).selector, USER_DS);
        assert_eq!(cpu.state.regs[ESP], 0x7008);
    }

    #[test]
    fn jump_to_more_privileged_code_segment_faults() {
        let mut cpu = user_cpu();
        assert_eq!(
            cpu.jmp_far(KERNEL_CS, 0x100, true),
            Err(Exception::GeneralProtection(KERNEL_CS))
        );
        assert_eq!(cpu.state.eip, 0x1234);
    }

    #[test]
    fn task_gate_transfer_is_unsupported() {
        let mut cpu = user_cpu();
        assert!(matches!(
            cpu.jmp_far(TASK_GATE_SEL, 0, true),
            Err(Exception::Unsupported(_))
        ));
        assert!(matches!(
            cpu.call_far(TASK_GATE_SEL, 0, true),
            Err(Exception::Unsupported(_))
        ));
    }

    #[test]
    fn far_jump_to_busy_tss_faults() {
        let mut cpu = user_cpu();
        assert_eq!(
            cpu.jmp_far(TSS_SEL, 0, true),
            Err(Exception::GeneralProtection(TSS_SEL))
        );
    }

    #[test]
    fn iret_to_user_mode_restores_flags_and_nulls_kernel_segments() {
        let mut cpu = user_cpu();
        let kernel_code = cpu.read_descriptor(KERNEL_CS).unwrap();
        cpu.set_code_segment(KERNEL_CS, &kernel_code, 0);
        let kernel_data = cpu.read_descriptor(KERNEL_DS).unwrap();
        cpu.set_stack_segment(KERNEL_DS, &kernel_data);
        cpu.load_segment(SegReg::Ds, KERNEL_DS).unwrap();
        cpu.state.regs[ESP] = 0x8000;
        for (i, v) in [
            0x5000,
            u32::from(USER_CS),
            FLAG_IF | FLAG_RESERVED1 | 1,
            0x6FF0,
            u32::from(USER_DS),
        ]
        .into_iter()
        .enumerate()
        {
            cpu.mem.write_u32(0x8000 + i as u32 * 4, v);
        }

        assert!(cpu.iret(true).unwrap());
        assert_eq!(cpu.state.cpl, 3);
        assert_eq!(cpu.state.eip, 0x5000);
        assert_eq!(cpu.state.regs[ESP], 0x6FF0);
        assert!(cpu.state.interrupts_enabled());
        assert!(cpu.state.flags.cf());
        assert_eq!(cpu.state.seg(SegReg::Ds).selector, 0);
        assert_eq!(cpu.state.seg(SegReg::Es).selector, USER_DS);
    }
}
