//! Flag control, port I/O and the privileged/system instructions.

use lin86_mmu::{CR0_EM, CR0_ET, CR0_MP, CR0_PE, CR0_PG, CR0_TS, CR4_DE, CR4_TSD};

use super::decode::Instr;
use super::ops_string::io_size;
use super::Flow;
use crate::cpu::Cpu;
use crate::exceptions::Exception;
use crate::flags::Width;
use crate::segmentation::{lar_type_ok, lsl_type_ok};
use crate::state::{
    SegReg, EAX, EBX, ECX, EDX, FLAG_DF, FLAG_IF, FLAG_RF, FLAG_VM, FLAG_ZF,
};

/// Time-stamp counter MSR, the only one implemented.
const MSR_TSC: u32 = 0x10;

impl Cpu {
    /// Instructions restricted to CPL 0 raise #GP(0) in protected mode.
    fn require_cpl0(&self) -> Result<(), Exception> {
        if self.protected_mode() && self.state.cpl != 0 {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    fn require_protected(&self) -> Result<(), Exception> {
        if !self.protected_mode() {
            return Err(Exception::InvalidOpcode);
        }
        Ok(())
    }

    /// IN/OUT/INS/OUTS/CLI/STI sensitivity: CPL above IOPL faults in protected mode.
    pub(super) fn check_io_privilege(&self) -> Result<(), Exception> {
        if self.protected_mode() && self.state.cpl > self.state.iopl() {
            return Err(Exception::gp0());
        }
        Ok(())
    }

    /// IN/OUT with an immediate (E4-E7) or DX (EC-EF) port.
    pub(super) fn exec_in_out(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.check_io_privilege()?;
        let w = i.width_from_low_bit();
        let port = if i.opcode < 0xEC {
            i.imm as u16
        } else {
            self.state.regs[EDX] as u16
        };
        if i.opcode & 2 == 0 {
            let v = self.io.read(port, io_size(w));
            self.reg_write(EAX, w, v);
        } else {
            let v = self.reg_read(EAX, w);
            self.io.write(port, io_size(w), v);
        }
        Ok(Flow::Next)
    }

    pub(super) fn exec_hlt(&mut self, _i: &Instr) -> Result<Flow, Exception> {
        self.require_cpl0()?;
        self.state.halted = true;
        Ok(Flow::Halt)
    }

    /// CMC, CLC, STC, CLI, STI, CLD, STD (F5, F8-FD).
    pub(super) fn exec_flag_op(&mut self, i: &Instr) -> Result<Flow, Exception> {
        use crate::state::FLAG_CF;
        match i.opcode {
            0xF5 => {
                let cf = self.state.flags.cf();
                self.update_flags(if cf { 0 } else { FLAG_CF }, FLAG_CF);
            }
            0xF8 => self.update_flags(0, FLAG_CF),
            0xF9 => self.update_flags(FLAG_CF, 0),
            0xFA => {
                self.check_io_privilege()?;
                self.state.eflags &= !FLAG_IF;
            }
            0xFB => {
                self.check_io_privilege()?;
                if !self.state.interrupts_enabled() {
                    self.state.eflags |= FLAG_IF;
                    self.interrupt_shadow = 1;
                    return Ok(Flow::Yield);
                }
            }
            0xFC => self.state.eflags &= !FLAG_DF,
            _ => self.state.eflags |= FLAG_DF,
        }
        Ok(Flow::Next)
    }

    /// PUSHF (9C) and POPF (9D). POPF can unmask interrupts, so it ends the batch.
    pub(super) fn exec_pushf_popf(&mut self, i: &Instr) -> Result<Flow, Exception> {
        if i.opcode == 0x9C {
            let flags = self.state.get_eflags() & !(FLAG_VM | FLAG_RF);
            self.push(i.op32, flags)?;
            return Ok(Flow::Next);
        }
        let v = self.pop(i.op32)?;
        let mask = self.flags_write_mask(i.op32, false);
        self.state.set_eflags(v, mask);
        Ok(Flow::Yield)
    }

    /// Group 6 (0F 00): SLDT, STR, LLDT, LTR, VERR, VERW.
    pub(super) fn exec_group6(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.require_protected()?;
        match i.reg() {
            0 | 1 => {
                let seg = if i.reg() == 0 { SegReg::Ldtr } else { SegReg::Tr };
                let sel = u32::from(self.state.seg(seg).selector);
                if i.mem.is_some() {
                    self.rm_write(i, Width::Word, sel)?;
                } else {
                    self.reg_write(i.rm(), i.op_width(), sel);
                }
            }
            2 | 3 => {
                self.require_cpl0()?;
                let sel = self.rm_read(i, Width::Word)? as u16;
                if i.reg() == 2 {
                    self.lldt(sel)?;
                } else {
                    self.ltr(sel)?;
                }
            }
            reg => {
                let sel = self.rm_read(i, Width::Word)? as u16;
                let ok = match self.visible_descriptor(sel)? {
                    Some(d) if d.is_segment() => {
                        if reg == 4 {
                            d.is_readable()
                        } else {
                            d.is_writable_data()
                        }
                    }
                    _ => false,
                };
                self.update_flags(if ok { FLAG_ZF } else { 0 }, FLAG_ZF);
            }
        }
        Ok(Flow::Next)
    }

    /// Group 7 (0F 01): SGDT, SIDT, LGDT, LIDT, SMSW, LMSW, INVLPG.
    pub(super) fn exec_group7(&mut self, i: &Instr) -> Result<Flow, Exception> {
        match i.reg() {
            0 | 1 => {
                let table = if i.reg() == 0 { self.state.gdt } else { self.state.idt };
                let (seg, off) = self.mem_addr(i)?;
                let base = if i.op32 { table.base } else { table.base & 0x00FF_FFFF };
                self.check_writable(seg, off, Width::Word)?;
                self.check_writable(seg, off.wrapping_add(2), Width::Dword)?;
                self.seg_write_u16(seg, off, table.limit)?;
                self.seg_write_u32(seg, off.wrapping_add(2), base)?;
            }
            2 | 3 => {
                self.require_cpl0()?;
                let (seg, off) = self.mem_addr(i)?;
                let limit = self.seg_read_u16(seg, off)?;
                let mut base = self.seg_read_u32(seg, off.wrapping_add(2))?;
                if !i.op32 {
                    base &= 0x00FF_FFFF;
                }
                let table = if i.reg() == 2 { &mut self.state.gdt } else { &mut self.state.idt };
                table.base = base;
                table.limit = limit;
            }
            4 => {
                let cr0 = self.mmu.cr0();
                if i.mem.is_some() {
                    self.rm_write(i, Width::Word, cr0 & 0xFFFF)?;
                } else {
                    self.reg_write(i.rm(), i.op_width(), cr0);
                }
            }
            6 => {
                self.require_cpl0()?;
                let v = self.rm_read(i, Width::Word)?;
                let cr0 = self.mmu.cr0();
                // LMSW can set PE but never clear it.
                let low = CR0_PE | CR0_MP | CR0_EM | CR0_TS;
                let new = (cr0 & !(low & !CR0_PE)) | (v & low);
                self.write_cr0(new)?;
            }
            _ => {
                self.require_cpl0()?;
                let (seg, off) = self.mem_addr(i)?;
                let la = self.state.linear(seg, off);
                self.mmu.invlpg(la);
            }
        }
        Ok(Flow::Next)
    }

    /// LAR (0F 02) and LSL (0F 03). ZF reports whether the selector was accessible.
    pub(super) fn exec_lar_lsl(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.require_protected()?;
        let sel = self.rm_read(i, Width::Word)? as u16;
        let desc = self.visible_descriptor(sel)?;
        let value = match desc {
            Some(d) if i.opcode == 0x102 && lar_type_ok(&d) => Some(d.hi & 0x00F0_FF00),
            Some(d) if i.opcode == 0x103 && lsl_type_ok(&d) => Some(d.limit()),
            _ => None,
        };
        match value {
            Some(v) => {
                self.reg_write(i.reg(), i.op_width(), v);
                self.update_flags(FLAG_ZF, 0);
            }
            None => self.update_flags(0, FLAG_ZF),
        }
        Ok(Flow::Next)
    }

    /// CLTS (0F 06), INVD (0F 08), WBINVD (0F 09).
    pub(super) fn exec_cache_control(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.require_cpl0()?;
        if i.opcode == 0x106 {
            let cr0 = self.mmu.cr0();
            self.mmu.set_cr0(cr0 & !CR0_TS);
        }
        Ok(Flow::Next)
    }

    fn write_cr0(&mut self, value: u32) -> Result<(), Exception> {
        if value & CR0_PG != 0 && value & CR0_PE == 0 {
            return Err(Exception::gp0());
        }
        let was_protected = self.protected_mode();
        self.mmu.set_cr0(value | CR0_ET);
        if was_protected != self.protected_mode() {
            tracing::debug!(
                protected = self.protected_mode(),
                eip = format_args!("{:#010x}", self.state.eip),
                "CR0.PE changed"
            );
            if !self.protected_mode() {
                self.state.cpl = 0;
            }
        }
        Ok(())
    }

    /// MOV to/from CR0-CR4 (0F 20/22) and DR0-DR7 (0F 21/23).
    pub(super) fn exec_mov_control(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.require_cpl0()?;
        let n = i.reg();
        let r = i.rm();
        match i.opcode {
            0x120 => {
                let v = match n {
                    0 => self.mmu.cr0(),
                    2 => self.mmu.cr2(),
                    3 => self.mmu.cr3(),
                    4 => self.mmu.cr4(),
                    _ => return Err(Exception::InvalidOpcode),
                };
                self.state.regs[r] = v;
            }
            0x122 => {
                let v = self.state.regs[r];
                tracing::debug!(cr = n, value = format_args!("{v:#010x}"), "control register write");
                match n {
                    0 => self.write_cr0(v)?,
                    2 => self.mmu.set_cr2(v),
                    3 => self.mmu.set_cr3(v),
                    4 => self.mmu.set_cr4(v),
                    _ => return Err(Exception::InvalidOpcode),
                }
                // Paging mode or address space may have changed.
                return Ok(Flow::Yield);
            }
            _ => {
                let n = match n {
                    4 | 5 if self.mmu.cr4() & CR4_DE != 0 => return Err(Exception::InvalidOpcode),
                    4 | 5 => n + 2,
                    _ => n,
                };
                if i.opcode == 0x121 {
                    self.state.regs[r] = self.state.dr[n];
                } else {
                    self.state.dr[n] = self.state.regs[r];
                }
            }
        }
        Ok(Flow::Next)
    }

    /// WRMSR (0F 30), RDTSC (0F 31), RDMSR (0F 32).
    pub(super) fn exec_msr_tsc(&mut self, i: &Instr) -> Result<Flow, Exception> {
        if i.opcode == 0x131 {
            if self.mmu.cr4() & CR4_TSD != 0 {
                self.require_cpl0()?;
            }
        } else {
            self.require_cpl0()?;
            let msr = self.state.regs[ECX];
            if msr != MSR_TSC {
                tracing::warn!(msr = format_args!("{msr:#x}"), "access to unimplemented MSR");
                return Err(Exception::gp0());
            }
        }
        if i.opcode == 0x130 {
            // The cycle counter stays monotonic; writes to it are dropped.
            tracing::warn!("WRMSR to the TSC ignored");
            return Ok(Flow::Next);
        }
        self.state.regs[EAX] = self.cycles as u32;
        self.state.regs[EDX] = (self.cycles >> 32) as u32;
        Ok(Flow::Next)
    }

    /// CPUID (0F A2), answered from the configured policy.
    pub(super) fn exec_cpuid(&mut self, _i: &Instr) -> Result<Flow, Exception> {
        let policy = &self.config.cpuid;
        let word = |n: usize| {
            u32::from_le_bytes([
                policy.vendor[n * 4],
                policy.vendor[n * 4 + 1],
                policy.vendor[n * 4 + 2],
                policy.vendor[n * 4 + 3],
            ])
        };
        let (a, b, c, d) = match self.state.regs[EAX] {
            0 => (1, word(0), word(2), word(1)),
            1 => (policy.signature(), 0, policy.features_ecx, policy.features_edx),
            _ => (0, 0, 0, 0),
        };
        self.state.regs[EAX] = a;
        self.state.regs[EBX] = b;
        self.state.regs[ECX] = c;
        self.state.regs[EDX] = d;
        Ok(Flow::Next)
    }

    /// WAIT/FWAIT (9B).
    pub(super) fn exec_wait(&mut self, _i: &Instr) -> Result<Flow, Exception> {
        let cr0 = self.mmu.cr0();
        if cr0 & CR0_MP != 0 && cr0 & CR0_TS != 0 {
            return Err(Exception::DeviceNotAvailable);
        }
        Ok(Flow::Next)
    }

    /// x87 escape (D8-DF). No FPU is present: with EM or TS set the guest gets #NM, otherwise
    /// the instruction is skipped so FPU detection reads back "no coprocessor".
    pub(super) fn exec_fpu_escape(&mut self, _i: &Instr) -> Result<Flow, Exception> {
        if self.mmu.cr0() & (CR0_EM | CR0_TS) != 0 {
            return Err(Exception::DeviceNotAvailable);
        }
        Ok(Flow::Next)
    }

    /// ARPL r/m16, r16 (63).
    pub(super) fn exec_arpl(&mut self, i: &Instr) -> Result<Flow, Exception> {
        self.require_protected()?;
        let src_rpl = self.reg_read(i.reg(), Width::Word) & 3;
        let mut adjusted = false;
        self.rm_modify(i, Width::Word, |_, dst| {
            if dst & 3 < src_rpl {
                adjusted = true;
                (dst & !3) | src_rpl
            } else {
                dst
            }
        })?;
        self.update_flags(if adjusted { FLAG_ZF } else { 0 }, FLAG_ZF);
        Ok(Flow::Next)
    }
}
