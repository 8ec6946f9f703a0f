//! Interrupt and exception delivery through the real-mode IVT or the protected-mode IDT,
//! including the inner-privilege stack switch, and IRET.

use std::cell::Cell;
use std::rc::Rc;

use crate::cpu::Cpu;
use crate::exceptions::{vector_has_error_code, EmulationError, Exception};
use crate::segmentation::{
    is_null, Descriptor, SYS_INT_GATE16, SYS_INT_GATE32, SYS_TASK_GATE, SYS_TRAP_GATE16, SYS_TRAP_GATE32,
};
use crate::state::{
    SegReg, DESC_B, ESP, FLAGS_ARITH, FLAG_AC, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_RF,
    FLAG_TF, FLAG_VM,
};

/// External interrupt controller interface.
pub trait InterruptController {
    /// Acknowledges the highest-priority pending request and returns its vector.
    ///
    /// Only called while the IRQ line is asserted and IF is set.
    fn get_pending_vector(&mut self) -> u8;
}

/// The CPU's hardware interrupt input. Clones share the same line, so a peripheral can hold one
/// and raise or drop it while the CPU runs.
#[derive(Debug, Clone, Default)]
pub struct IrqLine(Rc<Cell<bool>>);

impl IrqLine {
    pub fn set(&self, asserted: bool) {
        self.0.set(asserted);
    }

    pub fn is_asserted(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

impl ExceptionClass {
    fn of(exception: Exception) -> Self {
        match exception {
            Exception::PageFault { .. } => Self::PageFault,
            Exception::DivideError
            | Exception::InvalidTss(_)
            | Exception::SegmentNotPresent(_)
            | Exception::StackFault(_)
            | Exception::GeneralProtection(_) => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

fn should_double_fault(first: Exception, second: Exception) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

/// Stack writes for an interrupt frame. Nothing is committed to ESP until the whole frame has
/// been written, so a fault part-way through leaves the interrupted context intact.
pub(crate) struct FrameWriter {
    pub base: u32,
    pub sp: u32,
    pub mask: u32,
    pub op32: bool,
    pub user: bool,
}

impl FrameWriter {
    /// Frame on the current SS:ESP at the current privilege level.
    pub(crate) fn on_current_stack(cpu: &Cpu, op32: bool) -> Self {
        Self {
            base: cpu.state.seg(SegReg::Ss).base,
            sp: cpu.state.regs[ESP],
            mask: cpu.state.stack_mask(),
            op32,
            user: cpu.state.cpl == 3 && cpu.protected_mode(),
        }
    }

    /// Frame on a stack that is about to become current at privilege `cpl`.
    pub(crate) fn on_new_stack(ss: &Descriptor, esp: u32, op32: bool, cpl: u8) -> Self {
        Self {
            base: ss.base(),
            sp: esp,
            mask: if ss.hi & DESC_B != 0 { 0xFFFF_FFFF } else { 0xFFFF },
            op32,
            user: cpl == 3,
        }
    }

    pub(crate) fn push(&mut self, cpu: &mut Cpu, val: u32) -> Result<(), Exception> {
        if self.op32 {
            self.sp = self.sp.wrapping_sub(4);
            let la = self.base.wrapping_add(self.sp & self.mask);
            cpu.write_u32_as(la, val, self.user)
        } else {
            self.sp = self.sp.wrapping_sub(2);
            let la = self.base.wrapping_add(self.sp & self.mask);
            cpu.write_u16_as(la, val as u16, self.user)
        }
    }

    /// The ESP value to commit, keeping the upper half of a 16-bit stack pointer.
    pub(crate) fn esp(&self, old_esp: u32) -> u32 {
        (old_esp & !self.mask) | (self.sp & self.mask)
    }
}

impl Cpu {
    /// Delivers interrupt `vector` using the current EIP as the return address.
    ///
    /// `is_software` marks INT n / INT3 / INTO, which are checked against the gate DPL.
    /// `is_hardware` marks external interrupts. An error code is pushed only for the fault
    /// vectors that architecturally carry one, and never for software or hardware interrupts.
    pub fn deliver(
        &mut self,
        vector: u8,
        is_software: bool,
        error_code: Option<u32>,
        is_hardware: bool,
    ) -> Result<(), Exception> {
        let error_code = if !is_software && !is_hardware && vector_has_error_code(vector) {
            Some(error_code.unwrap_or(0))
        } else {
            None
        };
        tracing::debug!(
            vector,
            is_software,
            is_hardware,
            error_code,
            eip = format_args!("{:#010x}", self.state.eip),
            cpl = self.state.cpl,
            "deliver interrupt"
        );
        if self.protected_mode() {
            self.deliver_protected(vector, is_software, error_code)
        } else {
            self.deliver_real(vector)
        }
    }

    fn deliver_real(&mut self, vector: u8) -> Result<(), Exception> {
        let off = u32::from(vector) * 4;
        if off + 3 > u32::from(self.state.idt.limit) {
            return Err(Exception::GeneralProtection(u16::from(vector) * 8 + 2));
        }
        let entry = self.state.idt.base.wrapping_add(off);
        let ip = self.read_u16_as(entry, false)?;
        let cs = self.read_u16_as(entry.wrapping_add(2), false)?;

        let mut frame = FrameWriter::on_current_stack(self, false);
        let flags = self.state.get_eflags();
        let old_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        frame.push(self, flags)?;
        frame.push(self, old_cs)?;
        frame.push(self, self.state.eip)?;

        self.state.regs[ESP] = frame.esp(self.state.regs[ESP]);
        self.state.eflags &= !(FLAG_IF | FLAG_TF | FLAG_AC | FLAG_RF);
        self.load_real_segment(SegReg::Cs, cs);
        self.state.eip = u32::from(ip);
        Ok(())
    }

    fn deliver_protected(
        &mut self,
        vector: u8,
        is_software: bool,
        error_code: Option<u32>,
    ) -> Result<(), Exception> {
        let gate_err = Exception::GeneralProtection(u16::from(vector) * 8 + 2);
        let off = u32::from(vector) * 8;
        if off + 7 > u32::from(self.state.idt.limit) {
            return Err(gate_err);
        }
        let entry = self.state.idt.base.wrapping_add(off);
        let gate = Descriptor {
            lo: self.read_sys_u32(entry)?,
            hi: self.read_sys_u32(entry.wrapping_add(4))?,
        };

        let ty = gate.system_type();
        if gate.is_segment() {
            return Err(gate_err);
        }
        match ty {
            SYS_TASK_GATE => return Err(Exception::Unsupported("task gate in IDT")),
            SYS_INT_GATE16 | SYS_TRAP_GATE16 | SYS_INT_GATE32 | SYS_TRAP_GATE32 => {}
            _ => return Err(gate_err),
        }
        let cpl = self.state.cpl;
        if is_software && gate.dpl() < cpl {
            return Err(gate_err);
        }
        if !gate.present() {
            return Err(Exception::SegmentNotPresent(u16::from(vector) * 8 + 2));
        }

        let (selector, offset) = gate.gate_target();
        if is_null(selector) {
            return Err(Exception::gp0());
        }
        let code = self.read_descriptor(selector)?;
        if !code.is_code() || code.dpl() > cpl {
            return Err(Exception::GeneralProtection(selector & 0xFFFC));
        }
        if !code.present() {
            return Err(Exception::SegmentNotPresent(selector & 0xFFFC));
        }

        let gate32 = ty & 8 != 0;
        let old_esp = self.state.regs[ESP];
        let old_ss = self.state.seg(SegReg::Ss).selector;
        let inner = !code.is_conforming() && code.dpl() < cpl;

        let (new_cpl, stack) = if inner {
            let new_cpl = code.dpl();
            let (ss_sel, esp) = self.tss_stack(new_cpl)?;
            let ss_desc = self.check_new_ss(ss_sel, new_cpl, Exception::InvalidTss)?;
            (new_cpl, Some((ss_sel, ss_desc, esp)))
        } else {
            (cpl, None)
        };

        let mut frame = match &stack {
            Some((_, ss_desc, esp)) => FrameWriter::on_new_stack(ss_desc, *esp, gate32, new_cpl),
            None => FrameWriter::on_current_stack(self, gate32),
        };

        if stack.is_some() {
            frame.push(self, u32::from(old_ss))?;
            frame.push(self, old_esp)?;
        }
        let eflags = self.state.get_eflags();
        let old_cs = u32::from(self.state.seg(SegReg::Cs).selector);
        frame.push(self, eflags)?;
        frame.push(self, old_cs)?;
        frame.push(self, self.state.eip)?;
        if let Some(code) = error_code {
            frame.push(self, code)?;
        }

        match stack {
            Some((ss_sel, ss_desc, esp)) => {
                self.set_stack_segment(ss_sel, &ss_desc);
                self.state.regs[ESP] = frame.esp(esp);
            }
            None => self.state.regs[ESP] = frame.esp(old_esp),
        }
        self.set_code_segment(selector, &code, new_cpl);
        self.state.eip = offset;
        if ty == SYS_INT_GATE16 || ty == SYS_INT_GATE32 {
            self.state.eflags &= !FLAG_IF;
        }
        self.state.eflags &= !(FLAG_TF | FLAG_NT | FLAG_RF | FLAG_VM);
        Ok(())
    }

    /// Delivers a fault raised by an instruction, escalating to #DF when a second contributory
    /// or page fault hits during delivery. A fault while delivering #DF ends emulation.
    pub(crate) fn deliver_fault(&mut self, fault: Exception) -> Result<(), EmulationError> {
        let mut current = fault;
        loop {
            if let Exception::Unsupported(what) = current {
                tracing::warn!(what, "unsupported guest operation");
                return Err(EmulationError::Unsupported(what));
            }
            match self.deliver(current.vector(), false, current.error_code(), false) {
                Ok(()) => return Ok(()),
                Err(Exception::Unsupported(what)) => {
                    tracing::warn!(what, "unsupported guest operation");
                    return Err(EmulationError::Unsupported(what));
                }
                Err(second) if current == Exception::DoubleFault => {
                    tracing::warn!(%second, "triple fault");
                    return Err(EmulationError::TripleFault {
                        first: current,
                        second,
                    });
                }
                Err(second) => {
                    current = if should_double_fault(current, second) {
                        Exception::DoubleFault
                    } else {
                        second
                    };
                }
            }
        }
    }

    /// EFLAGS bits that POPF (or IRET, with `include_rf`) may change at the current privilege.
    pub(crate) fn flags_write_mask(&self, op32: bool, include_rf: bool) -> u32 {
        let mut mask = FLAG_TF | FLAG_DF | FLAG_NT | FLAG_AC | FLAG_ID | FLAGS_ARITH;
        if include_rf {
            mask |= FLAG_RF;
        }
        let cpl = if self.protected_mode() { self.state.cpl } else { 0 };
        if cpl == 0 {
            mask |= FLAG_IOPL;
        }
        if cpl <= self.state.iopl() {
            mask |= FLAG_IF;
        }
        if !op32 {
            mask &= 0xFFFF;
        }
        mask
    }

    /// IRET. Returns `true` when the privilege level changed.
    pub(crate) fn iret(&mut self, op32: bool) -> Result<bool, Exception> {
        if !self.protected_mode() {
            let size = if op32 { 4 } else { 2 };
            let eip = self.peek(op32, 0)?;
            let cs = self.peek(op32, size)? as u16;
            let flags = self.peek(op32, 2 * size)?;
            self.state.regs[ESP] = self.sp_offset(3 * size);
            self.load_real_segment(SegReg::Cs, cs);
            self.state.eip = if op32 { eip } else { eip & 0xFFFF };
            let mask = self.flags_write_mask(op32, true);
            self.state.set_eflags(flags, mask);
            return Ok(false);
        }
        if self.state.eflags & FLAG_NT != 0 {
            return Err(Exception::Unsupported("nested task return via IRET"));
        }
        self.return_far_protected(op32, 0, true)
    }
}
