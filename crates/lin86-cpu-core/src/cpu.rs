use lin86_mem::PhysicalMemory;
use lin86_mmu::{AccessKind, Mmu, CR0_PE};

use crate::config::CpuConfig;
use crate::exceptions::Exception;
use crate::interrupts::{InterruptController, IrqLine};
use crate::io::IoPortBus;
use crate::state::{
    CpuState, SegReg, Segment, DESC_A, DESC_B, DESC_CODE, DESC_G, DESC_P, DESC_R, DESC_S, DESC_W,
    ESP, FLAG_RESERVED1, REAL_MODE_CODE,
};

/// One emulated CPU together with everything it owns.
pub struct Cpu {
    pub state: CpuState,
    pub mmu: Mmu,
    pub mem: PhysicalMemory,
    pub io: IoPortBus,
    pub(crate) config: CpuConfig,
    pub(crate) irq_line: IrqLine,
    pub(crate) pic: Option<Box<dyn InterruptController>>,
    /// Fault raised by the last instruction, delivered on the next `execute` call.
    pub(crate) pending_fault: Option<Exception>,
    /// Instructions left before interrupts are sampled again (STI, MOV SS shadow).
    pub(crate) interrupt_shadow: u8,
    /// Monotonic instruction-cycle counter, also the TSC.
    pub(crate) cycles: u64,
    /// Cycle count at which the current `execute` slice ends.
    pub(crate) slice_end: u64,
    /// EIP of the instruction being executed.
    pub(crate) insn_start: u32,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("mmu", &self.mmu)
            .field("cycles", &self.cycles)
            .finish_non_exhaustive()
    }
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Result<Self, lin86_mem::MemoryError> {
        let mem = PhysicalMemory::new(config.mem_size)?;
        Ok(Self {
            state: CpuState::default(),
            mmu: Mmu::new(),
            mem,
            io: IoPortBus::new(),
            config,
            irq_line: IrqLine::default(),
            pic: None,
            pending_fault: None,
            interrupt_shadow: 0,
            cycles: 0,
            slice_end: 0,
            insn_start: 0,
        })
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Back to the power-on real-mode state: CS:EIP = 0:0, all segment bases 0 with 64 KiB
    /// limits, paging off. Memory and registered port handlers are kept.
    pub fn reset(&mut self) {
        self.state = CpuState::default();
        self.mmu = Mmu::new();
        self.pending_fault = None;
        self.interrupt_shadow = 0;
        self.io.reset();
    }

    /// Enters 32-bit flat protected mode at CPL 0 with `EIP = entry`, the state a boot loader
    /// hands over to a kernel: every segment has base 0 and a 4 GiB limit, paging stays off.
    pub fn set_flat_protected_mode(&mut self, entry: u32) {
        self.mmu.set_cr0(self.mmu.cr0() | CR0_PE);
        let data = Segment {
            selector: 0,
            base: 0,
            limit: 0xFFFF_FFFF,
            flags: DESC_P | DESC_S | DESC_W | DESC_A | DESC_B | DESC_G,
        };
        for seg in [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            *self.state.seg_mut(seg) = data;
        }
        *self.state.seg_mut(SegReg::Cs) = Segment {
            flags: DESC_P | DESC_S | DESC_CODE | DESC_R | DESC_A | DESC_B | DESC_G,
            ..data
        };
        self.state.cpl = 0;
        self.state.eip = entry;
        self.state.eflags = FLAG_RESERVED1;
        self.state.halted = false;
        self.state.update_flat();
    }

    /// Loads CS:IP the way a real-mode far jump would, e.g. to start at a boot sector.
    pub fn set_real_mode_entry(&mut self, cs: u16, ip: u16) {
        *self.state.seg_mut(SegReg::Cs) = Segment::real_mode(cs, REAL_MODE_CODE);
        self.state.eip = u32::from(ip);
        self.state.update_flat();
    }

    /// Installs the interrupt controller consulted when the IRQ line is asserted.
    pub fn set_interrupt_controller(&mut self, pic: Box<dyn InterruptController>) {
        self.pic = Some(pic);
    }

    /// Shared handle to the hardware interrupt line.
    pub fn irq_line(&self) -> IrqLine {
        self.irq_line.clone()
    }

    pub fn set_irq(&mut self, asserted: bool) {
        self.irq_line.set(asserted);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn halted(&self) -> bool {
        self.state.halted
    }

    #[inline]
    pub(crate) fn protected_mode(&self) -> bool {
        self.mmu.cr0() & CR0_PE != 0
    }

    /// Whether memory accesses are currently checked as user-mode accesses.
    #[inline]
    pub(crate) fn user(&self) -> bool {
        self.state.cpl == 3
    }

    // --- Linear-address access, translated with the current privilege ------------------------

    #[inline]
    pub(crate) fn translate(&mut self, linear: u32, access: AccessKind, user: bool) -> Result<u32, Exception> {
        match self.mmu.lookup(linear, access, user) {
            Some(paddr) => Ok(paddr),
            None => Ok(self.mmu.fill(&mut self.mem, linear, access, user)?),
        }
    }

    #[inline]
    pub(crate) fn read_u8(&mut self, linear: u32) -> Result<u8, Exception> {
        self.read_u8_as(linear, self.user())
    }

    #[inline]
    pub(crate) fn read_u16(&mut self, linear: u32) -> Result<u16, Exception> {
        self.read_u16_as(linear, self.user())
    }

    #[inline]
    pub(crate) fn read_u32(&mut self, linear: u32) -> Result<u32, Exception> {
        self.read_u32_as(linear, self.user())
    }

    #[inline]
    pub(crate) fn write_u8(&mut self, linear: u32, val: u8) -> Result<(), Exception> {
        self.write_u8_as(linear, val, self.user())
    }

    #[inline]
    pub(crate) fn write_u16(&mut self, linear: u32, val: u16) -> Result<(), Exception> {
        self.write_u16_as(linear, val, self.user())
    }

    #[inline]
    pub(crate) fn write_u32(&mut self, linear: u32, val: u32) -> Result<(), Exception> {
        self.write_u32_as(linear, val, self.user())
    }

    pub(crate) fn read_u8_as(&mut self, linear: u32, user: bool) -> Result<u8, Exception> {
        let paddr = self.translate(linear, AccessKind::Read, user)?;
        Ok(self.mem.read_u8(paddr))
    }

    pub(crate) fn read_u16_as(&mut self, linear: u32, user: bool) -> Result<u16, Exception> {
        if linear & 0xFFF <= 0xFFE {
            let paddr = self.translate(linear, AccessKind::Read, user)?;
            return Ok(self.mem.read_u16(paddr));
        }
        let lo = self.read_u8_as(linear, user)?;
        let hi = self.read_u8_as(linear.wrapping_add(1), user)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub(crate) fn read_u32_as(&mut self, linear: u32, user: bool) -> Result<u32, Exception> {
        if linear & 0xFFF <= 0xFFC {
            let paddr = self.translate(linear, AccessKind::Read, user)?;
            return Ok(self.mem.read_u32(paddr));
        }
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8_as(linear.wrapping_add(i as u32), user)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    pub(crate) fn write_u8_as(&mut self, linear: u32, val: u8, user: bool) -> Result<(), Exception> {
        let paddr = self.translate(linear, AccessKind::Write, user)?;
        self.mem.write_u8(paddr, val);
        Ok(())
    }

    pub(crate) fn write_u16_as(&mut self, linear: u32, val: u16, user: bool) -> Result<(), Exception> {
        if linear & 0xFFF <= 0xFFE {
            let paddr = self.translate(linear, AccessKind::Write, user)?;
            self.mem.write_u16(paddr, val);
            return Ok(());
        }
        self.write_split(linear, &val.to_le_bytes(), user)
    }

    pub(crate) fn write_u32_as(&mut self, linear: u32, val: u32, user: bool) -> Result<(), Exception> {
        if linear & 0xFFF <= 0xFFC {
            let paddr = self.translate(linear, AccessKind::Write, user)?;
            self.mem.write_u32(paddr, val);
            return Ok(());
        }
        self.write_split(linear, &val.to_le_bytes(), user)
    }

    /// Page-straddling store: both pages are translated before any byte lands.
    fn write_split(&mut self, linear: u32, bytes: &[u8], user: bool) -> Result<(), Exception> {
        let second = (linear | 0xFFF).wrapping_add(1);
        let first_pa = self.translate(linear, AccessKind::Write, user)?;
        let second_pa = self.translate(second, AccessKind::Write, user)?;
        for (i, b) in bytes.iter().enumerate() {
            let la = linear.wrapping_add(i as u32);
            let pa = if la & 0xFFF >= linear & 0xFFF {
                first_pa.wrapping_add(i as u32)
            } else {
                second_pa.wrapping_add(la & 0xFFF)
            };
            self.mem.write_u8(pa, *b);
        }
        Ok(())
    }

    /// Supervisor-privilege reads of system structures (GDT, LDT, IDT, TSS).
    #[inline]
    pub(crate) fn read_sys_u32(&mut self, linear: u32) -> Result<u32, Exception> {
        self.read_u32_as(linear, false)
    }

    #[inline]
    pub(crate) fn read_sys_u16(&mut self, linear: u32) -> Result<u16, Exception> {
        self.read_u16_as(linear, false)
    }

    // --- Segment-relative access ------------------------------------------------------------

    #[inline]
    pub(crate) fn seg_read_u8(&mut self, seg: SegReg, offset: u32) -> Result<u8, Exception> {
        let la = self.state.linear(seg, offset);
        self.read_u8(la)
    }

    #[inline]
    pub(crate) fn seg_read_u16(&mut self, seg: SegReg, offset: u32) -> Result<u16, Exception> {
        let la = self.state.linear(seg, offset);
        self.read_u16(la)
    }

    #[inline]
    pub(crate) fn seg_read_u32(&mut self, seg: SegReg, offset: u32) -> Result<u32, Exception> {
        let la = self.state.linear(seg, offset);
        self.read_u32(la)
    }

    #[inline]
    pub(crate) fn seg_write_u8(&mut self, seg: SegReg, offset: u32, val: u8) -> Result<(), Exception> {
        let la = self.state.linear(seg, offset);
        self.write_u8(la, val)
    }

    #[inline]
    pub(crate) fn seg_write_u16(&mut self, seg: SegReg, offset: u32, val: u16) -> Result<(), Exception> {
        let la = self.state.linear(seg, offset);
        self.write_u16(la, val)
    }

    #[inline]
    pub(crate) fn seg_write_u32(&mut self, seg: SegReg, offset: u32, val: u32) -> Result<(), Exception> {
        let la = self.state.linear(seg, offset);
        self.write_u32(la, val)
    }

    /// Code fetch at `CS:eip`.
    #[inline]
    pub(crate) fn fetch_u8(&mut self, eip: u32) -> Result<u8, Exception> {
        let la = self.state.linear(SegReg::Cs, eip);
        self.read_u8(la)
    }

    // --- Stack --------------------------------------------------------------------------------

    /// ESP after moving it by `delta`, honouring the SS size.
    #[inline]
    pub(crate) fn sp_offset(&self, delta: u32) -> u32 {
        let mask = self.state.stack_mask();
        let esp = self.state.regs[ESP];
        (esp & !mask) | (esp.wrapping_add(delta) & mask)
    }

    pub(crate) fn push16(&mut self, val: u16) -> Result<(), Exception> {
        let sp = self.sp_offset(2u32.wrapping_neg());
        self.seg_write_u16(SegReg::Ss, sp & self.state.stack_mask(), val)?;
        self.state.regs[ESP] = sp;
        Ok(())
    }

    pub(crate) fn push32(&mut self, val: u32) -> Result<(), Exception> {
        let sp = self.sp_offset(4u32.wrapping_neg());
        self.seg_write_u32(SegReg::Ss, sp & self.state.stack_mask(), val)?;
        self.state.regs[ESP] = sp;
        Ok(())
    }

    pub(crate) fn push(&mut self, op32: bool, val: u32) -> Result<(), Exception> {
        if op32 {
            self.push32(val)
        } else {
            self.push16(val as u16)
        }
    }

    /// Reads the stack slot `offset` bytes above the top without popping it.
    pub(crate) fn peek(&mut self, op32: bool, offset: u32) -> Result<u32, Exception> {
        let sp = self.sp_offset(offset) & self.state.stack_mask();
        if op32 {
            self.seg_read_u32(SegReg::Ss, sp)
        } else {
            Ok(u32::from(self.seg_read_u16(SegReg::Ss, sp)?))
        }
    }

    pub(crate) fn pop(&mut self, op32: bool) -> Result<u32, Exception> {
        let val = self.peek(op32, 0)?;
        self.state.regs[ESP] = self.sp_offset(if op32 { 4 } else { 2 });
        Ok(val)
    }

    /// Real-mode segment load: only selector and base change, the cached limit and attributes
    /// stay as they were.
    pub(crate) fn load_real_segment(&mut self, seg: SegReg, selector: u16) {
        let s = self.state.seg_mut(seg);
        s.selector = selector;
        s.base = u32::from(selector) << 4;
        self.state.update_flat();
    }
}
