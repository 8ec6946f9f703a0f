//! Architecturally visible register state.

use crate::flags::LazyFlags;

pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// Flags kept in the lazy condition-code record rather than in `CpuState::eflags`.
pub const FLAGS_ARITH: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

// Segment descriptor attribute bits, as they sit in the descriptor's high dword.
pub const DESC_A: u32 = 1 << 8;
pub const DESC_W: u32 = 1 << 9;
pub const DESC_R: u32 = 1 << 9;
pub const DESC_C: u32 = 1 << 10;
pub const DESC_E: u32 = 1 << 10;
pub const DESC_CODE: u32 = 1 << 11;
pub const DESC_S: u32 = 1 << 12;
pub const DESC_DPL_SHIFT: u32 = 13;
pub const DESC_P: u32 = 1 << 15;
pub const DESC_B: u32 = 1 << 22;
pub const DESC_G: u32 = 1 << 23;
pub const DESC_TYPE_SHIFT: u32 = 8;

/// Attribute bits a segment cache keeps from the descriptor.
pub const DESC_ATTR_MASK: u32 = 0x00F0_FF00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
    Ldtr = 6,
    Tr = 7,
}

impl SegReg {
    /// Segment register encoded in a ModRM `reg` field (MOV Sreg, PUSH/POP).
    pub fn from_index(idx: usize) -> Option<SegReg> {
        Some(match idx {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return None,
        })
    }
}

/// Cached selector plus the descriptor fields the core consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    /// Byte-granular limit (already expanded when G is set).
    pub limit: u32,
    /// Attribute bits of the descriptor high dword (`DESC_*`).
    pub flags: u32,
}

impl Segment {
    pub fn real_mode(selector: u16, flags: u32) -> Self {
        Self {
            selector,
            base: u32::from(selector) << 4,
            limit: 0xFFFF,
            flags,
        }
    }

    pub fn dpl(&self) -> u8 {
        ((self.flags >> DESC_DPL_SHIFT) & 3) as u8
    }

    pub fn is_big(&self) -> bool {
        self.flags & DESC_B != 0
    }

    pub fn is_code(&self) -> bool {
        self.flags & DESC_CODE != 0
    }

    pub fn is_conforming_code(&self) -> bool {
        self.flags & (DESC_CODE | DESC_C) == DESC_CODE | DESC_C
    }

    pub fn system_type(&self) -> u32 {
        (self.flags >> DESC_TYPE_SHIFT) & 0xF
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// Attributes a real-mode data segment cache starts with: present, writable, accessed.
pub const REAL_MODE_DATA: u32 = DESC_P | DESC_S | DESC_W | DESC_A;
/// Attributes a real-mode code segment cache starts with.
pub const REAL_MODE_CODE: u32 = DESC_P | DESC_S | DESC_CODE | DESC_R | DESC_A;

#[derive(Debug, Clone)]
pub struct CpuState {
    pub regs: [u32; 8],
    pub eip: u32,
    /// EFLAGS without the arithmetic bits, which live in [`CpuState::flags`].
    pub eflags: u32,
    pub flags: LazyFlags,
    pub segs: [Segment; 8],
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cpl: u8,
    pub halted: bool,
    /// Vector acknowledged from the interrupt controller but not yet delivered.
    pub pending_irq: Option<u8>,
    pub dr: [u32; 8],
    /// Set when CS/SS/DS/ES all have base 0 and SS covers the whole 4 GiB space.
    pub flat: bool,
}

impl Default for CpuState {
    fn default() -> Self {
        let mut state = Self {
            regs: [0; 8],
            eip: 0,
            eflags: FLAG_RESERVED1,
            flags: LazyFlags::default(),
            segs: [Segment::real_mode(0, REAL_MODE_DATA); 8],
            gdt: DescriptorTable {
                base: 0,
                limit: 0xFFFF,
            },
            idt: DescriptorTable {
                base: 0,
                limit: 0x3FF,
            },
            cpl: 0,
            halted: false,
            pending_irq: None,
            dr: [0; 8],
            flat: false,
        };
        state.segs[SegReg::Cs as usize].flags = REAL_MODE_CODE;
        state.segs[SegReg::Ldtr as usize] = Segment::default();
        state.segs[SegReg::Tr as usize] = Segment::default();
        state.update_flat();
        state
    }
}

impl CpuState {
    #[inline]
    pub fn seg(&self, seg: SegReg) -> &Segment {
        &self.segs[seg as usize]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut Segment {
        &mut self.segs[seg as usize]
    }

    /// Full EFLAGS with the lazily tracked bits folded in.
    pub fn get_eflags(&self) -> u32 {
        (self.eflags & !FLAGS_ARITH) | self.flags.compute() | FLAG_RESERVED1
    }

    /// Replaces the bits selected by `mask`, leaving the rest of EFLAGS untouched.
    pub fn set_eflags(&mut self, value: u32, mask: u32) {
        let current = self.get_eflags();
        let merged = (current & !mask) | (value & mask);
        self.flags.set_materialized(merged & FLAGS_ARITH);
        self.eflags = (merged & !FLAGS_ARITH) | FLAG_RESERVED1;
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.eflags & FLAG_IOPL) >> 12) as u8
    }

    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        self.eflags & FLAG_IF != 0
    }

    /// Default operand/address size of the current code segment.
    #[inline]
    pub fn code32(&self) -> bool {
        self.segs[SegReg::Cs as usize].is_big()
    }

    /// Mask applied to ESP for stack accesses (SS.B selects SP or ESP).
    #[inline]
    pub fn stack_mask(&self) -> u32 {
        if self.segs[SegReg::Ss as usize].is_big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn update_flat(&mut self) {
        let s = &self.segs;
        self.flat = s[SegReg::Cs as usize].base == 0
            && s[SegReg::Ss as usize].base == 0
            && s[SegReg::Ds as usize].base == 0
            && s[SegReg::Es as usize].base == 0
            && s[SegReg::Ss as usize].limit == 0xFFFF_FFFF;
    }

    /// Linear address of `seg:offset`.
    #[inline]
    pub fn linear(&self, seg: SegReg, offset: u32) -> u32 {
        match seg {
            SegReg::Es | SegReg::Cs | SegReg::Ss | SegReg::Ds if self.flat => offset,
            _ => self.segs[seg as usize].base.wrapping_add(offset),
        }
    }

    /// Reads an 8-bit register using the ModRM numbering (AL..BL, AH..BH).
    #[inline]
    pub fn reg8(&self, r: usize) -> u8 {
        if r < 4 {
            self.regs[r] as u8
        } else {
            (self.regs[r - 4] >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, r: usize, val: u8) {
        if r < 4 {
            self.regs[r] = (self.regs[r] & !0xFF) | u32::from(val);
        } else {
            self.regs[r - 4] = (self.regs[r - 4] & !0xFF00) | (u32::from(val) << 8);
        }
    }

    #[inline]
    pub fn set_reg16(&mut self, r: usize, val: u16) {
        self.regs[r] = (self.regs[r] & !0xFFFF) | u32::from(val);
    }
}
