//! Instruction decoder for the 386/486 integer instruction set.
//!
//! Decoding pulls bytes through a fetch callback, so the caller decides how code bytes are
//! translated and which faults a fetch raises. Operands are left symbolic: memory operands carry
//! their base/index/displacement and are resolved against the register file at execution time.

use crate::exceptions::Exception;
use crate::flags::Width;
use crate::state::{SegReg, EBP, EBX, EDI, ESI, ESP};

/// Longest legal instruction, prefixes included.
pub(crate) const MAX_INSN_LEN: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rep {
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE.
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    pub default_seg: SegReg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Instr {
    /// Opcode byte; the two-byte map is encoded as `0x100 | second byte`.
    pub opcode: u16,
    pub op32: bool,
    pub addr32: bool,
    pub seg: Option<SegReg>,
    pub rep: Option<Rep>,
    pub lock: bool,
    pub modrm: u8,
    pub mem: Option<MemOperand>,
    pub imm: u32,
    /// Second immediate: the selector of a far pointer, or ENTER's nesting level.
    pub imm2: u32,
    pub len: u32,
}

impl Instr {
    #[inline]
    pub fn reg(&self) -> usize {
        usize::from((self.modrm >> 3) & 7)
    }

    #[inline]
    pub fn rm(&self) -> usize {
        usize::from(self.modrm & 7)
    }

    /// Operand width of the classic byte/full pairs, where bit 0 of the opcode selects full size.
    #[inline]
    pub fn width_from_low_bit(&self) -> Width {
        if self.opcode & 1 == 0 {
            Width::Byte
        } else {
            self.op_width()
        }
    }

    #[inline]
    pub fn op_width(&self) -> Width {
        Width::from_op32(self.op32)
    }

    /// Segment for an access whose default is `default`, honouring an override prefix.
    #[inline]
    pub fn seg_or(&self, default: SegReg) -> SegReg {
        self.seg.unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    Ib,
    Iw,
    /// Iw or Id depending on the operand size.
    Iz,
    /// Direct memory offset, sized by the address size.
    Moffs,
    /// Iz offset followed by an Iw selector.
    Far,
    /// ENTER: Iw frame size then Ib nesting level.
    Enter,
}

struct Fetcher<'a, F> {
    fetch: &'a mut F,
    pos: u32,
}

impl<F> Fetcher<'_, F>
where
    F: FnMut(u32) -> Result<u8, Exception>,
{
    fn u8(&mut self) -> Result<u8, Exception> {
        if self.pos >= MAX_INSN_LEN {
            return Err(Exception::InvalidOpcode);
        }
        let b = (self.fetch)(self.pos)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, Exception> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn u32(&mut self) -> Result<u32, Exception> {
        let lo = self.u16()?;
        let hi = self.u16()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }
}

/// ModRM presence and immediate kind for an opcode, or `None` when it is not implemented.
fn classify(opcode: u16) -> Option<(bool, Imm)> {
    use Imm::*;
    Some(match opcode {
        0x00..=0x3F => match opcode & 7 {
            0..=3 => (true, None),
            4 => (false, Ib),
            5 => (false, Iz),
            // PUSH/POP seg and the BCD adjusts; prefixes and 0F never get here.
            _ => (false, None),
        },
        0x40..=0x61 => (false, None),
        0x62 | 0x63 => (true, None),
        0x68 => (false, Iz),
        0x69 => (true, Iz),
        0x6A => (false, Ib),
        0x6B => (true, Ib),
        0x6C..=0x6F => (false, None),
        0x70..=0x7F => (false, Ib),
        0x80 | 0x82 | 0x83 => (true, Ib),
        0x81 => (true, Iz),
        0x84..=0x8F => (true, None),
        0x90..=0x99 => (false, None),
        0x9A => (false, Far),
        0x9B..=0x9F => (false, None),
        0xA0..=0xA3 => (false, Moffs),
        0xA4..=0xA7 | 0xAA..=0xAF => (false, None),
        0xA8 => (false, Ib),
        0xA9 => (false, Iz),
        0xB0..=0xB7 => (false, Ib),
        0xB8..=0xBF => (false, Iz),
        0xC0 | 0xC1 | 0xC6 => (true, Ib),
        0xC2 | 0xCA => (false, Iw),
        0xC3 | 0xC9 | 0xCB | 0xCC | 0xCE | 0xCF => (false, None),
        0xC4 | 0xC5 => (true, None),
        0xC7 => (true, Iz),
        0xC8 => (false, Enter),
        0xCD => (false, Ib),
        0xD0..=0xD3 => (true, None),
        0xD4 | 0xD5 => (false, Ib),
        0xD6 | 0xD7 => (false, None),
        0xD8..=0xDF => (true, None),
        0xE0..=0xE7 | 0xEB => (false, Ib),
        0xE8 | 0xE9 => (false, Iz),
        0xEA => (false, Far),
        0xEC..=0xEF | 0xF1 | 0xF4 | 0xF5 | 0xF8..=0xFD => (false, None),
        // The F6/F7 immediate depends on the ModRM reg field.
        0xF6 | 0xF7 | 0xFE | 0xFF => (true, None),

        0x100..=0x103 => (true, None),
        0x106 | 0x108 | 0x109 | 0x10B => (false, None),
        0x118..=0x11F => (true, None),
        0x120..=0x123 => (true, None),
        0x130..=0x132 => (false, None),
        0x140..=0x14F => (true, None),
        0x180..=0x18F => (false, Iz),
        0x190..=0x19F => (true, None),
        0x1A0..=0x1A2 | 0x1A8 | 0x1A9 => (false, None),
        0x1A3 | 0x1A5 | 0x1AB | 0x1AD | 0x1AF => (true, None),
        0x1A4 | 0x1AC | 0x1BA => (true, Ib),
        0x1B0..=0x1B7 | 0x1BB..=0x1BF => (true, None),
        0x1C0 | 0x1C1 | 0x1C7 => (true, None),
        0x1C8..=0x1CF => (false, None),
        _ => return Option::None,
    })
}

/// Encodings that exist in the opcode map but are undefined for this ModRM byte.
fn modrm_form_valid(opcode: u16, reg: u8, has_mem: bool) -> bool {
    match opcode {
        0x62 | 0x8D | 0xC4 | 0xC5 | 0x1B2 | 0x1B4 | 0x1B5 => has_mem,
        0x8C | 0x8E => reg <= 5,
        0x8F | 0xC6 | 0xC7 => reg == 0,
        0xFE => reg <= 1,
        0xFF => match reg {
            3 | 5 => has_mem,
            7 => false,
            _ => true,
        },
        0x100 => reg <= 5,
        0x101 => match reg {
            5 => false,
            4 | 6 => true,
            _ => has_mem,
        },
        0x120 | 0x122 => matches!(reg, 0 | 2 | 3 | 4),
        0x1BA => reg >= 4,
        0x1C7 => reg == 1 && has_mem,
        _ => true,
    }
}

fn decode_mem<F>(f: &mut Fetcher<'_, F>, modrm: u8, addr32: bool) -> Result<MemOperand, Exception>
where
    F: FnMut(u32) -> Result<u8, Exception>,
{
    let md = modrm >> 6;
    let rm = modrm & 7;

    if !addr32 {
        let (base, index, bp_based) = match rm {
            0 => (Some(EBX), Some(ESI), false),
            1 => (Some(EBX), Some(EDI), false),
            2 => (Some(EBP), Some(ESI), true),
            3 => (Some(EBP), Some(EDI), true),
            4 => (Some(ESI), None, false),
            5 => (Some(EDI), None, false),
            6 if md == 0 => (None, None, false),
            6 => (Some(EBP), None, true),
            _ => (Some(EBX), None, false),
        };
        let disp = match md {
            0 if rm == 6 => u32::from(f.u16()?),
            0 => 0,
            1 => f.u8()? as i8 as u32,
            _ => u32::from(f.u16()?),
        };
        return Ok(MemOperand {
            base: base.map(|r| r as u8),
            index: index.map(|r| r as u8),
            scale: 0,
            disp,
            default_seg: if bp_based { SegReg::Ss } else { SegReg::Ds },
        });
    }

    let (mut base, mut index, mut scale) = (Some(rm), None, 0);
    let mut disp32_only = md == 0 && rm == 5;
    if rm == 4 {
        let sib = f.u8()?;
        scale = sib >> 6;
        let idx = (sib >> 3) & 7;
        index = (idx != 4).then_some(idx);
        let b = sib & 7;
        base = Some(b);
        if b == 5 && md == 0 {
            disp32_only = true;
        }
    }
    if disp32_only {
        base = None;
    }
    let disp = match md {
        0 if disp32_only => f.u32()?,
        0 => 0,
        1 => f.u8()? as i8 as u32,
        _ => f.u32()?,
    };
    if index.is_none() {
        scale = 0;
    }
    let stack_based = matches!(base, Some(b) if usize::from(b) == ESP || usize::from(b) == EBP);
    Ok(MemOperand {
        base,
        index,
        scale,
        disp,
        default_seg: if stack_based { SegReg::Ss } else { SegReg::Ds },
    })
}

/// Decodes one instruction. `fetch(i)` returns the `i`-th code byte of the instruction.
pub(crate) fn decode<F>(fetch: &mut F, code32: bool) -> Result<Instr, Exception>
where
    F: FnMut(u32) -> Result<u8, Exception>,
{
    let mut f = Fetcher { fetch, pos: 0 };
    let mut op32 = code32;
    let mut addr32 = code32;
    let mut seg = None;
    let mut rep = None;
    let mut lock = false;

    let b = loop {
        let b = f.u8()?;
        match b {
            0x26 => seg = Some(SegReg::Es),
            0x2E => seg = Some(SegReg::Cs),
            0x36 => seg = Some(SegReg::Ss),
            0x3E => seg = Some(SegReg::Ds),
            0x64 => seg = Some(SegReg::Fs),
            0x65 => seg = Some(SegReg::Gs),
            0x66 => op32 = !code32,
            0x67 => addr32 = !code32,
            0xF0 => lock = true,
            0xF2 => rep = Some(Rep::Repne),
            0xF3 => rep = Some(Rep::Rep),
            _ => break b,
        }
    };
    let opcode = if b == 0x0F {
        0x100 | u16::from(f.u8()?)
    } else {
        u16::from(b)
    };
    let (has_modrm, mut imm_kind) = classify(opcode).ok_or(Exception::InvalidOpcode)?;

    let mut instr = Instr {
        opcode,
        op32,
        addr32,
        seg,
        rep,
        lock,
        modrm: 0,
        mem: None,
        imm: 0,
        imm2: 0,
        len: 0,
    };

    if has_modrm {
        let modrm = f.u8()?;
        instr.modrm = modrm;
        // MOV to/from control and debug registers always takes the register form.
        if modrm < 0xC0 && !matches!(opcode, 0x120..=0x123) {
            instr.mem = Some(decode_mem(&mut f, modrm, addr32)?);
        }
        let reg = (modrm >> 3) & 7;
        if !modrm_form_valid(opcode, reg, instr.mem.is_some()) {
            return Err(Exception::InvalidOpcode);
        }
        if matches!(opcode, 0xF6 | 0xF7) && reg < 2 {
            imm_kind = if opcode == 0xF6 { Imm::Ib } else { Imm::Iz };
        }
    }

    match imm_kind {
        Imm::None => {}
        Imm::Ib => instr.imm = u32::from(f.u8()?),
        Imm::Iw => instr.imm = u32::from(f.u16()?),
        Imm::Iz => instr.imm = if op32 { f.u32()? } else { u32::from(f.u16()?) },
        Imm::Moffs => instr.imm = if addr32 { f.u32()? } else { u32::from(f.u16()?) },
        Imm::Far => {
            instr.imm = if op32 { f.u32()? } else { u32::from(f.u16()?) };
            instr.imm2 = u32::from(f.u16()?);
        }
        Imm::Enter => {
            instr.imm = u32::from(f.u16()?);
            instr.imm2 = u32::from(f.u8()?);
        }
    }
    instr.len = f.pos;
    Ok(instr)
}
