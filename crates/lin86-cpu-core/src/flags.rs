//! Lazily evaluated condition codes.
//!
//! ALU handlers record the operation kind, its result and one operand instead of computing six
//! flag bits. Queries rebuild each bit from that record. INC and DEC leave CF untouched, so they
//! stash the previous `(op, dst)` in the secondary slot and carry queries consult it instead.

use crate::state::{FLAGS_ARITH, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    #[inline]
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `bits()` bits of `val` to 32 bits.
    #[inline]
    pub fn sign_extend(self, val: u32) -> u32 {
        match self {
            Width::Byte => val as u8 as i8 as i32 as u32,
            Width::Word => val as u16 as i16 as i32 as u32,
            Width::Dword => val,
        }
    }

    /// Operand width for a 16/32-bit operation.
    #[inline]
    pub fn from_op32(op32: bool) -> Width {
        if op32 {
            Width::Dword
        } else {
            Width::Word
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CcOp {
    Add(Width),
    /// ADC with carry-in set (carry-in clear records as `Add`).
    Adc(Width),
    Sub(Width),
    /// SBB with borrow-in set (borrow-in clear records as `Sub`).
    Sbb(Width),
    Logic(Width),
    Inc(Width),
    Dec(Width),
    /// `src` holds the last bit shifted out.
    Shl(Width),
    Shr(Width),
    Sar(Width),
    /// `src` is non-zero when the product did not fit in the destination.
    Mul(Width),
    /// Flags already computed; `src` holds the arithmetic bits.
    Eflags,
}

impl CcOp {
    #[inline]
    fn width(self) -> Width {
        match self {
            CcOp::Add(w)
            | CcOp::Adc(w)
            | CcOp::Sub(w)
            | CcOp::Sbb(w)
            | CcOp::Logic(w)
            | CcOp::Inc(w)
            | CcOp::Dec(w)
            | CcOp::Shl(w)
            | CcOp::Shr(w)
            | CcOp::Sar(w)
            | CcOp::Mul(w) => w,
            CcOp::Eflags => Width::Dword,
        }
    }

    #[inline]
    fn is_inc_dec(self) -> bool {
        matches!(self, CcOp::Inc(_) | CcOp::Dec(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyFlags {
    pub op: CcOp,
    pub dst: u32,
    pub src: u32,
    pub op2: CcOp,
    pub dst2: u32,
}

impl Default for LazyFlags {
    fn default() -> Self {
        Self {
            op: CcOp::Eflags,
            dst: 0,
            src: 0,
            op2: CcOp::Eflags,
            dst2: 0,
        }
    }
}

impl LazyFlags {
    /// Records an operation with its result `dst` and operand `src`.
    #[inline]
    pub fn record(&mut self, op: CcOp, dst: u32, src: u32) {
        self.op = op;
        self.dst = dst & op.width().mask();
        self.src = src;
    }

    /// Records INC/DEC, keeping the carry of the previous operation reachable.
    #[inline]
    pub fn record_inc_dec(&mut self, op: CcOp, dst: u32) {
        if !self.op.is_inc_dec() {
            self.op2 = self.op;
            self.dst2 = self.dst;
        }
        self.op = op;
        self.dst = dst & op.width().mask();
    }

    /// Replaces the record with explicit flag values (POPF, SAHF, rotates, ...).
    #[inline]
    pub fn set_materialized(&mut self, eflags: u32) {
        self.op = CcOp::Eflags;
        self.src = eflags & FLAGS_ARITH;
        self.dst = 0;
    }

    pub fn cf(&self) -> bool {
        if self.op.is_inc_dec() {
            carry(self.op2, self.dst2, self.src)
        } else {
            carry(self.op, self.dst, self.src)
        }
    }

    pub fn zf(&self) -> bool {
        match self.op {
            CcOp::Eflags => self.src & FLAG_ZF != 0,
            _ => self.dst == 0,
        }
    }

    pub fn sf(&self) -> bool {
        match self.op {
            CcOp::Eflags => self.src & FLAG_SF != 0,
            op => self.dst & op.width().sign_bit() != 0,
        }
    }

    pub fn pf(&self) -> bool {
        match self.op {
            CcOp::Eflags => self.src & FLAG_PF != 0,
            _ => (self.dst as u8).count_ones() % 2 == 0,
        }
    }

    pub fn of(&self) -> bool {
        let (dst, src) = (self.dst, self.src);
        match self.op {
            CcOp::Add(w) => {
                let a = dst.wrapping_sub(src);
                (a ^ dst) & (src ^ dst) & w.sign_bit() != 0
            }
            CcOp::Adc(w) => {
                let a = dst.wrapping_sub(src).wrapping_sub(1);
                (a ^ dst) & (src ^ dst) & w.sign_bit() != 0
            }
            CcOp::Sub(w) => {
                let a = dst.wrapping_add(src);
                (a ^ src) & (a ^ dst) & w.sign_bit() != 0
            }
            CcOp::Sbb(w) => {
                let a = dst.wrapping_add(src).wrapping_add(1);
                (a ^ src) & (a ^ dst) & w.sign_bit() != 0
            }
            CcOp::Logic(_) | CcOp::Sar(_) => false,
            CcOp::Inc(w) => dst == w.sign_bit(),
            CcOp::Dec(w) => dst == w.sign_bit() - 1,
            CcOp::Shl(w) => ((dst >> (w.bits() - 1)) ^ src) & 1 != 0,
            CcOp::Shr(w) => (dst >> (w.bits() - 2)) & 1 != 0,
            CcOp::Mul(_) => src != 0,
            CcOp::Eflags => src & FLAG_OF != 0,
        }
    }

    pub fn af(&self) -> bool {
        let (dst, src) = (self.dst, self.src);
        let a = match self.op {
            CcOp::Add(_) => dst.wrapping_sub(src),
            CcOp::Adc(_) => dst.wrapping_sub(src).wrapping_sub(1),
            CcOp::Sub(_) => dst.wrapping_add(src),
            CcOp::Sbb(_) => dst.wrapping_add(src).wrapping_add(1),
            CcOp::Inc(_) => return (dst ^ dst.wrapping_sub(1)) & 0x10 != 0,
            CcOp::Dec(_) => return (dst ^ dst.wrapping_add(1)) & 0x10 != 0,
            CcOp::Eflags => return src & FLAG_AF != 0,
            _ => return false,
        };
        (a ^ src ^ dst) & 0x10 != 0
    }

    /// Arithmetic bits of EFLAGS.
    pub fn compute(&self) -> u32 {
        if self.op == CcOp::Eflags {
            return self.src & FLAGS_ARITH;
        }
        let mut f = 0;
        if self.cf() {
            f |= FLAG_CF;
        }
        if self.pf() {
            f |= FLAG_PF;
        }
        if self.af() {
            f |= FLAG_AF;
        }
        if self.zf() {
            f |= FLAG_ZF;
        }
        if self.sf() {
            f |= FLAG_SF;
        }
        if self.of() {
            f |= FLAG_OF;
        }
        f
    }

    /// Evaluates condition code `cc` (the low nibble of Jcc/SETcc/CMOVcc).
    pub fn condition(&self, cc: u8) -> bool {
        let r = match cc >> 1 {
            0 => self.of(),
            1 => self.cf(),
            2 => self.zf(),
            3 => self.cf() || self.zf(),
            4 => self.sf(),
            5 => self.pf(),
            6 => self.sf() != self.of(),
            _ => self.zf() || (self.sf() != self.of()),
        };
        r ^ (cc & 1 != 0)
    }
}

fn carry(op: CcOp, dst: u32, src: u32) -> bool {
    match op {
        CcOp::Add(w) => dst & w.mask() < src & w.mask(),
        CcOp::Adc(w) => dst & w.mask() <= src & w.mask(),
        CcOp::Sub(w) => dst.wrapping_add(src) & w.mask() < src & w.mask(),
        CcOp::Sbb(w) => dst.wrapping_add(src).wrapping_add(1) & w.mask() <= src & w.mask(),
        CcOp::Shl(_) | CcOp::Shr(_) | CcOp::Sar(_) => src & 1 != 0,
        CcOp::Mul(_) => src != 0,
        CcOp::Logic(_) | CcOp::Inc(_) | CcOp::Dec(_) => false,
        CcOp::Eflags => src & FLAG_CF != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sub32(a: u32, b: u32) -> LazyFlags {
        let mut f = LazyFlags::default();
        f.record(CcOp::Sub(Width::Dword), a.wrapping_sub(b), b);
        f
    }

    #[test]
    fn inc_preserves_carry_of_previous_op() {
        let mut f = LazyFlags::default();
        f.record(CcOp::Add(Width::Byte), 0xFFu32.wrapping_add(2), 2);
        assert!(f.cf());
        f.record_inc_dec(CcOp::Inc(Width::Byte), 0x80);
        assert!(f.cf());
        assert!(f.of());
        assert!(f.sf());
        f.record_inc_dec(CcOp::Dec(Width::Byte), 0x7F);
        assert!(f.cf());
        assert!(f.of());
        assert!(!f.zf());
    }

    #[test]
    fn inc_after_materialized_flags_keeps_cf() {
        let mut f = LazyFlags::default();
        f.set_materialized(FLAG_CF | FLAG_ZF);
        f.record_inc_dec(CcOp::Inc(Width::Dword), 0);
        assert!(f.cf());
        assert!(f.zf());
        assert!(f.pf());
        assert!(f.af());
    }

    #[test]
    fn byte_add_overflow_and_aux() {
        let mut f = LazyFlags::default();
        f.record(CcOp::Add(Width::Byte), 0x7Fu32 + 1, 1);
        assert!(f.of());
        assert!(f.af());
        assert!(!f.cf());
        assert!(f.sf());
    }

    #[test]
    fn adc_with_carry_in_detects_wrap_to_equal() {
        // 0xFF + 0xFF + 1 = 0x1FF: result byte 0xFF equals src, which is a carry.
        let mut f = LazyFlags::default();
        f.record(CcOp::Adc(Width::Byte), 0x1FF, 0xFF);
        assert!(f.cf());
        assert!(!f.of());
    }

    #[test]
    fn conditions_follow_signed_and_unsigned_order() {
        let f = sub32(1, 2);
        assert!(f.condition(0x2)); // B
        assert!(f.condition(0xC)); // L
        assert!(f.condition(0x6)); // BE
        assert!(!f.condition(0x4)); // E
        let f = sub32(0x8000_0000, 1);
        assert!(f.of());
        assert!(f.condition(0xC)); // L
        assert!(f.condition(0x7)); // A
    }

    #[test]
    fn shifts_report_carry_from_src() {
        let mut f = LazyFlags::default();
        f.record(CcOp::Shl(Width::Byte), 0x80 << 1, 1);
        assert!(f.cf());
        assert!(f.zf());
        assert!(f.of());
        f.record(CcOp::Shr(Width::Dword), 0x4000_0000, 0);
        assert!(!f.cf());
        assert!(f.of());
    }

    proptest! {
        #[test]
        fn sub_flags_match_direct_computation(a: u32, b: u32) {
            let f = sub32(a, b);
            let r = a.wrapping_sub(b);
            prop_assert_eq!(f.zf(), r == 0);
            prop_assert_eq!(f.sf(), (r as i32) < 0);
            prop_assert_eq!(f.cf(), a < b);
            prop_assert_eq!(f.of(), (a as i32).checked_sub(b as i32).is_none());
            prop_assert_eq!(f.af(), (a & 0xF) < (b & 0xF));
            prop_assert_eq!(f.pf(), (r as u8).count_ones() % 2 == 0);
        }

        #[test]
        fn add_flags_match_direct_computation(a: u32, b: u32) {
            let mut f = LazyFlags::default();
            let r = a.wrapping_add(b);
            f.record(CcOp::Add(Width::Dword), r, b);
            prop_assert_eq!(f.cf(), a.checked_add(b).is_none());
            prop_assert_eq!(f.of(), (a as i32).checked_add(b as i32).is_none());
            prop_assert_eq!(f.zf(), r == 0);
        }

        #[test]
        fn byte_sbb_matches_wide_arithmetic(a: u8, b: u8) {
            let mut f = LazyFlags::default();
            let r = u32::from(a).wrapping_sub(u32::from(b)).wrapping_sub(1);
            f.record(CcOp::Sbb(Width::Byte), r, u32::from(b));
            prop_assert_eq!(f.cf(), u16::from(a) < u16::from(b) + 1);
            let signed = i16::from(a as i8) - i16::from(b as i8) - 1;
            prop_assert_eq!(f.of(), !(-128..=127).contains(&signed));
            prop_assert_eq!(f.zf(), r & 0xFF == 0);
        }

        #[test]
        fn materialized_flags_round_trip(bits: u32) {
            let mut f = LazyFlags::default();
            f.set_materialized(bits);
            prop_assert_eq!(f.compute(), bits & FLAGS_ARITH);
        }
    }
}
