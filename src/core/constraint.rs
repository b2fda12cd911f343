// This module implements the constraint model used by every other part of the allocator.
// A Constraint describes the set of legal placements for an operand at one point in the
// instruction stream: which operand kinds are allowed (general purpose, XMM or status
// register, immediate, memory), the operand size, and which physical registers of the
// register kinds are allowed. Constraints are small Copy values that are narrowed with
// intersect() as an operand is seen by more instructions, widened with union() when the
// opcode table folds several encodings into one group, and compared with contains() when
// checking whether a concrete placement is encodable. The null constraint signals "no
// legal placement" and every consumer checks for it before use.

//! Operand constraints: kind set, size and register mask.

use super::register_file::{RegKind, RegName};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Set of operand kinds a constraint allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpndKind(u8);

impl OpndKind {
    pub const NONE: Self = Self(0);
    pub const GP_REG: Self = Self(1);
    pub const XMM_REG: Self = Self(2);
    pub const STATUS_REG: Self = Self(4);
    pub const IMM: Self = Self(8);
    pub const MEM: Self = Self(16);
    /// All register kinds.
    pub const REG: Self = Self(1 | 2 | 4);
    pub const ANY: Self = Self(31);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn has_reg(self) -> bool {
        self.intersects(Self::REG)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for OpndKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for OpndKind {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for OpndKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpndKind, &str); 5] = [
            (OpndKind::GP_REG, "gp"),
            (OpndKind::XMM_REG, "xmm"),
            (OpndKind::STATUS_REG, "status"),
            (OpndKind::IMM, "imm"),
            (OpndKind::MEM, "mem"),
        ];
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (kind, name) in NAMES {
            if self.contains(kind) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Native operand widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum OpndSize {
    /// Matches every size.
    #[default]
    Any,
    S8,
    S16,
    S32,
    S64,
    S128,
}

impl OpndSize {
    /// Width in bytes; `Any` is treated as a machine word.
    pub const fn bytes(self) -> u32 {
        match self {
            OpndSize::Any | OpndSize::S32 => 4,
            OpndSize::S8 => 1,
            OpndSize::S16 => 2,
            OpndSize::S64 => 8,
            OpndSize::S128 => 16,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// Bit mask selecting the value bits of an operand of this size.
    pub const fn value_mask(self) -> u64 {
        match self {
            OpndSize::S64 | OpndSize::S128 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    pub fn compatible(self, other: Self) -> bool {
        self == OpndSize::Any || other == OpndSize::Any || self == other
    }

    /// The narrower of two compatible sizes.
    pub fn meet(self, other: Self) -> Option<Self> {
        match (self, other) {
            (OpndSize::Any, s) | (s, OpndSize::Any) => Some(s),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for OpndSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpndSize::Any => write!(f, "any"),
            size => write!(f, "{}", size.bits()),
        }
    }
}

/// Legal placements of an operand: `{kind set, size, register mask}`.
///
/// The mask applies to whichever register kinds are present in `kind`. A
/// constraint that allows a register kind always carries a non-empty mask;
/// the constructors drop register kinds whose mask is empty.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Constraint {
    kind: OpndKind,
    size: OpndSize,
    mask: u32,
}

impl Constraint {
    /// The constraint that allows nothing.
    pub const NULL: Self = Self {
        kind: OpndKind::NONE,
        size: OpndSize::Any,
        mask: 0,
    };

    pub fn new(kind: OpndKind, size: OpndSize, mask: u32) -> Self {
        let mut kind = kind;
        let mut mask = mask;
        if mask == 0 {
            kind = kind.without(OpndKind::REG);
        }
        if !kind.has_reg() {
            mask = 0;
        }
        if kind.is_empty() {
            return Self::NULL;
        }
        Self { kind, size, mask }
    }

    /// Registers of one kind selected by `mask`.
    pub fn reg(kind: RegKind, size: OpndSize, mask: u32) -> Self {
        Self::new(kind.opnd_kind(), size, mask)
    }

    /// Exactly one register.
    pub fn fixed(reg: RegName) -> Self {
        Self::new(reg.kind.opnd_kind(), reg.size, 1 << reg.index)
    }

    pub fn mem(size: OpndSize) -> Self {
        Self::new(OpndKind::MEM, size, 0)
    }

    pub fn imm() -> Self {
        Self::new(OpndKind::IMM, OpndSize::Any, 0)
    }

    pub fn kind(&self) -> OpndKind {
        self.kind
    }

    pub fn size(&self) -> OpndSize {
        self.size
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn is_null(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn allows_mem(&self) -> bool {
        self.kind.contains(OpndKind::MEM)
    }

    pub fn allows_imm(&self) -> bool {
        self.kind.contains(OpndKind::IMM)
    }

    pub fn has_reg(&self) -> bool {
        self.kind.has_reg()
    }

    /// Register mask restricted to one register kind.
    pub fn reg_mask(&self, kind: RegKind) -> u32 {
        if self.kind.contains(kind.opnd_kind()) {
            self.mask
        } else {
            0
        }
    }

    /// Whether `reg` (at its own size) is a legal placement.
    pub fn allows_reg(&self, reg: RegName) -> bool {
        self.size.compatible(reg.size) && self.reg_mask(reg.kind) & (1 << reg.index) != 0
    }

    /// Number of registers the constraint allows.
    pub fn reg_count(&self) -> u32 {
        self.mask.count_ones()
    }

    /// Narrowing: placements allowed by both constraints.
    pub fn intersect(&self, other: &Constraint) -> Constraint {
        let Some(size) = self.size.meet(other.size) else {
            return Self::NULL;
        };
        Self::new(self.kind & other.kind, size, self.mask & other.mask)
    }

    /// Widening: placements allowed by either constraint. `None` when the
    /// sizes are incompatible.
    pub fn union(&self, other: &Constraint) -> Option<Constraint> {
        if self.is_null() {
            return Some(*other);
        }
        if other.is_null() {
            return Some(*self);
        }
        if !self.size.compatible(other.size) {
            return None;
        }
        let size = if self.size == other.size {
            self.size
        } else {
            OpndSize::Any
        };
        Some(Self::new(self.kind | other.kind, size, self.mask | other.mask))
    }

    /// Does `self` allow everything `other` allows?
    pub fn contains(&self, other: &Constraint) -> bool {
        if other.is_null() {
            return true;
        }
        if self.size != OpndSize::Any && self.size != other.size {
            return false;
        }
        self.kind.contains(other.kind) && other.mask & !self.mask == 0
    }

    pub fn with_size(&self, size: OpndSize) -> Constraint {
        Self::new(self.kind, size, self.mask)
    }

    pub fn without_mem(&self) -> Constraint {
        Self::new(self.kind.without(OpndKind::MEM), self.size, self.mask)
    }

    pub fn with_mask(&self, mask: u32) -> Constraint {
        Self::new(self.kind, self.size, mask)
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "<null>");
        }
        write!(f, "{}:{}", self.kind, self.size)?;
        if self.kind.has_reg() {
            write!(f, "{{{:#x}}}", self.mask)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gp32(mask: u32) -> Constraint {
        Constraint::reg(RegKind::Gp, OpndSize::S32, mask)
    }

    #[test]
    fn test_intersect_narrows_mask() {
        let a = gp32(0b0111);
        let b = gp32(0b0110);
        let c = a.intersect(&b);
        assert_eq!(c.mask(), 0b0110);
        assert_eq!(c.size(), OpndSize::S32);
        assert!(c.has_reg());
    }

    #[test]
    fn test_intersect_disjoint_registers_keeps_memory() {
        let rm = Constraint::new(OpndKind::GP_REG | OpndKind::MEM, OpndSize::S32, 0b01);
        let r = Constraint::new(OpndKind::GP_REG | OpndKind::MEM, OpndSize::S32, 0b10);
        let c = rm.intersect(&r);
        assert!(!c.has_reg());
        assert!(c.allows_mem());
        assert_eq!(c.mask(), 0);
    }

    #[test]
    fn test_intersect_size_conflict_is_null() {
        let a = gp32(0xff);
        let b = Constraint::reg(RegKind::Gp, OpndSize::S8, 0x0f);
        assert!(a.intersect(&b).is_null());
        // Any adopts the concrete size.
        let any = Constraint::reg(RegKind::Gp, OpndSize::Any, 0x3);
        assert_eq!(any.intersect(&b).size(), OpndSize::S8);
    }

    #[test]
    fn test_union_requires_compatible_sizes() {
        let a = gp32(0b01);
        let m = Constraint::mem(OpndSize::S32);
        let u = a.union(&m).unwrap();
        assert!(u.allows_mem());
        assert_eq!(u.mask(), 0b01);

        let b = Constraint::reg(RegKind::Gp, OpndSize::S8, 0b10);
        assert!(a.union(&b).is_none());
        assert_eq!(Constraint::NULL.union(&b), Some(b));
    }

    #[test]
    fn test_contains() {
        let rm = gp32(0xff).union(&Constraint::mem(OpndSize::S32)).unwrap();
        assert!(rm.contains(&gp32(0b100)));
        assert!(rm.contains(&Constraint::mem(OpndSize::S32)));
        assert!(!gp32(0xff).contains(&Constraint::mem(OpndSize::S32)));
        assert!(!gp32(0b1).contains(&gp32(0b11)));
        assert!(rm.contains(&Constraint::NULL));
    }

    #[test]
    fn test_empty_mask_never_allows_registers() {
        let c = gp32(0);
        assert!(c.is_null());
        let c = Constraint::new(OpndKind::XMM_REG | OpndKind::MEM, OpndSize::S64, 0);
        assert!(!c.has_reg());
        assert!(c.allows_mem());
    }

    #[test]
    fn test_allows_reg_checks_size() {
        let c = Constraint::reg(RegKind::Gp, OpndSize::S8, 0x0f);
        assert!(c.allows_reg(RegName::new(RegKind::Gp, OpndSize::S8, 1)));
        assert!(!c.allows_reg(RegName::new(RegKind::Gp, OpndSize::S32, 1)));
        assert!(!c.allows_reg(RegName::new(RegKind::Gp, OpndSize::S8, 6)));
    }
}
