// This module describes the IA-32 register file as seen by the allocator. RegName names a
// physical register at a particular size (eax/ax/al, xmm3, flags) and can produce the alias
// of the same physical register at another size. RegMasks keeps one bit mask per register
// kind and is the workhorse for busy/free/clobber sets during allocation. Registers is the
// register-class table: one Constraint per register kind describing the registers the
// allocator may hand out, built once from the `regs` option ("ALL" or an explicit comma
// separated list of register names) and immutable for the rest of a run.

//! Register names, per-kind register masks and the register-class table.

use super::constraint::{Constraint, OpndKind, OpndSize};
use super::error::{AllocError, AllocResult};
use std::fmt;

/// Number of register kinds (general purpose, XMM, status).
pub const NUM_REG_KINDS: usize = 3;

/// Registers per kind on IA-32.
pub const REGS_PER_KIND: u8 = 8;

/// General purpose registers in hardware encoding order.
pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

/// General purpose registers usable by the allocator when `regs=ALL`.
/// The stack and frame pointers are reserved.
pub const GP_ALLOCATABLE: u32 = 0xFF & !(1 << ESP) & !(1 << EBP);

/// General purpose registers with an 8-bit low view.
pub const GP8_MASK: u32 = 0x0F;

const GP32_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const GP16_NAMES: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
const GP8_NAMES: [&str; 4] = ["al", "cl", "dl", "bl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegKind {
    Gp,
    Xmm,
    Status,
}

impl RegKind {
    pub const ALL: [RegKind; NUM_REG_KINDS] = [RegKind::Gp, RegKind::Xmm, RegKind::Status];

    pub const fn index(self) -> usize {
        match self {
            RegKind::Gp => 0,
            RegKind::Xmm => 1,
            RegKind::Status => 2,
        }
    }

    pub const fn opnd_kind(self) -> OpndKind {
        match self {
            RegKind::Gp => OpndKind::GP_REG,
            RegKind::Xmm => OpndKind::XMM_REG,
            RegKind::Status => OpndKind::STATUS_REG,
        }
    }

    /// Mask of every register of this kind, reserved ones included.
    pub const fn full_mask(self) -> u32 {
        match self {
            RegKind::Gp | RegKind::Xmm => 0xFF,
            RegKind::Status => 0x1,
        }
    }
}

/// A physical register viewed at one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegName {
    pub kind: RegKind,
    pub size: OpndSize,
    pub index: u8,
}

impl RegName {
    pub const fn new(kind: RegKind, size: OpndSize, index: u8) -> Self {
        Self { kind, size, index }
    }

    pub const fn gp32(index: u8) -> Self {
        Self::new(RegKind::Gp, OpndSize::S32, index)
    }

    pub const fn xmm(index: u8) -> Self {
        Self::new(RegKind::Xmm, OpndSize::S64, index)
    }

    pub const FLAGS: RegName = RegName::new(RegKind::Status, OpndSize::S32, 0);

    pub fn mask(&self) -> u32 {
        1 << self.index
    }

    /// The same physical register viewed at `size`, if such a view exists.
    pub fn alias(&self, size: OpndSize) -> Option<RegName> {
        let ok = match self.kind {
            RegKind::Gp => match size {
                OpndSize::S32 | OpndSize::S16 => true,
                OpndSize::S8 => GP8_MASK & self.mask() != 0,
                _ => false,
            },
            RegKind::Xmm => matches!(size, OpndSize::S32 | OpndSize::S64 | OpndSize::S128),
            RegKind::Status => size == self.size,
        };
        ok.then_some(RegName { size, ..*self })
    }

    /// Parse an assembler register name such as `eax`, `cl`, `xmm2` or `flags`.
    pub fn parse(name: &str) -> Option<RegName> {
        if name == "flags" || name == "eflags" {
            return Some(RegName::FLAGS);
        }
        if let Some(num) = name.strip_prefix("xmm") {
            let index: u8 = num.parse().ok()?;
            return (index < REGS_PER_KIND).then(|| RegName::xmm(index));
        }
        let find = |table: &[&str], size| {
            table
                .iter()
                .position(|n| *n == name)
                .map(|i| RegName::new(RegKind::Gp, size, i as u8))
        };
        find(&GP32_NAMES, OpndSize::S32)
            .or_else(|| find(&GP16_NAMES, OpndSize::S16))
            .or_else(|| find(&GP8_NAMES, OpndSize::S8))
    }
}

impl fmt::Display for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.index as usize;
        match (self.kind, self.size) {
            (RegKind::Gp, OpndSize::S8) if i < GP8_NAMES.len() => write!(f, "{}", GP8_NAMES[i]),
            (RegKind::Gp, OpndSize::S16) => write!(f, "{}", GP16_NAMES[i & 7]),
            (RegKind::Gp, _) => write!(f, "{}", GP32_NAMES[i & 7]),
            (RegKind::Xmm, _) => write!(f, "xmm{i}"),
            (RegKind::Status, _) => write!(f, "flags"),
        }
    }
}

/// One register bit mask per register kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegMasks {
    kinds: [u32; NUM_REG_KINDS],
}

impl RegMasks {
    pub const EMPTY: RegMasks = RegMasks {
        kinds: [0; NUM_REG_KINDS],
    };

    pub fn new() -> Self {
        Self::EMPTY
    }

    pub fn from_reg(reg: RegName) -> Self {
        let mut masks = Self::new();
        masks.set(reg);
        masks
    }

    pub fn contains(&self, reg: RegName) -> bool {
        self.kinds[reg.kind.index()] & reg.mask() != 0
    }

    pub fn set(&mut self, reg: RegName) {
        self.kinds[reg.kind.index()] |= reg.mask();
    }

    pub fn clear(&mut self, reg: RegName) {
        self.kinds[reg.kind.index()] &= !reg.mask();
    }

    pub fn get(&self, kind: RegKind) -> u32 {
        self.kinds[kind.index()]
    }

    pub fn set_mask(&mut self, kind: RegKind, mask: u32) {
        self.kinds[kind.index()] = mask;
    }

    pub fn union(&mut self, other: &RegMasks) {
        for (a, b) in self.kinds.iter_mut().zip(other.kinds) {
            *a |= b;
        }
    }

    pub fn intersect(&mut self, other: &RegMasks) {
        for (a, b) in self.kinds.iter_mut().zip(other.kinds) {
            *a &= b;
        }
    }

    pub fn count_in_kind(&self, kind: RegKind) -> u32 {
        self.kinds[kind.index()].count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.iter().all(|m| *m == 0)
    }

    /// Registers set in this mask, in kind then index order.
    pub fn iter(&self) -> impl Iterator<Item = (RegKind, u8)> + '_ {
        RegKind::ALL.into_iter().flat_map(move |kind| {
            let mask = self.get(kind);
            (0..32u8).filter(move |i| mask & (1 << i) != 0).map(move |i| (kind, i))
        })
    }
}

/// Register-class table: the registers the allocator may use, per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    classes: [Constraint; NUM_REG_KINDS],
}

impl Registers {
    /// Every allocatable register in every class.
    pub fn all() -> Self {
        Self::from_masks(GP_ALLOCATABLE, RegKind::Xmm.full_mask())
    }

    fn from_masks(gp: u32, xmm: u32) -> Self {
        let class = |kind: RegKind, mask: u32| Constraint::reg(kind, OpndSize::Any, mask);
        Self {
            classes: [
                class(RegKind::Gp, gp),
                class(RegKind::Xmm, xmm),
                // The status class is always available.
                class(RegKind::Status, RegKind::Status.full_mask()),
            ],
        }
    }

    /// Build the table from a `regs` option value.
    pub fn parse(spec: &str) -> AllocResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("ALL") {
            return Ok(Self::all());
        }

        let mut gp = 0;
        let mut xmm = 0;
        for name in spec.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let reg = RegName::parse(name).ok_or_else(|| AllocError::UnknownRegister {
                name: name.to_string(),
            })?;
            match reg.kind {
                RegKind::Gp => gp |= reg.mask(),
                RegKind::Xmm => xmm |= reg.mask(),
                RegKind::Status => {}
            }
        }
        log::debug!("register classes from '{}': gp={:#x} xmm={:#x}", spec, gp, xmm);
        Ok(Self::from_masks(gp, xmm))
    }

    pub fn class(&self, kind: RegKind) -> &Constraint {
        &self.classes[kind.index()]
    }

    /// Register mask usable for `kind`.
    pub fn mask(&self, kind: RegKind) -> u32 {
        self.classes[kind.index()].mask()
    }

    /// The class an operand with the given accumulated constraint belongs to:
    /// the first class whose registers it may occupy.
    pub fn class_of(&self, constraint: &Constraint) -> Option<RegKind> {
        RegKind::ALL
            .into_iter()
            .find(|kind| constraint.kind().contains(kind.opnd_kind()))
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_names() {
        assert_eq!(RegName::parse("eax"), Some(RegName::gp32(EAX)));
        assert_eq!(
            RegName::parse("cl"),
            Some(RegName::new(RegKind::Gp, OpndSize::S8, ECX))
        );
        assert_eq!(RegName::parse("xmm7"), Some(RegName::xmm(7)));
        assert_eq!(RegName::parse("xmm8"), None);
        assert_eq!(RegName::parse("rax"), None);
        assert_eq!(RegName::parse("flags"), Some(RegName::FLAGS));
    }

    #[test]
    fn test_alias() {
        let eax = RegName::gp32(EAX);
        let al = eax.alias(OpndSize::S8).unwrap();
        assert_eq!(al.to_string(), "al");
        assert_eq!(al.alias(OpndSize::S32), Some(eax));
        assert_eq!(eax.alias(OpndSize::S16).unwrap().to_string(), "ax");
        assert_eq!(RegName::gp32(ESI).alias(OpndSize::S8), None);
        assert_eq!(RegName::xmm(2).alias(OpndSize::S8), None);
        assert_eq!(RegName::xmm(2).alias(OpndSize::S32).unwrap().to_string(), "xmm2");
    }

    #[test]
    fn test_regmasks_operations() {
        let mut set = RegMasks::new();
        let ebx = RegName::gp32(EBX);
        let xmm1 = RegName::xmm(1);

        assert!(!set.contains(ebx));
        set.set(ebx);
        set.set(xmm1);
        assert!(set.contains(ebx));
        // Size does not matter for membership.
        assert!(set.contains(ebx.alias(OpndSize::S8).unwrap()));
        assert_eq!(set.count_in_kind(RegKind::Gp), 1);

        let mut other = RegMasks::from_reg(xmm1);
        other.union(&RegMasks::from_reg(RegName::gp32(EAX)));
        set.intersect(&other);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(RegKind::Xmm, 1)]);

        set.clear(xmm1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_registers_all() {
        let regs = Registers::parse("ALL").unwrap();
        assert_eq!(regs.mask(RegKind::Gp), GP_ALLOCATABLE);
        assert_eq!(regs.mask(RegKind::Gp) & (1 << ESP), 0);
        assert_eq!(regs.mask(RegKind::Xmm), 0xFF);
        assert_eq!(regs.mask(RegKind::Status), 1);
    }

    #[test]
    fn test_registers_list() {
        let regs = Registers::parse("eax, ecx,xmm0").unwrap();
        assert_eq!(regs.mask(RegKind::Gp), 0b11);
        assert_eq!(regs.mask(RegKind::Xmm), 0b1);
        assert_eq!(regs.mask(RegKind::Status), 1);

        let err = Registers::parse("eax,r9").unwrap_err();
        assert!(matches!(err, AllocError::UnknownRegister { name } if name == "r9"));
    }

    #[test]
    fn test_class_of() {
        let regs = Registers::all();
        let c = Constraint::new(OpndKind::GP_REG | OpndKind::MEM, OpndSize::S32, 0xF);
        assert_eq!(regs.class_of(&c), Some(RegKind::Gp));
        assert_eq!(regs.class_of(&Constraint::mem(OpndSize::S32)), None);
        assert_eq!(
            regs.class_of(&Constraint::fixed(RegName::FLAGS)),
            Some(RegKind::Status)
        );
    }
}
