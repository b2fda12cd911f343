// This module holds the static IA-32 opcode table the allocator queries for operand
// constraints. Instructions are grouped once per (mnemonic, arity); each group lists the
// operand role of every position (Def, Use or both) and the encodable forms, where a form is
// one Constraint per position. The positional oracle `OpcodeGroup::constraint` answers "what
// may operand N be, given which other positions already hold a register, memory or an
// immediate" as the union over all forms compatible with those placements, and
// `match_form` is the final encodability check of fully placed instructions.
// `find_opcode_group` resolves a mnemonic and a candidate operand list to a group,
// preferring exact matches over flexible ones. The table also records implicit effects:
// arithmetic writes the flags, calls clobber the caller-saved registers.

//! IA-32 opcode groups and the positional constraint oracle.

use crate::core::constraint::{Constraint, OpndKind, OpndSize};
use crate::core::register_file::{RegKind, RegMasks, RegName, ECX, EAX};
use crate::ia32::calling_convention::Cdecl;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::fmt;
use std::ops::BitOr;

/// Maximum number of explicit operands of any instruction.
pub const MAX_OPNDS: usize = 4;

/// Operand role flags at one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Role(u8);

impl Role {
    pub const NONE: Role = Role(0);
    pub const DEF: Role = Role(1);
    pub const USE: Role = Role(2);
    pub const DEF_USE: Role = Role(3);
    /// The value is not live after this touch.
    pub const END: Role = Role(4);

    pub const fn is_def(self) -> bool {
        self.0 & Self::DEF.0 != 0
    }

    pub const fn is_use(self) -> bool {
        self.0 & Self::USE.0 != 0
    }

    pub const fn is_end(self) -> bool {
        self.0 & Self::END.0 != 0
    }

    /// Def without Use.
    pub const fn is_pure_def(self) -> bool {
        self.is_def() && !self.is_use()
    }
}

impl BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        Role(self.0 | rhs.0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = if self.is_def() { "D" } else { "" };
        let u = if self.is_use() { "U" } else { "" };
        let e = if self.is_end() { "E" } else { "" };
        write!(f, "{d}{u}{e}")
    }
}

/// Condition codes of `j`, `set` and `cmov`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    E,
    NE,
    L,
    G,
    LE,
    GE,
}

impl Cond {
    pub fn parse(s: &str) -> Option<Cond> {
        Some(match s {
            "e" | "z" => Cond::E,
            "ne" | "nz" => Cond::NE,
            "l" => Cond::L,
            "g" => Cond::G,
            "le" => Cond::LE,
            "ge" => Cond::GE,
            _ => return None,
        })
    }

    /// Evaluate against a comparison outcome (-1, 0 or 1).
    pub fn holds(self, ordering: i64) -> bool {
        match self {
            Cond::E => ordering == 0,
            Cond::NE => ordering != 0,
            Cond::L => ordering < 0,
            Cond::G => ordering > 0,
            Cond::LE => ordering <= 0,
            Cond::GE => ordering >= 0,
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cond::E => "e",
            Cond::NE => "ne",
            Cond::L => "l",
            Cond::G => "g",
            Cond::LE => "le",
            Cond::GE => "ge",
        };
        write!(f, "{s}")
    }
}

/// Broad behaviour of a group, as far as the allocator cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Plain,
    /// Register or memory copy; candidates for coalescing.
    Move,
    Call,
    Jump,
    CondJump,
    Return,
}

/// Which positions of an instruction currently hold a register, memory or
/// an immediate. Virtual positions are in none of the masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placed {
    pub reg: u8,
    pub mem: u8,
    pub imm: u8,
}

impl Placed {
    pub fn without(self, positions: u8) -> Placed {
        Placed {
            reg: self.reg & !positions,
            mem: self.mem & !positions,
            imm: self.imm & !positions,
        }
    }

    pub fn with_mem(self, positions: u8) -> Placed {
        Placed {
            mem: self.mem | positions,
            ..self.without(positions)
        }
    }

    pub fn with_reg(self, positions: u8) -> Placed {
        Placed {
            reg: self.reg | positions,
            ..self.without(positions)
        }
    }
}

#[derive(Debug)]
pub struct OpcodeGroup {
    pub mnemonic: &'static str,
    pub kind: GroupKind,
    roles: Vec<Role>,
    forms: Vec<Vec<Constraint>>,
    /// Registers written without appearing as operands.
    pub implicit_defs: RegMasks,
    /// Registers whose values do not survive the instruction.
    pub clobbers: RegMasks,
    /// Takes a condition code suffix.
    pub has_cond: bool,
    /// Definitions are conditional, so the destination is also read.
    pub conditional: bool,
    /// Position of a call or indirect jump target.
    pub target: Option<usize>,
}

impl OpcodeGroup {
    pub fn arity(&self) -> usize {
        self.roles.len()
    }

    pub fn role(&self, idx: usize) -> Role {
        let role = self.roles.get(idx).copied().unwrap_or(Role::NONE);
        if self.conditional && role.is_def() {
            role | Role::USE
        } else {
            role
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            GroupKind::Jump | GroupKind::CondJump | GroupKind::Return
        )
    }

    pub fn is_call(&self) -> bool {
        self.kind == GroupKind::Call
    }

    fn compatible(form: &[Constraint], placed: Placed) -> bool {
        form.iter().enumerate().all(|(i, c)| {
            let bit = 1u8 << i;
            (placed.mem & bit == 0 || c.allows_mem())
                && (placed.reg & bit == 0 || c.has_reg())
                && (placed.imm & bit == 0 || c.allows_imm())
        })
    }

    /// Constraint on position `idx` given the other positions' placements.
    pub fn constraint(&self, idx: usize, placed: Placed, size: OpndSize) -> Constraint {
        let placed = placed.without(1 << idx);
        let mut result = Constraint::NULL;
        for form in &self.forms {
            let Some(c) = form.get(idx) else { continue };
            if !c.size().compatible(size) || !Self::compatible(form, placed) {
                continue;
            }
            result = result.union(c).unwrap_or(result);
        }
        if result.is_null() || size == OpndSize::Any {
            result
        } else {
            result.with_size(size)
        }
    }

    /// Can every position in `positions` be memory at once?
    pub fn allows_memory(&self, positions: u8, placed: Placed) -> bool {
        let placed = placed.with_mem(positions);
        self.forms.iter().any(|form| Self::compatible(form, placed))
    }

    /// Exact encodability: some form contains every concrete operand.
    pub fn match_form(&self, actual: &[Constraint]) -> bool {
        self.forms.iter().any(|form| {
            form.len() == actual.len() && form.iter().zip(actual).all(|(f, a)| f.contains(a))
        })
    }

    /// Flexible fit: some form overlaps every candidate constraint.
    fn fits(&self, candidates: &[Constraint]) -> bool {
        self.forms.iter().any(|form| {
            form.len() == candidates.len()
                && form
                    .iter()
                    .zip(candidates)
                    .all(|(f, c)| !f.intersect(c).is_null())
        })
    }
}

/// All opcode groups, indexed by (mnemonic, arity).
pub struct OpcodeTable {
    groups: Vec<OpcodeGroup>,
    index: HashMap<&'static str, Vec<usize>>,
}

lazy_static! {
    static ref OPCODES: OpcodeTable = OpcodeTable::build();
}

/// The process-wide IA-32 opcode table.
pub fn opcode_table() -> &'static OpcodeTable {
    &OPCODES
}

impl OpcodeTable {
    pub fn group(&self, mnemonic: &str, arity: usize) -> Option<&OpcodeGroup> {
        self.group_id(mnemonic, arity).map(|i| &self.groups[i])
    }

    pub fn group_id(&self, mnemonic: &str, arity: usize) -> Option<usize> {
        self.index
            .get(mnemonic)?
            .iter()
            .copied()
            .find(|&i| self.groups[i].arity() == arity)
    }

    pub fn by_id(&self, id: usize) -> &OpcodeGroup {
        &self.groups[id]
    }

    pub fn knows(&self, mnemonic: &str) -> bool {
        self.index.contains_key(mnemonic)
    }

    /// The group for `mnemonic` whose forms accept `constraints`, preferring
    /// an exact match over a flexible one.
    pub fn find_opcode_group(
        &self,
        mnemonic: &str,
        constraints: &[Constraint],
    ) -> Option<&OpcodeGroup> {
        let group = self.group(mnemonic, constraints.len())?;
        if group.match_form(constraints) {
            return Some(group);
        }
        if group.fits(constraints) {
            log::trace!("{} matched flexibly", mnemonic);
            return Some(group);
        }
        None
    }

    fn build() -> Self {
        use OpndSize::*;

        let gp = |size| Constraint::reg(RegKind::Gp, size, 0xFF);
        let gp8 = Constraint::reg(RegKind::Gp, S8, 0x0F);
        let rm = |size| Constraint::new(OpndKind::GP_REG | OpndKind::MEM, size, 0xFF);
        let rm8 = Constraint::new(OpndKind::GP_REG | OpndKind::MEM, S8, 0x0F);
        let xmm = |size| Constraint::reg(RegKind::Xmm, size, 0xFF);
        let xm = |size| Constraint::new(OpndKind::XMM_REG | OpndKind::MEM, size, 0xFF);
        let mem = Constraint::mem;
        let imm = Constraint::imm();
        let rmi = Constraint::new(OpndKind::GP_REG | OpndKind::MEM | OpndKind::IMM, Any, 0xFF);
        let flags = Constraint::fixed(RegName::FLAGS);
        let eax = Constraint::fixed(RegName::gp32(EAX));
        let cl = Constraint::reg(RegKind::Gp, S8, 1 << ECX);

        let (def, use_, def_use) = (Role::DEF, Role::USE, Role::DEF_USE);
        let mut b = TableBuilder::default();

        b.group("mov", &[def, use_], GroupKind::Move)
            .form(&[gp(S32), rm(S32)])
            .form(&[rm(S32), gp(S32)])
            .form(&[rm(S32), imm])
            .form(&[gp8, rm8])
            .form(&[rm8, gp8])
            .form(&[rm8, imm]);

        for name in ["add", "sub", "and", "or", "xor"] {
            b.group(name, &[def_use, use_], GroupKind::Plain)
                .form(&[gp(S32), rm(S32)])
                .form(&[rm(S32), gp(S32)])
                .form(&[rm(S32), imm])
                .form(&[gp8, rm8])
                .form(&[rm8, gp8])
                .form(&[rm8, imm])
                .defines_flags();
        }

        b.group("imul", &[def_use, use_], GroupKind::Plain)
            .form(&[gp(S32), rm(S32)])
            .defines_flags();

        b.group("cmp", &[def, use_, use_], GroupKind::Plain)
            .form(&[flags, rm(S32), gp(S32)])
            .form(&[flags, gp(S32), rm(S32)])
            .form(&[flags, rm(S32), imm])
            .form(&[flags, rm8, gp8])
            .form(&[flags, gp8, rm8])
            .form(&[flags, rm8, imm]);

        b.group("test", &[def, use_, use_], GroupKind::Plain)
            .form(&[flags, rm(S32), gp(S32)])
            .form(&[flags, rm(S32), imm])
            .form(&[flags, rm8, gp8]);

        for name in ["shl", "shr", "sar"] {
            b.group(name, &[def_use, use_], GroupKind::Plain)
                .form(&[rm(S32), cl])
                .form(&[rm(S32), imm])
                .defines_flags();
        }

        b.group("set", &[use_, def], GroupKind::Plain)
            .form(&[flags, rm8])
            .with_cond();

        b.group("cmov", &[use_, def, use_], GroupKind::Plain)
            .form(&[flags, gp(S32), rm(S32)])
            .with_cond()
            .conditional();

        b.group("j", &[use_], GroupKind::CondJump)
            .form(&[flags])
            .with_cond();

        b.group("jmp", &[], GroupKind::Jump).form(&[]);
        b.group("jmp", &[use_], GroupKind::Jump)
            .form(&[rm(S32)])
            .target(0);

        let clobbers = Cdecl::caller_saved();
        b.group("call", &[use_], GroupKind::Call)
            .form(&[rmi])
            .target(0)
            .clobbers(clobbers);
        b.group("call", &[def, use_], GroupKind::Call)
            .form(&[eax, rmi])
            .target(1)
            .clobbers(clobbers);

        b.group("ret", &[], GroupKind::Return).form(&[]);
        b.group("ret", &[use_], GroupKind::Return).form(&[eax]);

        b.group("push", &[use_], GroupKind::Plain)
            .form(&[rm(S32)])
            .form(&[imm]);

        for (name, size) in [("movss", S32), ("movsd", S64)] {
            b.group(name, &[def, use_], GroupKind::Move)
                .form(&[xmm(size), xm(size)])
                .form(&[mem(size), xmm(size)]);
        }

        for (name, size) in [
            ("addss", S32),
            ("addsd", S64),
            ("subsd", S64),
            ("mulsd", S64),
        ] {
            b.group(name, &[def_use, use_], GroupKind::Plain)
                .form(&[xmm(size), xm(size)]);
        }

        b.group("cvtsi2sd", &[def, use_], GroupKind::Plain)
            .form(&[xmm(S64), rm(S32)]);
        b.group("cvttsd2si", &[def, use_], GroupKind::Plain)
            .form(&[gp(S32), xm(S64)]);

        b.finish()
    }
}

#[derive(Default)]
struct TableBuilder {
    groups: Vec<OpcodeGroup>,
}

impl TableBuilder {
    fn group(&mut self, mnemonic: &'static str, roles: &[Role], kind: GroupKind) -> &mut OpcodeGroup {
        self.groups.push(OpcodeGroup {
            mnemonic,
            kind,
            roles: roles.to_vec(),
            forms: Vec::new(),
            implicit_defs: RegMasks::new(),
            clobbers: RegMasks::new(),
            has_cond: false,
            conditional: false,
            target: None,
        });
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    fn finish(self) -> OpcodeTable {
        let mut index: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (i, g) in self.groups.iter().enumerate() {
            index.entry(g.mnemonic).or_default().push(i);
        }
        OpcodeTable {
            groups: self.groups,
            index,
        }
    }
}

impl OpcodeGroup {
    fn form(&mut self, form: &[Constraint]) -> &mut Self {
        debug_assert_eq!(form.len(), self.roles.len());
        self.forms.push(form.to_vec());
        self
    }

    fn defines_flags(&mut self) -> &mut Self {
        self.implicit_defs.set(RegName::FLAGS);
        self
    }

    fn with_cond(&mut self) -> &mut Self {
        self.has_cond = true;
        self
    }

    fn conditional(&mut self) -> &mut Self {
        self.conditional = true;
        self
    }

    fn target(&mut self, idx: usize) -> &mut Self {
        self.target = Some(idx);
        self
    }

    fn clobbers(&mut self, clobbers: RegMasks) -> &mut Self {
        self.clobbers = clobbers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::{EBX, GP8_MASK};

    fn mov() -> &'static OpcodeGroup {
        opcode_table().group("mov", 2).unwrap()
    }

    #[test]
    fn test_mov_constraint_depends_on_other_position() {
        let c = mov().constraint(0, Placed::default(), OpndSize::S32);
        assert!(c.allows_mem());
        assert_eq!(c.reg_mask(RegKind::Gp), 0xFF);

        // With the source in memory the destination must be a register.
        let placed = Placed { mem: 0b10, ..Placed::default() };
        let c = mov().constraint(0, placed, OpndSize::S32);
        assert!(!c.allows_mem());
        assert!(c.has_reg());
        assert_eq!(c.size(), OpndSize::S32);
    }

    #[test]
    fn test_size_filters_forms() {
        let c = mov().constraint(0, Placed::default(), OpndSize::S8);
        assert_eq!(c.reg_mask(RegKind::Gp), GP8_MASK);
        assert!(mov().constraint(0, Placed::default(), OpndSize::S64).is_null());
    }

    #[test]
    fn test_imul_destination_is_register() {
        let imul = opcode_table().group("imul", 2).unwrap();
        assert!(!imul.constraint(0, Placed::default(), OpndSize::S32).allows_mem());
        assert!(imul.allows_memory(0b10, Placed::default()));
        assert!(!imul.allows_memory(0b01, Placed::default()));
    }

    #[test]
    fn test_allows_memory_rejects_two_memory_operands() {
        let add = opcode_table().group("add", 2).unwrap();
        assert!(add.allows_memory(0b01, Placed::default()));
        let placed = Placed { mem: 0b10, ..Placed::default() };
        assert!(!add.allows_memory(0b01, placed));
        assert!(!add.allows_memory(0b11, Placed::default()));
    }

    #[test]
    fn test_shift_count_is_cl() {
        let shl = opcode_table().group("shl", 2).unwrap();
        let c = shl.constraint(1, Placed::default(), OpndSize::S8);
        assert_eq!(c.reg_mask(RegKind::Gp), 1 << ECX);
        assert!(!c.allows_mem());
    }

    #[test]
    fn test_match_form() {
        let eax = Constraint::fixed(RegName::gp32(EAX));
        let ebx = Constraint::fixed(RegName::gp32(EBX));
        let m = Constraint::mem(OpndSize::S32);
        assert!(mov().match_form(&[eax, m]));
        assert!(mov().match_form(&[m, ebx]));
        assert!(mov().match_form(&[m, Constraint::imm()]));
        assert!(!mov().match_form(&[m, m]));
        assert!(!mov().match_form(&[Constraint::imm(), eax]));
    }

    #[test]
    fn test_find_opcode_group() {
        let table = opcode_table();
        let eax = Constraint::fixed(RegName::gp32(EAX));
        let m = Constraint::mem(OpndSize::S32);
        assert!(table.find_opcode_group("mov", &[eax, m]).is_some());
        assert!(table.find_opcode_group("mov", &[m, m]).is_none());
        assert!(table.find_opcode_group("mov", &[eax]).is_none());
        assert!(table.find_opcode_group("frobnicate", &[eax]).is_none());

        let any_gp = Constraint::new(OpndKind::GP_REG | OpndKind::MEM, OpndSize::S32, 0xFF);
        assert!(table.find_opcode_group("push", &[any_gp]).is_some());
    }

    #[test]
    fn test_roles_and_effects() {
        let table = opcode_table();
        let add = table.group("add", 2).unwrap();
        assert!(add.role(0).is_def() && add.role(0).is_use());
        assert!(add.implicit_defs.contains(RegName::FLAGS));

        let cmov = table.group("cmov", 3).unwrap();
        assert!(cmov.role(1).is_use());

        let call = table.group("call", 1).unwrap();
        assert!(call.is_call());
        assert!(call.clobbers.contains(RegName::gp32(EAX)));
        assert!(!call.clobbers.contains(RegName::gp32(EBX)));
        assert!(table.group("ret", 0).unwrap().is_terminator());
    }
}
