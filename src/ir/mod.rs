// This module defines the instruction, operand and control-flow model the allocator works
// on. A Function owns flat vectors of operands, instructions, blocks and stack slots, all
// addressed by plain indices. Operands are either virtual (no location yet) or concrete: a
// register view, a stack slot or an immediate. Concrete operands created by the allocator
// remember the virtual operand they stand for in `origin`, which is what lets later passes
// find the operand's home slot and decide whether its register may be evicted. Every
// instruction is bound to an IA-32 opcode group when it is created, so operand roles and
// implicit effects are always available. Blocks hold their instruction order, successors
// and an optional dispatch (exception handler) successor.

//! Instruction / operand / control-flow model.

pub mod interp;
pub mod liveness;
pub mod verify;

use crate::core::constraint::{Constraint, OpndKind, OpndSize};
use crate::core::error::{AllocError, AllocResult};
use crate::core::register_file::{RegKind, RegName};
use crate::ia32::opcodes::{opcode_table, Cond, OpcodeGroup, Placed, Role};
use std::fmt;

pub use liveness::Liveness;

pub type OpndId = usize;
pub type InstId = usize;
pub type BlockId = usize;
pub type SlotId = usize;

/// Value types of the text IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpndType {
    I8,
    I32,
    I64,
    F32,
    F64,
    Flags,
}

impl OpndType {
    pub fn parse(s: &str) -> Option<OpndType> {
        Some(match s {
            "i8" => OpndType::I8,
            "i32" => OpndType::I32,
            "i64" => OpndType::I64,
            "f32" => OpndType::F32,
            "f64" => OpndType::F64,
            "flags" => OpndType::Flags,
            _ => return None,
        })
    }

    pub fn size(self) -> OpndSize {
        match self {
            OpndType::I8 => OpndSize::S8,
            OpndType::I32 | OpndType::F32 | OpndType::Flags => OpndSize::S32,
            OpndType::I64 | OpndType::F64 => OpndSize::S64,
        }
    }

    pub fn reg_kind(self) -> RegKind {
        match self {
            OpndType::I8 | OpndType::I32 | OpndType::I64 => RegKind::Gp,
            OpndType::F32 | OpndType::F64 => RegKind::Xmm,
            OpndType::Flags => RegKind::Status,
        }
    }

    /// Whether values of this type can live in a stack slot.
    pub fn allows_mem(self) -> bool {
        self != OpndType::Flags
    }

    /// Every placement the type itself permits.
    pub fn constraint(self) -> Constraint {
        let kind = self.reg_kind();
        let mem = if self.allows_mem() {
            OpndKind::MEM
        } else {
            OpndKind::NONE
        };
        Constraint::new(kind.opnd_kind() | mem, self.size(), kind.full_mask())
    }

    /// Mnemonic of a register/memory copy of this type.
    pub fn move_mnemonic(self) -> &'static str {
        match self {
            OpndType::F32 => "movss",
            OpndType::F64 => "movsd",
            _ => "mov",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, OpndType::F32 | OpndType::F64)
    }
}

impl fmt::Display for OpndType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpndType::I8 => "i8",
            OpndType::I32 => "i32",
            OpndType::I64 => "i64",
            OpndType::F32 => "f32",
            OpndType::F64 => "f64",
            OpndType::Flags => "flags",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    None,
    Reg(RegName),
    Mem(SlotId),
    Imm(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub name: String,
    pub ty: OpndType,
    pub loc: Location,
    /// The virtual operand this concrete operand was split from.
    pub origin: Option<OpndId>,
}

impl Operand {
    pub fn is_virtual(&self) -> bool {
        self.loc == Location::None
    }

    pub fn size(&self) -> OpndSize {
        self.ty.size()
    }

    pub fn reg(&self) -> Option<RegName> {
        match self.loc {
            Location::Reg(reg) => Some(reg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub group: usize,
    pub cond: Option<Cond>,
    pub opnds: Vec<OpndId>,
    pub targets: Vec<BlockId>,
}

impl Inst {
    pub fn group(&self) -> &'static OpcodeGroup {
        opcode_table().by_id(self.group)
    }

    pub fn mnemonic(&self) -> &'static str {
        self.group().mnemonic
    }

    pub fn role(&self, pos: usize) -> Role {
        self.group().role(pos)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub succs: Vec<BlockId>,
    pub dispatch: Option<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub size: OpndSize,
    /// Operand whose home this slot is, if any.
    pub owner: Option<OpndId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub name: String,
    pub operands: Vec<Operand>,
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    pub slots: Vec<Slot>,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn add_operand(&mut self, name: &str, ty: OpndType, loc: Location) -> OpndId {
        self.operands.push(Operand {
            name: name.to_string(),
            ty,
            loc,
            origin: None,
        });
        self.operands.len() - 1
    }

    /// A concrete operand standing for `origin` at `loc`.
    pub fn split_operand(&mut self, origin: OpndId, loc: Location) -> OpndId {
        let base = &self.operands[origin];
        let operand = Operand {
            name: format!("{}.{}", base.name, self.operands.len()),
            ty: base.ty,
            loc,
            origin: Some(origin),
        };
        self.operands.push(operand);
        self.operands.len() - 1
    }

    pub fn add_imm(&mut self, value: i64, ty: OpndType) -> OpndId {
        self.add_operand("", ty, Location::Imm(value))
    }

    pub fn add_slot(&mut self, size: OpndSize, owner: Option<OpndId>) -> SlotId {
        self.slots.push(Slot { size, owner });
        self.slots.len() - 1
    }

    pub fn add_block(&mut self, name: &str) -> BlockId {
        self.blocks.push(Block {
            name: name.to_string(),
            ..Block::default()
        });
        self.blocks.len() - 1
    }

    /// Build an instruction, binding it to its opcode group.
    pub fn make_inst(
        &self,
        mnemonic: &str,
        cond: Option<Cond>,
        opnds: Vec<OpndId>,
        targets: Vec<BlockId>,
    ) -> AllocResult<Inst> {
        let table = opcode_table();
        let group = table
            .group_id(mnemonic, opnds.len())
            .ok_or_else(|| AllocError::MissingOpcodeGroup {
                mnemonic: mnemonic.to_string(),
                arity: opnds.len(),
            })?;
        if table.by_id(group).has_cond != cond.is_some() {
            return Err(AllocError::Unencodable {
                inst: format!("{mnemonic} with condition {cond:?}"),
            });
        }
        Ok(Inst {
            group,
            cond,
            opnds,
            targets,
        })
    }

    /// Append an instruction to the end of `block`.
    pub fn push_inst(&mut self, block: BlockId, inst: Inst) -> InstId {
        let id = self.add_inst(inst);
        self.blocks[block].insts.push(id);
        id
    }

    /// Register an instruction without placing it in a block.
    pub fn add_inst(&mut self, inst: Inst) -> InstId {
        self.insts.push(inst);
        self.insts.len() - 1
    }

    /// The allocator-facing identity of an operand: its origin if split.
    pub fn root(&self, opnd: OpndId) -> OpndId {
        self.operands[opnd].origin.unwrap_or(opnd)
    }

    /// Exact placement constraint of a concrete operand; null when virtual.
    pub fn placement(&self, opnd: OpndId) -> Constraint {
        let operand = &self.operands[opnd];
        match operand.loc {
            Location::None => Constraint::NULL,
            Location::Reg(reg) => Constraint::fixed(reg),
            Location::Mem(_) => Constraint::mem(operand.size()),
            Location::Imm(_) => Constraint::imm(),
        }
    }

    /// Which positions of `inst` hold registers, memory or immediates.
    pub fn placed(&self, inst: InstId) -> Placed {
        let mut placed = Placed::default();
        for (pos, &opnd) in self.insts[inst].opnds.iter().enumerate() {
            let bit = 1u8 << pos;
            match self.operands[opnd].loc {
                Location::None => {}
                Location::Reg(_) => placed.reg |= bit,
                Location::Mem(_) => placed.mem |= bit,
                Location::Imm(_) => placed.imm |= bit,
            }
        }
        placed
    }

    /// Last instruction of `block` if it ends control flow there.
    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.blocks[block].insts.last()?;
        self.insts[last].group().is_terminator().then_some(last)
    }

    /// Recompute block successors from terminators and fall-through.
    pub fn compute_successors(&mut self) {
        for b in 0..self.blocks.len() {
            let next = (b + 1 < self.blocks.len()).then_some(b + 1);
            let mut succs = Vec::new();
            match self.terminator(b) {
                Some(term) => {
                    let inst = &self.insts[term];
                    succs.extend(inst.targets.iter().copied());
                    if inst.group().kind == crate::ia32::opcodes::GroupKind::CondJump {
                        succs.extend(next);
                    }
                }
                None => succs.extend(next),
            }
            succs.dedup();
            self.blocks[b].succs = succs;
        }
    }

    pub fn operand_to_string(&self, opnd: OpndId) -> String {
        let operand = &self.operands[opnd];
        match operand.loc {
            Location::None => format!("%{}:{}", operand.name, operand.ty),
            Location::Reg(reg) => reg.to_string(),
            Location::Mem(slot) => format!("[s{}:{}]", slot, operand.ty),
            Location::Imm(value) => format!("${value}"),
        }
    }

    pub fn inst_to_string(&self, inst: InstId) -> String {
        let inst = &self.insts[inst];
        let mut out = inst.mnemonic().to_string();
        if let Some(cond) = inst.cond {
            out.push('.');
            out.push_str(&cond.to_string());
        }
        let mut args: Vec<String> = inst
            .opnds
            .iter()
            .map(|&o| self.operand_to_string(o))
            .collect();
        args.extend(inst.targets.iter().map(|&b| format!("^{}", self.blocks[b].name)));
        if !args.is_empty() {
            out.push(' ');
            out.push_str(&args.join(", "));
        }
        out
    }

    /// Number of operands that still have no location.
    pub fn virtual_count(&self) -> usize {
        self.insts
            .iter()
            .flat_map(|i| i.opnds.iter())
            .filter(|&&o| self.operands[o].is_virtual())
            .count()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func {} {{", self.name)?;
        for block in &self.blocks {
            write!(f, "{}:", block.name)?;
            if let Some(handler) = block.dispatch {
                write!(f, " dispatch ^{}", self.blocks[handler].name)?;
            }
            writeln!(f)?;
            for &inst in &block.insts {
                writeln!(f, "    {}", self.inst_to_string(inst))?;
            }
        }
        writeln!(f, "}}")
    }
}
