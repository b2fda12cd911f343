// This module holds the pieces pass1 uses to change a block: home slots, queued moves and
// operand rewrites. Every virtual operand that ever needs memory gets one home slot, owned by
// that operand, and one shared memory operand viewing it; both are created on first request
// and reused by every later block and iteration. Moves are queued against an instruction with
// a side (before or after it) and a class (save or fill). When a block is finished the queue
// is applied in one go: each gap between instruction t-1 and t receives the moves queued
// after t-1 followed by the moves queued before t, and within each group saves precede fills
// so a register is written back before it is reloaded with another value. Nothing is ever
// placed after a block terminator.

//! Home slots, the move queue and operand rewrites.

use crate::core::error::AllocResult;
use crate::ir::{BlockId, Function, InstId, Location, OpndId, SlotId};
use hashbrown::HashMap;

/// Stack homes of virtual operands, keyed by the virtual operand.
#[derive(Debug, Default)]
pub struct Homes {
    slots: HashMap<OpndId, SlotId>,
    opnds: HashMap<OpndId, OpndId>,
}

impl Homes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The memory operand of `root`'s home, creating slot and operand on first use.
    pub fn operand(&mut self, func: &mut Function, root: OpndId) -> OpndId {
        if let Some(&opnd) = self.opnds.get(&root) {
            return opnd;
        }
        let size = func.operands[root].size();
        let slot = func.add_slot(size, Some(root));
        let opnd = func.split_operand(root, Location::Mem(slot));
        log::trace!("home s{} for {}", slot, func.operands[root].name);
        self.slots.insert(root, slot);
        self.opnds.insert(root, opnd);
        opnd
    }

    /// The home operand of `root` if one was already created.
    pub fn existing(&self, root: OpndId) -> Option<OpndId> {
        self.opnds.get(&root).copied()
    }

    pub fn slot(&self, root: OpndId) -> Option<SlotId> {
        self.slots.get(&root).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    Before,
    After,
}

/// Saves write a register back to memory (or park it elsewhere); fills load one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MoveClass {
    Save,
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub instx: usize,
    pub side: Side,
    pub class: MoveClass,
    seq: usize,
    pub dst: OpndId,
    pub src: OpndId,
}

impl Move {
    /// Gap index: gap t sits between instruction t-1 and t.
    fn gap(&self) -> usize {
        match self.side {
            Side::Before => self.instx,
            Side::After => self.instx + 1,
        }
    }

    fn order_key(&self) -> (usize, u8, MoveClass, usize) {
        let side = match self.side {
            Side::After => 0,
            Side::Before => 1,
        };
        (self.gap(), side, self.class, self.seq)
    }
}

#[derive(Debug, Default)]
pub struct MoveQueue {
    moves: Vec<Move>,
    next_seq: usize,
}

impl MoveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instx: usize, side: Side, class: MoveClass, dst: OpndId, src: OpndId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.moves.push(Move {
            instx,
            side,
            class,
            seq,
            dst,
            src,
        });
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Move> {
        self.moves.iter()
    }

    /// The fill queued at `side` of instruction `instx` that loads `dst`.
    pub fn find_fill(&self, instx: usize, side: Side, dst: OpndId) -> Option<&Move> {
        self.moves
            .iter()
            .find(|m| m.instx == instx && m.side == side && m.class == MoveClass::Fill && m.dst == dst)
    }

    /// Remove and return the fill `find_fill` would report.
    pub fn take_fill(&mut self, instx: usize, side: Side, dst: OpndId) -> Option<Move> {
        let index = self
            .moves
            .iter()
            .position(|m| m.instx == instx && m.side == side && m.class == MoveClass::Fill && m.dst == dst)?;
        Some(self.moves.remove(index))
    }

    /// Materialize the queued moves into `block`, returning how many were inserted.
    pub fn apply(self, func: &mut Function, block: BlockId) -> AllocResult<usize> {
        if self.moves.is_empty() {
            return Ok(0);
        }
        let mut moves = self.moves;
        moves.sort_by_key(Move::order_key);
        let count = moves.len();

        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut insts: Vec<InstId> = Vec::with_capacity(old.len() + count);
        let mut queued = moves.into_iter().peekable();
        for (t, &inst) in old.iter().enumerate() {
            while let Some(m) = queued.next_if(|m| m.gap() <= t) {
                insts.push(make_move(func, &m)?);
            }
            insts.push(inst);
        }

        let tail: Vec<Move> = queued.collect();
        if !tail.is_empty() {
            let terminated = old
                .last()
                .is_some_and(|&last| func.insts[last].group().is_terminator());
            let at = if terminated { insts.len() - 1 } else { insts.len() };
            if terminated {
                log::warn!(
                    "{}: {} moves after the terminator placed before it",
                    func.blocks[block].name,
                    tail.len()
                );
            }
            let mut made = Vec::with_capacity(tail.len());
            for m in &tail {
                made.push(make_move(func, m)?);
            }
            insts.splice(at..at, made);
        }

        func.blocks[block].insts = insts;
        Ok(count)
    }
}

fn make_move(func: &mut Function, m: &Move) -> AllocResult<InstId> {
    let mnemonic = func.operands[m.dst].ty.move_mnemonic();
    let inst = func.make_inst(mnemonic, None, vec![m.dst, m.src], vec![])?;
    let id = func.add_inst(inst);
    log::trace!("{:?} {:?} #{}: {}", m.class, m.side, m.instx, func.inst_to_string(id));
    Ok(id)
}

/// Replace operand `pos` of `inst` with `opnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewrite {
    pub inst: InstId,
    pub pos: usize,
    pub opnd: OpndId,
}

pub fn apply_rewrites(func: &mut Function, rewrites: &[Rewrite]) {
    for r in rewrites {
        func.insts[r.inst].opnds[r.pos] = r.opnd;
    }
}
