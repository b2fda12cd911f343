// This module implements the first SpillGen pass over one basic block: a backward scan that
// turns the block into the records the allocator core works on. Every instruction gets an
// Instx holding its operand roles, its current placement masks, the registers a call
// clobbers there and the registers it presses on. Every virtual operand touched in the
// block gets an Opline: its accumulated constraint, register class, weight and the ordered
// list of touches with their local constraints. Concrete register operands and implicit
// definitions become occupancy intervals over half-points: point 2t is the input side of
// instruction t and point 2t+1 its output side, so a register written by t and read by
// t+1 is busy over [2t+1, 2t+2]. A touch whose local constraint is null when the operand is
// first seen is a failure: it is logged, counted and the operand is left alone this pass.

//! Block preprocessing: Instx / Opline records and register occupancy.

use crate::core::constraint::{Constraint, OpndSize};
use crate::core::register_file::{RegKind, RegMasks, RegName, Registers, NUM_REG_KINDS, REGS_PER_KIND};
use crate::ia32::opcodes::{Placed, Role, MAX_OPNDS};
use crate::ir::{BlockId, Function, InstId, Liveness, Location, OpndId, OpndType};
use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::{HashMap, HashSet};

/// Positions set in an operand position mask.
pub fn positions(mask: u8) -> impl Iterator<Item = usize> {
    (0..MAX_OPNDS).filter(move |p| mask & (1 << p) != 0)
}

/// One appearance of a virtual operand at an instruction.
#[derive(Debug, Clone, Copy)]
pub struct Touch {
    pub instx: usize,
    /// Operand positions holding the operand.
    pub positions: u8,
    pub role: Role,
    /// Constraint at this instruction when the block was scanned.
    pub local: Constraint,
}

impl Touch {
    /// First half-point the value must be in place.
    pub fn start(&self) -> usize {
        if self.role.is_use() {
            2 * self.instx
        } else {
            2 * self.instx + 1
        }
    }

    /// Last half-point the value occupies at this instruction.
    pub fn end(&self) -> usize {
        if self.role.is_def() {
            2 * self.instx + 1
        } else {
            2 * self.instx
        }
    }
}

/// Per-instruction record.
#[derive(Debug, Clone)]
pub struct Instx {
    pub inst: InstId,
    /// Operand at each position, updated as pass1 rewrites them.
    pub opnds: Vec<OpndId>,
    pub roles: [Role; MAX_OPNDS],
    /// Registers occupied on the input side.
    pub busy_in: RegMasks,
    /// Registers occupied on the output side.
    pub busy_out: RegMasks,
    /// Registers some operand here can only live in.
    pub regpress: RegMasks,
    /// Registers a call destroys.
    pub clobbers: RegMasks,
    pub placed: Placed,
}

impl Instx {
    fn new(func: &Function, inst: InstId) -> Self {
        let mut roles = [Role::NONE; MAX_OPNDS];
        let i = &func.insts[inst];
        for (pos, role) in roles.iter_mut().enumerate().take(i.opnds.len()) {
            *role = i.role(pos);
        }
        Self {
            inst,
            opnds: i.opnds.clone(),
            roles,
            busy_in: RegMasks::new(),
            busy_out: RegMasks::new(),
            regpress: RegMasks::new(),
            clobbers: i.group().clobbers,
            placed: func.placed(inst),
        }
    }

    pub fn is_call(&self) -> bool {
        !self.clobbers.is_empty()
    }
}

/// A store the allocator owes: the value defined at `instx` still sits in
/// register operand `opnd` and has not reached its home slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSave {
    pub instx: usize,
    pub opnd: OpndId,
}

/// Allocation record of one virtual operand within the block.
#[derive(Debug)]
pub struct Opline<'a> {
    pub opnd: OpndId,
    pub ty: OpndType,
    pub initial: Constraint,
    pub class: Option<RegKind>,
    pub touches: BumpVec<'a, Touch>,
    pub live_in: bool,
    pub live_out: bool,
    pub catch_sensitive: bool,
    pub weight: u32,
    /// Instruction and position of the first appearance.
    pub first: usize,
    pub pending: Option<PendingSave>,
    /// The home slot holds the current value.
    pub home_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Opnd(OpndId),
    /// Implicit definitions nobody can move.
    Fixed,
}

/// A register held over the half-points `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
    pub owner: Owner,
}

impl Interval {
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start <= end && start <= self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Everything pass1 needs to allocate one block.
pub struct BlockState<'a> {
    pub block: BlockId,
    pub instx: Vec<Instx>,
    pub oplines: BumpVec<'a, Opline<'a>>,
    intervals: Vec<Vec<Interval>>,
    /// Problem operands found so far this pass.
    pub failures: usize,
}

fn reg_slot(reg: RegName) -> usize {
    reg.kind.index() * REGS_PER_KIND as usize + reg.index as usize
}

impl<'a> BlockState<'a> {
    fn new(block: BlockId, instx: Vec<Instx>, arena: &'a Bump) -> Self {
        Self {
            block,
            instx,
            oplines: BumpVec::new_in(arena),
            intervals: vec![Vec::new(); NUM_REG_KINDS * REGS_PER_KIND as usize],
            failures: 0,
        }
    }

    /// Number of half-points in the block.
    pub fn points(&self) -> usize {
        2 * self.instx.len()
    }

    fn busy(&self, point: usize) -> &RegMasks {
        let x = &self.instx[point / 2];
        if point % 2 == 0 {
            &x.busy_in
        } else {
            &x.busy_out
        }
    }

    fn busy_mut(&mut self, point: usize) -> &mut RegMasks {
        let x = &mut self.instx[point / 2];
        if point % 2 == 0 {
            &mut x.busy_in
        } else {
            &mut x.busy_out
        }
    }

    pub fn is_busy(&self, reg: RegName, point: usize) -> bool {
        self.busy(point).contains(reg)
    }

    pub fn is_free(&self, reg: RegName, start: usize, end: usize) -> bool {
        (start..=end).all(|p| !self.is_busy(reg, p))
    }

    pub fn intervals(&self, reg: RegName) -> &[Interval] {
        &self.intervals[reg_slot(reg)]
    }

    /// Intervals of `reg` overlapping `start..=end`.
    pub fn conflicts(&self, reg: RegName, start: usize, end: usize) -> Vec<Interval> {
        self.intervals(reg)
            .iter()
            .filter(|i| i.overlaps(start, end))
            .copied()
            .collect()
    }

    pub fn occupy(&mut self, reg: RegName, start: usize, end: usize, owner: Owner) {
        let end = end.min(self.points().saturating_sub(1));
        self.intervals[reg_slot(reg)].push(Interval { start, end, owner });
        for p in start..=end {
            self.busy_mut(p).set(reg);
        }
    }

    /// Free `reg` over `from..=to` for the intervals `owner` holds there.
    pub fn carve(&mut self, reg: RegName, owner: Owner, from: usize, to: usize) {
        let list = &mut self.intervals[reg_slot(reg)];
        let mut kept = Vec::with_capacity(list.len() + 1);
        for i in list.drain(..) {
            if i.owner != owner || !i.overlaps(from, to) {
                kept.push(i);
                continue;
            }
            if i.start < from {
                kept.push(Interval { end: from - 1, ..i });
            }
            if i.end > to {
                kept.push(Interval { start: to + 1, ..i });
            }
        }
        *list = kept;

        for p in from..=to.min(self.points().saturating_sub(1)) {
            let held = self.intervals[reg_slot(reg)]
                .iter()
                .any(|i| i.start <= p && p <= i.end);
            let busy = self.busy_mut(p);
            if held {
                busy.set(reg);
            } else {
                busy.clear(reg);
            }
        }
    }
}

/// Operand appearances of one instruction, merged per operand.
fn merged_operands(func: &Function, inst: InstId) -> Vec<(OpndId, u8, Role)> {
    let i = &func.insts[inst];
    let mut merged: Vec<(OpndId, u8, Role)> = Vec::with_capacity(i.opnds.len());
    for (pos, &opnd) in i.opnds.iter().enumerate() {
        let role = i.role(pos);
        match merged.iter_mut().find(|(o, _, _)| *o == opnd) {
            Some(entry) => {
                entry.1 |= 1 << pos;
                entry.2 = entry.2 | role;
            }
            None => merged.push((opnd, 1 << pos, role)),
        }
    }
    merged
}

/// Inputs of the scan besides the function itself.
pub struct Pass0Context<'c> {
    pub liveness: &'c Liveness,
    pub registers: &'c Registers,
    /// Operands treated as live out because an earlier pass failed on them.
    pub sticky: &'c HashSet<OpndId>,
}

/// Scan `block` backwards and build its allocation records.
pub fn run<'a>(func: &Function, block: BlockId, ctx: &Pass0Context<'_>, arena: &'a Bump) -> BlockState<'a> {
    let insts = &func.blocks[block].insts;
    let n = insts.len();
    let instx: Vec<Instx> = insts.iter().map(|&id| Instx::new(func, id)).collect();
    let mut state = BlockState::new(block, instx, arena);
    if n == 0 {
        return state;
    }
    let last_point = 2 * n - 1;

    let mut live: HashSet<OpndId> = ctx.liveness.live_out(block).clone();
    live.extend(ctx.sticky.iter().copied());

    // Open register intervals of concrete operands: operand -> end point.
    let mut open: HashMap<OpndId, usize> = HashMap::new();
    for &o in &live {
        if func.operands[o].reg().is_some() {
            open.insert(o, last_point);
        }
    }

    let mut lines: HashMap<OpndId, usize> = HashMap::new();
    let mut rejected: HashSet<OpndId> = HashSet::new();
    let mut pending_intervals: Vec<(RegName, Interval)> = Vec::new();

    for t in (0..n).rev() {
        let inst = &func.insts[insts[t]];
        let group = inst.group();

        for (kind, index) in group.implicit_defs.iter() {
            pending_intervals.push((
                RegName::new(kind, OpndSize::Any, index),
                Interval {
                    start: 2 * t + 1,
                    end: 2 * t + 1,
                    owner: Owner::Fixed,
                },
            ));
        }

        let merged = merged_operands(func, insts[t]);
        for &(opnd, mask, role) in &merged {
            let operand = &func.operands[opnd];
            match operand.loc {
                Location::Reg(reg) => {
                    state.instx[t].regpress.set(reg);
                    let end_open = open.remove(&opnd);
                    if role.is_use() {
                        let end = end_open.unwrap_or(if role.is_def() { 2 * t + 1 } else { 2 * t });
                        open.insert(opnd, end);
                    } else {
                        let end = end_open.unwrap_or(2 * t + 1);
                        pending_intervals.push((
                            reg,
                            Interval {
                                start: 2 * t + 1,
                                end,
                                owner: Owner::Opnd(opnd),
                            },
                        ));
                    }
                }
                Location::None if !rejected.contains(&opnd) => {
                    let size = operand.size();
                    let mut local = operand.ty.constraint();
                    for pos in positions(mask) {
                        local = local.intersect(&group.constraint(pos, state.instx[t].placed, size));
                    }
                    let role = if live.contains(&opnd) { role } else { role | Role::END };
                    let touch = Touch {
                        instx: t,
                        positions: mask,
                        role,
                        local,
                    };
                    let first = t * MAX_OPNDS + positions(mask).next().unwrap_or(0);

                    match lines.get(&opnd).copied() {
                        None => {
                            if local.is_null() {
                                log::warn!(
                                    "{}: no legal placement for {} in '{}'",
                                    func.blocks[block].name,
                                    func.operand_to_string(opnd),
                                    func.inst_to_string(insts[t])
                                );
                                state.failures += 1;
                                rejected.insert(opnd);
                                continue;
                            }
                            let mut touches = BumpVec::new_in(arena);
                            touches.push(touch);
                            lines.insert(opnd, state.oplines.len());
                            state.oplines.push(Opline {
                                opnd,
                                ty: operand.ty,
                                initial: local,
                                class: None,
                                touches,
                                live_in: false,
                                live_out: false,
                                catch_sensitive: false,
                                weight: 0,
                                first,
                                pending: None,
                                home_valid: false,
                            });
                            if local.reg_count() == 1 && !local.allows_mem() {
                                state.instx[t].regpress.union(&exclusive_reg(&local));
                            }
                        }
                        Some(idx) => {
                            let line = &mut state.oplines[idx];
                            let combined = line.initial.intersect(&local);
                            if !combined.is_null() {
                                line.initial = combined;
                            }
                            line.touches.push(touch);
                            line.first = first;
                            if local.reg_count() == 1 && !local.allows_mem() {
                                state.instx[t].regpress.union(&exclusive_reg(&local));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        for &(opnd, _, role) in &merged {
            if role.is_pure_def() {
                live.remove(&opnd);
            }
        }
        for &(opnd, _, role) in &merged {
            if role.is_use() && Liveness::tracked(func, opnd) {
                live.insert(opnd);
            }
        }
    }

    // Values still open at the top of the block are live into it.
    for (opnd, end) in open {
        if let Some(reg) = func.operands[opnd].reg() {
            pending_intervals.push((
                reg,
                Interval {
                    start: 0,
                    end,
                    owner: Owner::Opnd(opnd),
                },
            ));
        }
    }
    for (reg, i) in pending_intervals {
        state.occupy(reg, i.start, i.end, i.owner);
    }

    let handler_live = func.blocks[block]
        .dispatch
        .map(|h| ctx.liveness.live_in(h));
    for line in state.oplines.iter_mut() {
        line.touches.reverse();
        line.live_in = live.contains(&line.opnd);
        line.live_out = ctx.liveness.is_live_out(block, line.opnd) || ctx.sticky.contains(&line.opnd);
        line.catch_sensitive = handler_live.is_some_and(|h| h.contains(&line.opnd));
        line.class = ctx.registers.class_of(&line.initial);
        line.weight = line
            .class
            .map_or(0, |k| (ctx.registers.mask(k) & line.initial.reg_mask(k)).count_ones());
        line.home_valid = line.live_in || line.touches.first().is_some_and(|t| t.role.is_use());
    }

    log::trace!(
        "pass0 {}: {} instructions, {} oplines, {} failures",
        func.blocks[block].name,
        n,
        state.oplines.len(),
        state.failures
    );
    state
}

fn exclusive_reg(c: &Constraint) -> RegMasks {
    let mut masks = RegMasks::new();
    for kind in RegKind::ALL {
        let mask = c.reg_mask(kind);
        if mask != 0 {
            masks.set_mask(kind, mask);
        }
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::{EAX, EBX, ECX};
    use crate::test_ir::parse_function;

    fn scan<'a>(func: &Function, regs: &str, arena: &'a Bump) -> BlockState<'a> {
        let liveness = Liveness::compute(func);
        let registers = Registers::parse(regs).unwrap();
        let sticky = HashSet::new();
        let ctx = Pass0Context {
            liveness: &liveness,
            registers: &registers,
            sticky: &sticky,
        };
        run(func, 0, &ctx, arena)
    }

    #[test]
    fn test_touches_and_roles() {
        let func = parse_function(
            r#"
            func f {
            entry:
                mov %a:i32, $1
                add %a, $2
                push %a
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let state = scan(&func, "ALL", &arena);
        assert_eq!(state.failures, 0);
        assert_eq!(state.oplines.len(), 1);

        let line = &state.oplines[0];
        let roles: Vec<Role> = line.touches.iter().map(|t| t.role).collect();
        assert!(roles[0].is_pure_def());
        assert!(roles[1].is_def() && roles[1].is_use() && !roles[1].is_end());
        assert!(roles[2].is_use() && roles[2].is_end());
        assert_eq!(line.class, Some(RegKind::Gp));
        assert_eq!(line.weight, 6);
        assert!(!line.live_in && !line.live_out && !line.home_valid);
        assert_eq!(line.touches[0].start(), 1);
        assert_eq!(line.touches[2].end(), 4);
    }

    #[test]
    fn test_concrete_registers_become_intervals() {
        let func = parse_function(
            r#"
            func f {
            entry:
                mov ebx, $1
                mov %a:i32, $2
                add %a, ebx
                cmp %f:flags, %a, $0
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let state = scan(&func, "ALL", &arena);

        let ebx = RegName::gp32(EBX);
        assert_eq!(
            state.intervals(ebx),
            &[Interval {
                start: 1,
                end: 4,
                owner: Owner::Opnd(func.insts[0].opnds[0])
            }]
        );
        assert!(state.is_busy(ebx, 2));
        assert!(!state.is_busy(ebx, 5));
        // add defines the flags on its output side.
        assert!(state.is_busy(RegName::FLAGS, 5));
        assert!(!state.is_busy(RegName::FLAGS, 6));
        assert!(state.instx[2].regpress.contains(ebx));
    }

    #[test]
    fn test_null_constraint_is_a_failure() {
        let func = parse_function(
            r#"
            func d {
            entry:
                mov %w:i64, [s0:i64]
                add %w, $1
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let state = scan(&func, "ALL", &arena);
        assert_eq!(state.failures, 1);
        assert!(state.oplines.is_empty());
    }

    #[test]
    fn test_weight_and_call_clobbers() {
        let func = parse_function(
            r#"
            func w {
            entry:
                mov %n:i8, $1
                shl %v:i32, %n
                call $16
                ret
            }
            "#,
        )
        .unwrap();
        let arena = Bump::new();
        let state = scan(&func, "eax,ecx,ebx", &arena);
        let n = state.oplines.iter().find(|l| func.operands[l.opnd].name == "n").unwrap();
        // The shift count can only be cl.
        assert_eq!(n.weight, 1);
        assert_eq!(n.initial.reg_mask(RegKind::Gp), 1 << ECX);
        assert!(state.instx[1].regpress.contains(RegName::gp32(ECX)));

        let v = state.oplines.iter().find(|l| func.operands[l.opnd].name == "v").unwrap();
        assert!(v.live_in && v.home_valid);
        assert_eq!(v.weight, 3);

        assert!(state.instx[2].is_call());
        assert!(state.instx[2].clobbers.contains(RegName::gp32(EAX)));
    }

    #[test]
    fn test_carve_splits_interval() {
        let func = parse_function(
            "func c {\nentry:\n  mov eax, $1\n  push $0\n  push $0\n  push eax\n  ret\n}\n",
        )
        .unwrap();
        let arena = Bump::new();
        let mut state = scan(&func, "ALL", &arena);
        let eax = RegName::gp32(EAX);
        let owner = state.intervals(eax)[0].owner;
        assert_eq!(state.intervals(eax)[0].start, 1);
        assert_eq!(state.intervals(eax)[0].end, 6);

        state.carve(eax, owner, 2, 3);
        assert_eq!(state.intervals(eax).len(), 2);
        assert!(state.is_free(eax, 2, 3));
        assert!(state.is_busy(eax, 1));
        assert!(state.is_busy(eax, 4));
    }
}
