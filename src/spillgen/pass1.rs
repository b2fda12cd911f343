// This module implements the SpillGen allocator core for one block. Oplines are taken most
// constrained first (fewest legal registers, then first appearance) and each walks its touches
// in order. At every touch the strategies are tried in a fixed sequence: tryRegister looks for
// the longest run of touches one register can cover, tryMemory places the touch in the
// operand's home slot, tryEvict frees a register from an allocator-created value that merely
// passes through the instruction, tryRepair moves aside a value the instruction reads in that
// register, and simplify forces call targets into memory. A touch nothing can place is a
// failure: it stays virtual, its operand joins the sticky set and the driver runs another
// round. Saves are lazy. A definition held in a register records a pending save that becomes
// a store right after the defining instruction only once a later reload, a memory or failed
// read, or a live-out exit needs the home copy. Catch-sensitive operands store after every
// definition and never cross a call in a register.

//! Per-block allocation strategies.

use super::moves::{Homes, MoveClass, MoveQueue, Rewrite, Side};
use super::pass0::{positions, BlockState, Owner, PendingSave, Touch};
use crate::core::constraint::{Constraint, OpndSize};
use crate::core::register_file::{RegKind, RegName, Registers, REGS_PER_KIND};
use crate::ia32::opcodes::{GroupKind, Role};
use crate::ir::{Function, Location, OpndId, OpndType};
use hashbrown::HashSet;
use std::cmp::Reverse;

/// What one pass over a block decided.
#[derive(Debug, Default)]
pub struct Pass1Result {
    pub moves: MoveQueue,
    pub rewrites: Vec<Rewrite>,
    pub evictions: usize,
    pub repairs: usize,
}

/// Ranking of a candidate register span; larger is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SpanKey {
    touches: usize,
    coalesced: bool,
    free_run: usize,
    pressure: Reverse<usize>,
}

struct Pass1<'x, 'a> {
    func: &'x mut Function,
    state: &'x mut BlockState<'a>,
    registers: &'x Registers,
    homes: &'x mut Homes,
    sticky: &'x mut HashSet<OpndId>,
    result: Pass1Result,
}

/// Allocate every opline of `state`; failures are added to `state.failures`.
pub fn run(
    func: &mut Function,
    state: &mut BlockState<'_>,
    registers: &Registers,
    homes: &mut Homes,
    sticky: &mut HashSet<OpndId>,
) -> Pass1Result {
    let mut order: Vec<usize> = (0..state.oplines.len()).collect();
    order.sort_by_key(|&l| (state.oplines[l].weight, state.oplines[l].first));

    let mut pass = Pass1 {
        func,
        state,
        registers,
        homes,
        sticky,
        result: Pass1Result::default(),
    };
    for l in order {
        pass.allocate(l);
    }
    pass.result
}

fn reg_at(kind: RegKind, index: u8, size: OpndSize) -> Option<RegName> {
    RegName::new(kind, OpndSize::S32, index).alias(size)
}

fn indices(mask: u32) -> impl Iterator<Item = u8> {
    (0..REGS_PER_KIND).filter(move |i| mask & (1 << i) != 0)
}

impl<'x, 'a> Pass1<'x, 'a> {
    fn allocate(&mut self, l: usize) {
        let touches: Vec<Touch> = self.state.oplines[l].touches.to_vec();
        log::trace!(
            "opline {} weight {}: {} touches",
            self.func.operands[self.state.oplines[l].opnd].name,
            self.state.oplines[l].weight,
            touches.len()
        );

        let mut i = 0;
        while i < touches.len() {
            if let Some(j) = self.try_register(l, &touches, i) {
                i = j + 1;
                continue;
            }
            if self.try_memory(l, &touches[i]) {
                i += 1;
                continue;
            }
            if self.try_evict(l, &touches[i]) || self.try_repair(l, &touches[i]) {
                if let Some(j) = self.try_register(l, &touches, i) {
                    i = j + 1;
                    continue;
                }
            }
            self.simplify(l, &touches[i]);
            i += 1;
        }

        let line = &self.state.oplines[l];
        if line.live_out && !line.home_valid {
            self.flush(l);
        }
    }

    fn home(&mut self, root: OpndId) -> OpndId {
        self.homes.operand(self.func, root)
    }

    /// Constraint of `touch` given what is placed at its instruction right now.
    fn legal(&self, touch: &Touch, ty: OpndType) -> Constraint {
        let x = &self.state.instx[touch.instx];
        let group = self.func.insts[x.inst].group();
        positions(touch.positions).fold(ty.constraint(), |c, pos| {
            c.intersect(&group.constraint(pos, x.placed, ty.size()))
        })
    }

    fn memory_ok(&self, touch: &Touch, ty: OpndType) -> bool {
        let x = &self.state.instx[touch.instx];
        let group = self.func.insts[x.inst].group();
        ty.allows_mem()
            && self.legal(touch, ty).allows_mem()
            && group.allows_memory(touch.positions, x.placed)
    }

    /// Registers of the opline's class legal at `touch`.
    fn candidates(&self, l: usize, touch: &Touch) -> Option<(RegKind, u32)> {
        let line = &self.state.oplines[l];
        let class = line.class?;
        let mask = self.registers.mask(class)
            & line.initial.reg_mask(class)
            & self.legal(touch, line.ty).reg_mask(class);
        Some((class, mask))
    }

    fn evictable(&self, opnd: OpndId) -> bool {
        let operand = &self.func.operands[opnd];
        operand.origin.is_some() && operand.ty.allows_mem()
    }

    fn crosses_call(&self, reg: RegName, start: usize, end: usize, catch: bool) -> bool {
        (start / 2..=end / 2).any(|c| {
            let x = &self.state.instx[c];
            2 * c >= start
                && 2 * c + 1 <= end
                && x.is_call()
                && (catch || x.clobbers.contains(reg))
        })
    }

    /// Last touch a span in `reg` starting at touch `i` can reach.
    fn extend(&self, reg: RegName, ty: OpndType, touches: &[Touch], i: usize, catch: bool) -> Option<usize> {
        let start = touches[i].start();
        let mut next = start;
        let mut last = None;
        for (j, touch) in touches.iter().enumerate().skip(i) {
            if j > i && !self.legal(touch, ty).allows_reg(reg) {
                break;
            }
            let end = touch.end();
            if !self.state.is_free(reg, next, end) || self.crosses_call(reg, start, end, catch) {
                break;
            }
            next = end + 1;
            last = Some(j);
            if touch.role.is_end() {
                break;
            }
        }
        last
    }

    /// Register index the other side of a plain move already holds.
    fn partner(&self, touch: &Touch) -> Option<u8> {
        let x = &self.state.instx[touch.instx];
        if self.func.insts[x.inst].group().kind != GroupKind::Move {
            return None;
        }
        let other = (0..x.opnds.len()).find(|p| touch.positions & (1 << p) == 0)?;
        self.func.operands[x.opnds[other]].reg().map(|r| r.index)
    }

    fn span_key(&self, reg: RegName, touches: &[Touch], i: usize, j: usize) -> SpanKey {
        let start = touches[i].start();
        let end = touches[j].end();
        let before = (0..start).rev().take_while(|&p| !self.state.is_busy(reg, p)).count();
        let after = (end + 1..self.state.points())
            .take_while(|&p| !self.state.is_busy(reg, p))
            .count();
        let pressure = (touches[i].instx..=touches[j].instx)
            .filter(|&t| self.state.instx[t].regpress.contains(reg))
            .count();
        SpanKey {
            touches: j - i + 1,
            coalesced: touches[i..=j].iter().any(|t| self.partner(t) == Some(reg.index)),
            free_run: before + after,
            pressure: Reverse(pressure),
        }
    }

    fn try_register(&mut self, l: usize, touches: &[Touch], i: usize) -> Option<usize> {
        let (class, mask) = self.candidates(l, &touches[i])?;
        let line = &self.state.oplines[l];
        let (ty, catch, home_valid) = (line.ty, line.catch_sensitive, line.home_valid);

        // Values without a memory form must hold one register for their whole lifetime.
        let lifetime_end = if ty.allows_mem() {
            None
        } else {
            let starts_value = if i == 0 {
                !line.live_in
            } else {
                touches[i - 1].role.is_end()
            };
            if !starts_value {
                return None;
            }
            Some(i + touches[i..].iter().position(|t| t.role.is_end())?)
        };

        let first = &touches[i];
        let reload_only = first.role.is_use() && !first.role.is_def() && home_valid && self.memory_ok(first, ty);

        let mut best: Option<(SpanKey, RegName, usize)> = None;
        for index in indices(mask) {
            let Some(reg) = reg_at(class, index, ty.size()) else { continue };
            let Some(j) = self.extend(reg, ty, touches, i, catch) else { continue };
            if lifetime_end.is_some_and(|end| j != end) {
                continue;
            }
            if j == i && reload_only {
                continue;
            }
            let key = self.span_key(reg, touches, i, j);
            if best.as_ref().map_or(true, |(k, _, _)| key > *k) {
                best = Some((key, reg, j));
            }
        }

        let (_, reg, j) = best?;
        self.assign(l, touches, i, j, reg);
        Some(j)
    }

    fn rewrite(&mut self, touch: &Touch, opnd: OpndId, mem: bool) {
        let x = &mut self.state.instx[touch.instx];
        for pos in positions(touch.positions) {
            x.opnds[pos] = opnd;
            self.result.rewrites.push(Rewrite {
                inst: x.inst,
                pos,
                opnd,
            });
        }
        x.placed = if mem {
            x.placed.with_mem(touch.positions)
        } else {
            x.placed.with_reg(touch.positions)
        };
    }

    fn assign(&mut self, l: usize, touches: &[Touch], i: usize, j: usize, reg: RegName) {
        let line = &self.state.oplines[l];
        let (root, ty, catch) = (line.opnd, line.ty, line.catch_sensitive);
        let opnd = self.func.split_operand(root, Location::Reg(reg));
        let span = &touches[i..=j];
        self.state.occupy(reg, touches[i].start(), touches[j].end(), Owner::Opnd(opnd));
        log::debug!(
            "{}: {} in {} for #{}..#{}",
            self.func.blocks[self.state.block].name,
            self.func.operands[root].name,
            reg,
            touches[i].instx,
            touches[j].instx
        );

        if touches[i].role.is_use() && ty.allows_mem() {
            self.flush(l);
            let home = self.home(root);
            self.result
                .moves
                .push(touches[i].instx, Side::Before, MoveClass::Fill, opnd, home);
        }
        for touch in span {
            self.rewrite(touch, opnd, false);
        }

        if !ty.allows_mem() {
            return;
        }
        if catch {
            let mut stored = false;
            for touch in span.iter().filter(|t| t.role.is_def()) {
                let home = self.home(root);
                self.result
                    .moves
                    .push(touch.instx, Side::After, MoveClass::Save, home, opnd);
                stored = true;
            }
            if stored {
                let line = &mut self.state.oplines[l];
                line.home_valid = true;
                line.pending = None;
            }
        } else if let Some(def) = span.iter().rev().find(|t| t.role.is_def()) {
            let line = &mut self.state.oplines[l];
            line.pending = Some(PendingSave {
                instx: def.instx,
                opnd,
            });
            line.home_valid = false;
        }
    }

    /// Store a pending register value to its home.
    fn flush(&mut self, l: usize) {
        let line = &mut self.state.oplines[l];
        let Some(pending) = line.pending.take() else { return };
        line.home_valid = true;
        let root = line.opnd;
        let home = self.home(root);
        self.result
            .moves
            .push(pending.instx, Side::After, MoveClass::Save, home, pending.opnd);
    }

    fn try_memory(&mut self, l: usize, touch: &Touch) -> bool {
        let (root, ty) = (self.state.oplines[l].opnd, self.state.oplines[l].ty);
        if !self.memory_ok(touch, ty) {
            return false;
        }
        if touch.role.is_use() {
            self.flush(l);
        }
        let home = self.home(root);
        self.rewrite(touch, home, true);
        if touch.role.is_def() {
            let line = &mut self.state.oplines[l];
            line.home_valid = true;
            line.pending = None;
        }
        log::trace!("{} in memory at #{}", self.func.operands[root].name, touch.instx);
        true
    }

    /// Free a register held by a value that only passes through the instruction.
    fn try_evict(&mut self, l: usize, touch: &Touch) -> bool {
        let Some((class, mask)) = self.candidates(l, touch) else { return false };
        let size = self.state.oplines[l].ty.size();
        let t = touch.instx;
        let (first, last) = (2 * t, 2 * t + 1);

        let mut best: Option<(usize, RegName, OpndId, Option<OpndId>)> = None;
        for index in indices(mask) {
            let Some(reg) = reg_at(class, index, size) else { continue };
            let conflicts = self.state.conflicts(reg, first, last);
            let [victim] = conflicts.as_slice() else { continue };
            let Owner::Opnd(opnd) = victim.owner else { continue };
            // A piece starting at `t` was reloaded right after `t - 1` by an earlier eviction
            // or repair; that reload can move past `t` instead.
            let restore = if victim.start == first && t > 0 {
                self.result.moves.find_fill(t - 1, Side::After, opnd).map(|m| m.src)
            } else {
                None
            };
            if !self.evictable(opnd)
                || (victim.start >= first && restore.is_none())
                || victim.end <= last
                || self.state.instx[t].opnds.contains(&opnd)
            {
                continue;
            }
            if best.as_ref().map_or(true, |(len, ..)| victim.len() > *len) {
                best = Some((victim.len(), reg, opnd, restore));
            }
        }

        let Some((_, reg, victim, restore)) = best else { return false };
        let root = self.func.root(victim);
        let home = self.home(root);
        if restore == Some(home) {
            self.result.moves.take_fill(t - 1, Side::After, victim);
        } else {
            self.result.moves.push(t, Side::Before, MoveClass::Save, home, victim);
        }
        self.result.moves.push(t, Side::After, MoveClass::Fill, victim, home);
        self.state.carve(reg, Owner::Opnd(victim), first, last);
        self.result.evictions += 1;
        log::debug!(
            "evicted {} from {} around '{}'",
            self.func.operands[root].name,
            reg,
            self.func.inst_to_string(self.state.instx[t].inst)
        );
        true
    }

    /// Move aside a value the instruction reads from a register the touch needs.
    fn try_repair(&mut self, l: usize, touch: &Touch) -> bool {
        let Some((class, mask)) = self.candidates(l, touch) else { return false };
        let size = self.state.oplines[l].ty.size();
        let t = touch.instx;

        for index in indices(mask) {
            let Some(reg) = reg_at(class, index, size) else { continue };
            let conflicts = self.state.conflicts(reg, touch.start(), touch.end());
            let [victim] = conflicts.as_slice() else { continue };
            let Owner::Opnd(opnd) = victim.owner else { continue };
            if !self.evictable(opnd) {
                continue;
            }
            let x = &self.state.instx[t];
            let at: u8 = (0..x.opnds.len())
                .filter(|&p| x.opnds[p] == opnd)
                .fold(0, |m, p| m | 1 << p);
            if at == 0 || positions(at).any(|p| x.roles[p].is_def()) {
                continue;
            }
            let lives_on = victim.end > 2 * t + 1;
            let arrived = victim.start == 2 * t;
            if self.relocate(opnd, at, reg, t, arrived, lives_on) {
                self.state.carve(reg, Owner::Opnd(opnd), 2 * t, 2 * t + 1);
                self.result.repairs += 1;
                return true;
            }
        }
        false
    }

    /// Copy `victim` (read at positions `at` of instruction `t`) out of `reg`.
    ///
    /// When `arrived` is set the victim's register was loaded from its home just before `t`;
    /// that load is redirected to the new place instead of copying the register.
    fn relocate(&mut self, victim: OpndId, at: u8, reg: RegName, t: usize, arrived: bool, lives_on: bool) -> bool {
        let root = self.func.root(victim);
        let ty = self.func.operands[victim].ty;
        let touch = Touch {
            instx: t,
            positions: at,
            role: Role::USE,
            local: Constraint::NULL,
        };
        let legal = self.legal(&touch, ty);
        let (lo, hi) = ((2 * t).saturating_sub(1), 2 * t + 1);

        let spare = indices(self.registers.mask(reg.kind))
            .filter(|&i| i != reg.index)
            .filter_map(|i| reg_at(reg.kind, i, ty.size()))
            .find(|&r| legal.allows_reg(r) && self.state.is_free(r, lo, hi));
        if spare.is_none() && !self.memory_ok(&touch, ty) {
            return false;
        }

        let loaded = arrived
            && self.homes.existing(root).is_some_and(|home| {
                self.result
                    .moves
                    .find_fill(t, Side::Before, victim)
                    .is_some_and(|m| m.src == home)
            });
        if loaded {
            self.result.moves.take_fill(t, Side::Before, victim);
        }

        let parked = match spare {
            Some(r2) => {
                let opnd = self.func.split_operand(root, Location::Reg(r2));
                if loaded {
                    let home = self.home(root);
                    self.result.moves.push(t, Side::Before, MoveClass::Fill, opnd, home);
                } else {
                    self.result.moves.push(t, Side::Before, MoveClass::Save, opnd, victim);
                }
                self.rewrite(&touch, opnd, false);
                self.state.occupy(r2, lo, hi, Owner::Fixed);
                log::debug!("repair: {} parked in {} at #{}", self.func.operands[root].name, r2, t);
                opnd
            }
            None => {
                let home = self.home(root);
                if !loaded {
                    self.result.moves.push(t, Side::Before, MoveClass::Save, home, victim);
                }
                self.rewrite(&touch, home, true);
                log::debug!("repair: {} read from memory at #{}", self.func.operands[root].name, t);
                home
            }
        };
        if lives_on {
            self.result.moves.push(t, Side::After, MoveClass::Fill, victim, parked);
        }
        true
    }

    /// Last resort for a touch nothing could place.
    fn simplify(&mut self, l: usize, touch: &Touch) {
        let (root, ty) = (self.state.oplines[l].opnd, self.state.oplines[l].ty);
        let x = &self.state.instx[touch.instx];
        let inst = x.inst;
        let group = self.func.insts[inst].group();
        self.state.failures += 1;

        let target = group.target.is_some_and(|pos| touch.positions & (1 << pos) != 0);
        if target && ty.allows_mem() {
            if touch.role.is_use() {
                self.flush(l);
            }
            let home = self.home(root);
            self.rewrite(touch, home, true);
            log::debug!("forced target of '{}' to memory", self.func.inst_to_string(inst));
            return;
        }

        log::debug!(
            "no placement for {} in '{}'",
            self.func.operands[root].name,
            self.func.inst_to_string(inst)
        );
        if touch.role.is_use() {
            self.flush(l);
        }
        self.sticky.insert(root);
    }
}
