// This module computes block-level liveness for a Function with the standard backward
// dataflow equations. Only operands that can occupy a register are tracked: virtual
// operands and register-located ones. Memory and immediate operands never conflict through
// liveness. Blocks are visited in post-order, computed with an explicit DFS stack, until
// no live-in set changes. A block's
// dispatch (exception handler) successor contributes to its live-out set like any other
// successor; the allocator additionally treats operands live into a handler as
// catch-sensitive.

//! Backward dataflow liveness over basic blocks.

use super::{BlockId, Function, Location, OpndId};
use hashbrown::HashSet;

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    order: Vec<BlockId>,
    live_in: Vec<HashSet<OpndId>>,
    live_out: Vec<HashSet<OpndId>>,
}

impl Liveness {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut liveness = Liveness {
            order: Self::reverse_post_order(func),
            live_in: vec![HashSet::new(); n],
            live_out: vec![HashSet::new(); n],
        };

        // Upward-exposed uses and definitions per block.
        let mut uses = vec![HashSet::new(); n];
        let mut kill = vec![HashSet::new(); n];
        for (b, block) in func.blocks.iter().enumerate() {
            for &inst in &block.insts {
                let inst = &func.insts[inst];
                for (pos, &opnd) in inst.opnds.iter().enumerate() {
                    if !Self::tracked(func, opnd) {
                        continue;
                    }
                    if inst.role(pos).is_use() && !kill[b].contains(&opnd) {
                        uses[b].insert(opnd);
                    }
                }
                for (pos, &opnd) in inst.opnds.iter().enumerate() {
                    if Self::tracked(func, opnd) && inst.role(pos).is_pure_def() {
                        kill[b].insert(opnd);
                    }
                }
            }
        }

        let post: Vec<BlockId> = liveness.order.iter().rev().copied().collect();
        let mut changed = true;
        let mut rounds = 0;
        while changed {
            changed = false;
            rounds += 1;
            for &b in &post {
                let block = &func.blocks[b];
                let mut out = HashSet::new();
                for succ in block.succs.iter().chain(block.dispatch.iter()) {
                    out.extend(liveness.live_in[*succ].iter().copied());
                }
                let mut live = uses[b].clone();
                live.extend(out.iter().copied().filter(|o| !kill[b].contains(o)));
                if live != liveness.live_in[b] {
                    liveness.live_in[b] = live;
                    changed = true;
                }
                liveness.live_out[b] = out;
            }
        }
        log::trace!("liveness of {} settled after {} rounds", func.name, rounds);
        liveness
    }

    /// Operands liveness cares about.
    pub fn tracked(func: &Function, opnd: OpndId) -> bool {
        matches!(func.operands[opnd].loc, Location::None | Location::Reg(_))
    }

    fn reverse_post_order(func: &Function) -> Vec<BlockId> {
        if func.blocks.is_empty() {
            return Vec::new();
        }
        let mut post = Vec::new();
        let mut stack = vec![(0, false)];
        let mut visited = HashSet::new();
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            let b = &func.blocks[block];
            for &succ in b.succs.iter().chain(b.dispatch.iter()) {
                stack.push((succ, false));
            }
        }
        // Unreachable blocks still get sets.
        for b in 0..func.blocks.len() {
            if !visited.contains(&b) {
                post.insert(0, b);
            }
        }
        post.reverse();
        post
    }

    /// Blocks in reverse post-order.
    pub fn order(&self) -> &[BlockId] {
        &self.order
    }

    pub fn live_in(&self, block: BlockId) -> &HashSet<OpndId> {
        &self.live_in[block]
    }

    pub fn live_out(&self, block: BlockId) -> &HashSet<OpndId> {
        &self.live_out[block]
    }

    pub fn is_live_out(&self, block: BlockId, opnd: OpndId) -> bool {
        self.live_out[block].contains(&opnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ir::parse_function;

    #[test]
    fn test_liveness_across_blocks() {
        let func = parse_function(
            r#"
            func f {
            entry:
                mov %a:i32, $1
                mov %b:i32, $2
                cmp %c:flags, %a, $0
                j.e %c, ^other
            next:
                push %a
                ret
            other:
                push %b
                ret
            }
            "#,
        )
        .unwrap();
        let live = Liveness::compute(&func);
        let a = func.operands.iter().position(|o| o.name == "a").unwrap();
        let b = func.operands.iter().position(|o| o.name == "b").unwrap();
        let c = func.operands.iter().position(|o| o.name == "c").unwrap();

        assert!(live.live_in(0).is_empty());
        assert!(live.is_live_out(0, a));
        assert!(live.is_live_out(0, b));
        assert!(!live.is_live_out(0, c));
        assert!(live.live_in(1).contains(&a));
        assert!(!live.live_in(1).contains(&b));
        assert!(live.live_in(2).contains(&b));
        assert_eq!(live.order()[0], 0);
    }

    #[test]
    fn test_loop_keeps_value_live() {
        let func = parse_function(
            r#"
            func loop {
            entry:
                mov %i:i32, $3
            head:
                sub %i, $1
                cmp %f:flags, %i, $0
                j.ne %f, ^head
            exit:
                ret
            }
            "#,
        )
        .unwrap();
        let live = Liveness::compute(&func);
        let i = func.operands.iter().position(|o| o.name == "i").unwrap();
        assert!(live.live_in(1).contains(&i));
        assert!(live.is_live_out(1, i));
        assert!(!live.live_in(2).contains(&i));
    }

    #[test]
    fn test_dispatch_successor_contributes() {
        let func = parse_function(
            r#"
            func f {
            entry: dispatch ^handler
                mov %a:i32, $1
                call $100
                ret
            handler:
                push %a
                ret
            }
            "#,
        )
        .unwrap();
        let live = Liveness::compute(&func);
        let a = func.operands.iter().position(|o| o.name == "a").unwrap();
        assert!(live.is_live_out(0, a));
        assert!(live.live_in(1).contains(&a));
    }
}
