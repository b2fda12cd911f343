// This module is the SpillGen driver. A SpillGen value lives for one allocation run: it owns
// the register-class table selected by the configuration, the home slots handed out so far
// and a scratch arena for the per-pass records. Liveness is computed once per function, then
// every non-empty block is driven to a fixed point on its own: pass0 scans it, pass1 places
// its operands, the queued rewrites and moves are applied and the round repeats while
// failures remain. Each round must strictly reduce the failure count and stay within the
// configured iteration cap; otherwise the block does not converge and the whole function is
// rejected with AllocError::NonConvergence. Values cross block boundaries only through their
// home slots, so blocks can be processed in any order. Statistics flow into the session and
// its counter registry.

//! SpillGen: per-block constrained register allocation.
//!
//! ```ignore
//! use bumpalo::Bump;
//! use spillgen::core::{AllocatorConfig, CompilationSession};
//! use spillgen::spillgen::allocate_function;
//! use spillgen::test_ir::parse_function;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut func = parse_function(text)?;
//! let stats = allocate_function(&mut func, &session, &AllocatorConfig::default())?;
//! ```

pub mod moves;
pub mod pass0;
pub mod pass1;

use crate::core::{AllocError, AllocResult, AllocatorConfig, CompilationSession, Registers};
use crate::ir::verify::verify;
use crate::ir::{BlockId, Function, Liveness, OpndId};
use bumpalo::Bump;
use hashbrown::HashSet;
use moves::{apply_rewrites, Homes};
use pass0::Pass0Context;

/// Outcome of allocating one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub blocks: usize,
    /// pass0/pass1 rounds over all blocks.
    pub iterations: usize,
    pub moves: usize,
    /// Placement failures seen along the way, all resolved.
    pub failures: usize,
    pub evictions: usize,
    pub repairs: usize,
    /// Home slots created.
    pub slots: usize,
}

pub struct SpillGen<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    registers: Registers,
    max_iterations: usize,
    verify: bool,
    homes: Homes,
    scratch: Bump,
}

impl<'s, 'arena> SpillGen<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, config: &AllocatorConfig) -> AllocResult<Self> {
        Ok(Self {
            session,
            registers: config.registers()?,
            max_iterations: config.max_iterations,
            verify: config.verify,
            homes: Homes::new(),
            scratch: Bump::new(),
        })
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Allocate every block of `func` in place.
    pub fn run(&mut self, func: &mut Function) -> AllocResult<AllocStats> {
        log::debug!("allocating {} ({} blocks)", func.name, func.blocks.len());
        let liveness = Liveness::compute(func);
        self.homes = Homes::new();

        let mut stats = AllocStats::default();
        for block in 0..func.blocks.len() {
            if func.blocks[block].insts.is_empty() {
                continue;
            }
            self.run_block(func, block, &liveness, &mut stats)?;
        }
        stats.slots = self.homes.len();

        self.session.record_slots(stats.slots);
        self.session.record_function_allocated(&func.name);
        self.session.count("spillgen.moves", stats.moves as u64);
        self.session.count("spillgen.evictions", stats.evictions as u64);
        self.session.count("spillgen.repairs", stats.repairs as u64);

        if self.verify {
            verify(func).map_err(|e| AllocError::Verification {
                reason: e.to_string(),
            })?;
        }
        log::debug!(
            "{}: {} moves, {} slots, {} iterations",
            func.name,
            stats.moves,
            stats.slots,
            stats.iterations
        );
        Ok(stats)
    }

    fn run_block(
        &mut self,
        func: &mut Function,
        block: BlockId,
        liveness: &Liveness,
        stats: &mut AllocStats,
    ) -> AllocResult<()> {
        let mut sticky: HashSet<OpndId> = HashSet::new();
        let mut previous: Option<usize> = None;
        let mut iterations = 0;
        let mut moved = 0;
        let mut seen = 0;

        loop {
            iterations += 1;
            self.scratch.reset();
            let ctx = Pass0Context {
                liveness,
                registers: &self.registers,
                sticky: &sticky,
            };
            let mut state = pass0::run(func, block, &ctx, &self.scratch);
            if state.oplines.is_empty() && state.failures == 0 {
                break;
            }

            let result = pass1::run(func, &mut state, &self.registers, &mut self.homes, &mut sticky);
            let failures = state.failures;
            apply_rewrites(func, &result.rewrites);
            moved += result.moves.apply(func, block)?;
            stats.evictions += result.evictions;
            stats.repairs += result.repairs;
            seen += failures;

            if failures == 0 {
                break;
            }
            log::debug!(
                "{}: round {} left {} failures",
                func.blocks[block].name,
                iterations,
                failures
            );
            if previous.is_some_and(|p| failures >= p) || iterations >= self.max_iterations {
                self.session.record_block(iterations, moved, seen);
                log::warn!("{}: no progress after {} rounds", func.blocks[block].name, iterations);
                return Err(AllocError::NonConvergence {
                    block: func.blocks[block].name.clone(),
                    failures,
                    iterations,
                });
            }
            previous = Some(failures);
        }

        self.session.record_block(iterations, moved, seen);
        stats.blocks += 1;
        stats.iterations += iterations;
        stats.moves += moved;
        stats.failures += seen;
        Ok(())
    }
}

/// Allocate `func` with a fresh allocator built from `config`.
pub fn allocate_function(
    func: &mut Function,
    session: &CompilationSession<'_>,
    config: &AllocatorConfig,
) -> AllocResult<AllocStats> {
    SpillGen::new(session, config)?.run(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ir::parse_function;

    fn config(regs: &str) -> AllocatorConfig {
        AllocatorConfig {
            regs: regs.to_string(),
            verify: true,
            ..AllocatorConfig::default()
        }
    }

    #[test]
    fn test_allocates_and_counts() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut func = parse_function(
            r#"
            func f {
            entry:
                mov %a:i32, $1
                call $100
                push %a
                push %a
                ret
            }
            "#,
        )
        .unwrap();

        let stats = allocate_function(&mut func, &session, &config("eax")).unwrap();
        assert_eq!(func.virtual_count(), 0);
        assert_eq!(stats.moves, 2);
        assert_eq!(stats.slots, 1);
        assert_eq!(session.counter("spillgen.moves"), 2);
        assert_eq!(session.stats().functions_allocated, 1);
        assert_eq!(session.stats().stack_slots, 1);
    }

    #[test]
    fn test_flags_and_bytes() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut func = parse_function(
            r#"
            func g {
            entry:
                mov %x:i32, $3
                cmp %f:flags, %x, $3
                set.e %f, %b:i8
                push %x
                ret
            }
            "#,
        )
        .unwrap();
        let stats = allocate_function(&mut func, &session, &config("ALL")).unwrap();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.moves, 0);
        assert_eq!(func.virtual_count(), 0);
        assert_eq!(func.inst_to_string(func.blocks[0].insts[2]), "set.e flags, al");
    }

    #[test]
    fn test_non_convergence_is_fatal() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut func = parse_function(
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
        let err = allocate_function(&mut func, &session, &config("ALL")).unwrap_err();
        assert_eq!(
            err,
            AllocError::NonConvergence {
                block: "entry".to_string(),
                failures: 1,
                iterations: 2,
            }
        );
    }

    #[test]
    fn test_bad_register_list() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(matches!(
            SpillGen::new(&session, &config("eax,r9")),
            Err(AllocError::UnknownRegister { .. })
        ));
    }
}
