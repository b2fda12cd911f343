// This module provides the compilation session shared by every allocator run of one
// compilation. CompilationSession owns a bumpalo arena reference, the aggregate SessionStats
// (functions and blocks processed, fixed-point iterations, inserted moves, failures and stack
// slots) and a CounterRegistry of named diagnostic counters. Counter names are interned in
// the session arena so the registry hands out stable `&str` keys for the whole session. The
// registry is owned by the session and passed to reporting explicitly; there is no process
// wide counter list, so concurrent compilations on different threads each keep their own.

//! Arena-based compilation session and diagnostic counters.
//!
//! All allocator runs of one compilation share a session. The session is
//! single-threaded and uses interior mutability so that runs only need a
//! shared reference.

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::fmt;

/// Named diagnostic counters owned by a session.
///
/// Counters keep their registration order so reports are stable.
#[derive(Debug, Default)]
pub struct CounterRegistry<'arena> {
    order: Vec<&'arena str>,
    values: HashMap<&'arena str, u64>,
}

impl<'arena> CounterRegistry<'arena> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter `name`, registering it on first use.
    pub fn add(&mut self, name: &'arena str, n: u64) {
        match self.values.get_mut(name) {
            Some(value) => *value += n,
            None => {
                self.order.push(name);
                self.values.insert(name, n);
            }
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Counters in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'arena str, u64)> + '_ {
        self.order.iter().map(|name| (*name, self.get(name)))
    }
}

impl fmt::Display for CounterRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "  {name}: {value}")?;
        }
        Ok(())
    }
}

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    counters: RefCell<CounterRegistry<'arena>>,
    interned_strings: RefCell<HashSet<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            counters: RefCell::new(CounterRegistry::new()),
            interned_strings: RefCell::new(HashSet::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }
        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    /// Bump a named diagnostic counter.
    pub fn count(&self, name: &str, n: u64) {
        let name = self.intern_str(name);
        self.counters.borrow_mut().add(name, n);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.borrow().get(name)
    }

    /// Render the counter registry, one counter per line.
    pub fn report_counters(&self) -> String {
        self.counters.borrow().to_string()
    }

    pub fn record_function_allocated(&self, name: &str) {
        self.stats.borrow_mut().functions_allocated += 1;
        log::debug!("allocated function {}", name);
    }

    pub fn record_block(&self, iterations: usize, moves: usize, failures: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.blocks_processed += 1;
        stats.iterations += iterations;
        stats.moves_inserted += moves;
        stats.failures += failures;
    }

    pub fn record_slots(&self, slots: usize) {
        self.stats.borrow_mut().stack_slots += slots;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Aggregate statistics over a session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_allocated: usize,
    pub blocks_processed: usize,
    /// pass0/pass1 rounds over all blocks.
    pub iterations: usize,
    /// Spill, fill, evict and repair moves inserted.
    pub moves_inserted: usize,
    /// Local placement failures seen, including those later resolved.
    pub failures: usize,
    pub stack_slots: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocation Session Statistics:")?;
        writeln!(f, "  Functions allocated: {}", self.functions_allocated)?;
        writeln!(f, "  Blocks processed: {}", self.blocks_processed)?;
        writeln!(f, "  Iterations: {}", self.iterations)?;
        writeln!(f, "  Moves inserted: {}", self.moves_inserted)?;
        writeln!(f, "  Failures: {}", self.failures)?;
        writeln!(f, "  Stack slots: {}", self.stack_slots)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_counters_keep_registration_order() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.count("spillgen.moves", 2);
        session.count("spillgen.evictions", 1);
        session.count("spillgen.moves", 3);

        assert_eq!(session.counter("spillgen.moves"), 5);
        assert_eq!(session.counter("spillgen.repairs"), 0);
        assert_eq!(
            session.report_counters(),
            "  spillgen.moves: 5\n  spillgen.evictions: 1\n"
        );
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_function_allocated("f");
        session.record_block(2, 3, 1);
        session.record_block(1, 0, 0);
        session.record_slots(4);

        let stats = session.stats();
        assert_eq!(stats.functions_allocated, 1);
        assert_eq!(stats.blocks_processed, 2);
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.moves_inserted, 3);
        assert_eq!(stats.failures, 1);

        let output = stats.to_string();
        assert!(output.contains("Moves inserted: 3"));
        assert!(output.contains("Stack slots: 4"));
    }
}
