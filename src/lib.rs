//! SpillGen - per-block constrained register allocation for IA-32.
//!
//! SpillGen assigns a physical register or a stack slot to every virtual
//! operand of a function, one basic block at a time. Placement follows the
//! operand constraints of an IA-32 opcode table, so the rewritten code is
//! always encodable; spill, fill and evict moves are inserted where values
//! have to leave their registers. Each block is iterated until every operand
//! is placed, or rejected when a round makes no progress.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use spillgen::core::{AllocatorConfig, CompilationSession};
//! use spillgen::spillgen::allocate_function;
//! use spillgen::test_ir::parse_function;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//!
//! let mut func = parse_function(source)?;
//! let stats = allocate_function(&mut func, &session, &AllocatorConfig::default())?;
//! let code = spillgen::ia32::emit_function(&func, &arena)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Constraints, register classes, session, configuration, errors
//! - [`ia32`] - Opcode table, calling convention and machine-code emission
//! - [`ir`] - Function model, liveness, reference interpreter and verifier
//! - [`spillgen`] - The allocator: pass0, pass1, moves and the driver
//! - [`test_ir`] - Textual IR parser

pub mod core;
pub mod ia32;
pub mod ir;
pub mod spillgen;
pub mod test_ir;

pub use self::core::{
    AllocError, AllocResult, AllocatorConfig, CompilationSession, Constraint, RegName, Registers,
    SessionStats,
};
pub use ir::Function;
pub use spillgen::{allocate_function, AllocStats, SpillGen};
