// This module gathers the target-independent infrastructure of SpillGen: the operand
// constraint model, register names and register-class tables, the compilation session with
// its statistics and counter registry, allocator configuration and the error types. The
// allocator, the IR and the IA-32 tables all build on these pieces.

//! Core SpillGen infrastructure.
//!
//! # Key Components
//!
//! ## Constraints (`constraint`)
//! - Kind set, size and register mask of legal operand placements
//! - Intersection, union and containment
//!
//! ## Register File (`register_file`)
//! - Register names with size aliases
//! - Per-kind register masks
//! - The register-class table built from the `regs` option
//!
//! ## Session Management (`session`)
//! - Arena-based string interning using `bumpalo`
//! - Allocation statistics and named diagnostic counters

pub mod config;
pub mod constraint;
pub mod error;
pub mod register_file;
pub mod session;

pub use config::AllocatorConfig;

pub use constraint::{Constraint, OpndKind, OpndSize};

pub use register_file::{RegKind, RegMasks, RegName, Registers};

pub use session::{CompilationSession, CounterRegistry, SessionStats};

pub use error::{AllocError, AllocResult};
