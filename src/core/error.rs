// This module defines error types for SpillGen using the thiserror crate. AllocError is the
// main error enum covering the fatal outcomes of an allocation run: a block whose failure
// count stops decreasing (non-convergence), an instruction whose final operand placement
// matches no opcode form, an unknown mnemonic, a bad register name or configuration value,
// malformed text IR, operands left unplaced at emission time and machine-code emission
// failures. Local placement failures are never errors; they are counted by the allocator
// and only escalate through NonConvergence. AllocResult<T> is the convenience alias.

//! Error types for the allocator.

use thiserror::Error;

/// Main error type for allocation runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Block {block} did not converge: {failures} failures after {iterations} iterations")]
    NonConvergence {
        block: String,
        failures: usize,
        iterations: usize,
    },

    #[error("Instruction '{inst}' matches no encodable form")]
    Unencodable {
        inst: String,
    },

    #[error("No opcode group for {mnemonic} with {arity} operands")]
    MissingOpcodeGroup {
        mnemonic: String,
        arity: usize,
    },

    #[error("Unknown register: {name}")]
    UnknownRegister {
        name: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Parse error at line {line}: {reason}")]
    Parse {
        line: usize,
        reason: String,
    },

    #[error("Operand {operand} has no location")]
    UnplacedOperand {
        operand: String,
    },

    #[error("Allocated code failed verification: {reason}")]
    Verification {
        reason: String,
    },

    #[error("Code emission failed: {reason}")]
    Emit {
        reason: String,
    },
}

/// Result type alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
