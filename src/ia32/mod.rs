//! IA-32 target description.
//!
//! - [`opcodes`] - opcode groups, operand roles and the positional constraint oracle
//! - [`calling_convention`] - cdecl clobber sets and the emitted frame layout
//! - [`emit`] - machine code emission of allocated functions using iced-x86

pub mod calling_convention;
pub mod emit;
pub mod opcodes;

pub use calling_convention::{CCInfo, Cdecl, FunctionFrame};
pub use emit::{emit_function, Ia32Encoder};
pub use opcodes::{opcode_table, Cond, GroupKind, OpcodeGroup, OpcodeTable, Placed, Role};
