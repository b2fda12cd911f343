//! Textual IR for writing allocator tests and feeding the command-line driver.
//!
//! The format mirrors what `Function`'s `Display` implementation prints, so a
//! function can be parsed, allocated, printed and parsed again.
//!
//! # Format
//!
//! ```text
//! ; Comments start with semicolon
//! func name {
//! entry: dispatch ^handler
//!     mov %a:i32, $1          ; virtual operand, typed on first mention
//!     cmp %f:flags, %a, ecx   ; physical registers are shared operands
//!     j.ne %f, ^exit          ; condition suffix, block targets with '^'
//! body:
//!     mov [s0:i32], %a        ; stack slot 0 viewed as i32
//!     call $100
//! exit:
//!     ret
//! handler:
//!     ret
//! }
//! ```
//!
//! Types are `i8`, `i32`, `i64`, `f32`, `f64` and `flags`. Immediates accept
//! decimal and `0x` hex with an optional sign. A block without a terminator
//! falls through to the next one.

pub mod parser;

pub use parser::{parse_function, parse_module};
