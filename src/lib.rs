//! Assembler and peephole optimizer for a stack-based virtual machine
//!
//! This is the back half of a compiler targeting a CPython-style wordcode interpreter. A
//! front-end decides which instructions to emit and feeds them to a [`code::CodeBuilder`], which
//! takes care of:
//!
//!   - tracking basic blocks and the side tables (constants, names, variables)
//!   - computing the maximum operand stack depth
//!   - laying out blocks and resolving jumps (including operand prefixes for wide operands)
//!   - compressing the source line information
//!
//! The resulting [`code::CodeObject`] is then handed to the [`peephole::PeepholeOptimizer`],
//! which folds constants, threads jumps, and removes dead code directly on the encoded
//! instruction stream.

pub mod bytecode;
pub mod code;
mod error;
pub mod peephole;
pub mod settings;
pub mod util;

pub use error::*;
