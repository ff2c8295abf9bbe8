//! Instruction set contract of the target virtual machine
//!
//! ### Encoding
//!
//! Every instruction occupies one fixed-size [`CodeUnit`]: an opcode byte followed by a single
//! operand byte (which is just `0` for opcodes that don't take an operand). Operands that don't
//! fit in a byte get their higher-order bytes from [`OpCode::ExtendedArg`] prefixes placed right
//! before the instruction, most significant byte first:
//!
//! ```text,ignore,no_run
//!     EXTENDED_ARG 0x01
//!     EXTENDED_ARG 0x86
//!     LOAD_CONST   0xa0      ; operand is 0x0186a0 = 100000
//! ```
//!
//! There are at most 3 prefixes, so operands are at most 4 bytes wide.
//!
//! ### Jumps
//!
//! Every opcode is statically classified by [`OpCode::jump_kind`]. Relative jump operands are
//! measured in bytes from the end of the (possibly prefixed) jump instruction and only go
//! forward. Absolute jump operands are byte offsets from the start of the code.
//!
//! ### Stack effects
//!
//! The net effect of every instruction on the operand stack is looked up in an immutable
//! [`StackEffectTable`]. This is configuration, not a property of the opcodes: a different
//! table can be built for a different variant of the instruction set.

mod binary_format;
mod code_unit;
mod opcode;
mod stack_effect;

pub use binary_format::*;
pub use code_unit::*;
pub use opcode::*;
pub use stack_effect::*;
