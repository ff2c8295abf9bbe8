//! Control flow graph assembler
//!
//! ### Structure
//!
//! The body of a code unit starts out as a [`FlowGraph`] of [`Block`]s of symbolic
//! [`Instruction`]s. Operands are still symbolic too: indices into side tables that are being
//! built up at the same time (constants, names, variables) or, for jumps, references to other
//! blocks.
//!
//! ### Assembly
//!
//! Turning the graph into a [`CodeObject`] goes through:
//!
//!   - [`max_stack_depth`], which computes the stack size the code object header declares
//!   - [`jump_encoding::flatten`], which lays out the blocks and resolves jump targets into
//!     concrete offsets (this is a fixed point computation since operand widths depend on
//!     offsets)
//!   - [`LineTableBuilder`], which compresses the line changes recorded while flattening
//!
//! [`CodeBuilder`] ties this together behind an interface for emitting code from top to bottom.

mod basic_block;
mod code_builder;
mod code_object;
mod constants;
mod flow_graph;
pub mod jump_encoding;
mod label;
pub mod line_table;
mod stack_depth;

pub use basic_block::*;
pub use code_builder::*;
pub use code_object::*;
pub use constants::*;
pub use flow_graph::*;
pub use jump_encoding::{flatten, FlatCode};
pub use label::*;
pub use line_table::{LineBreak, LineTableBuilder, LineTableEntry};
pub use stack_depth::*;
