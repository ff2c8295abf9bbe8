//! Resolve symbolic jump targets and flatten blocks into a single instruction stream
//!
//! Blocks are laid out back to back in placement order, then every jump operand is replaced by
//! either a forward distance (relative jumps) or a byte offset (absolute jumps). Operands wider
//! than a byte need [`OpCode::ExtendedArg`] prefixes, which makes the jump instruction itself
//! wider and so shifts everything after it:
//!
//! ```text,ignore,no_run
//!     JUMP_ABSOLUTE L2                EXTENDED_ARG 0x01
//! L1: ...                  =>         JUMP_ABSOLUTE 0x02
//!     ...                         L1: ...
//! L2: ...   ; offset 0x102            ...
//!                                 L2: ...   ; now at offset 0x104
//! ```
//!
//! ### Termination
//!
//! Widening one jump can push the target of another jump past a width boundary, so the layout is
//! recomputed until no jump needs to grow. This always finishes:
//!
//!   - jumps start at the smallest width and their width never shrinks (if an operand turns out to
//!     need fewer bytes than the current width, the unused prefixes are written as zeros)
//!
//!   - there are at most 4 widths, so each jump can grow at most 3 times
//!
//! Every pass that doesn't reach the fixed point grows at least one jump, so there are at most
//! `3 * jumps + 1` passes. Going past that means something is badly wrong, and is reported as
//! [`Error::JumpResolutionDiverged`].

use crate::bytecode::{
    instr_size, to_operand, write_instruction, CodeUnit, JumpKind, OpCode, Serialize,
};
use crate::code::{Block, BlockId, FlowGraph, LineBreak, Operand};
use crate::util::{Offset, Width};
use crate::Error;
use std::collections::HashMap;

/// Result of flattening a flow graph
#[derive(Debug)]
pub struct FlatCode {
    /// Encoded instruction stream
    pub code: Vec<u8>,

    /// Offsets at which the source line changes (the first instruction always starts one)
    pub line_breaks: Vec<LineBreak>,

    /// Final offset of every placed block
    pub block_offsets: HashMap<BlockId, Offset>,

    /// Number of layout passes it took for jump widths to stabilize
    pub iterations: usize,
}

/// Lay out the placed blocks of the graph and resolve every jump
///
/// The graph is expected to have passed [`FlowGraph::validate`]. On return, the instructions in
/// the graph are annotated with their final widths.
pub fn flatten(graph: &mut FlowGraph) -> Result<FlatCode, Error> {
    let order: Vec<BlockId> = graph.block_order().to_vec();

    for block_id in &order {
        for target in &graph.block(*block_id).out_edges {
            if !graph.is_placed(*target) {
                return Err(Error::UnplacedBlock(*target));
            }
        }
    }

    // Size every instruction that doesn't depend on layout, and count jumps
    let mut jump_count = 0;
    for block_id in &order {
        for insn in &mut graph.block_mut(*block_id).instructions {
            match insn.operand.target() {
                Some(_) => jump_count += 1,
                None => insn.size_operand()?,
            }
        }
    }

    let max_iterations = 3 * jump_count + 2;
    let mut iterations = 0;
    let block_offsets = loop {
        iterations += 1;
        if iterations > max_iterations {
            return Err(Error::JumpResolutionDiverged { iterations });
        }

        let block_offsets = Block::compute_block_offsets(&order, graph.blocks());
        let mut grew = false;
        for block_id in &order {
            let mut offset = block_offsets[block_id];
            for insn in &mut graph.block_mut(*block_id).instructions {
                if let Operand::Block(target) = insn.operand {
                    let end = Offset(offset.0 + insn.width());
                    let operand = jump_operand(insn.opcode, end, block_offsets[&target])?;
                    let needed = instr_size(operand) as u8;
                    if needed > insn.units {
                        log::trace!(
                            "widening {:?} at {:?} to {} units",
                            insn.opcode,
                            offset,
                            needed
                        );
                        insn.units = needed;
                        grew = true;
                    }
                }
                offset.0 += insn.width();
            }
        }

        if !grew {
            break block_offsets;
        }
    };

    // Encode
    let mut units: Vec<CodeUnit> = vec![];
    let mut line_breaks: Vec<LineBreak> = vec![];
    for block_id in &order {
        for insn in &graph.block(*block_id).instructions {
            let offset = Offset(units.width());
            if line_breaks.last().map_or(true, |brk| brk.line != insn.line) {
                line_breaks.push(LineBreak {
                    offset,
                    line: insn.line,
                });
            }

            let operand = match insn.operand {
                Operand::Block(target) => {
                    let end = Offset(offset.0 + insn.width());
                    jump_operand(insn.opcode, end, block_offsets[&target])?
                }
                other => match other.value() {
                    Some(value) => to_operand(insn.opcode, value)?,
                    None => 0,
                },
            };
            write_instruction(&mut units, insn.opcode, operand, insn.units as usize);
        }
    }

    Ok(FlatCode {
        code: units.to_bytes(),
        line_breaks,
        block_offsets,
        iterations,
    })
}

/// Operand that makes a jump ending at `end` land on `target`
pub(crate) fn jump_operand(opcode: OpCode, end: Offset, target: Offset) -> Result<u32, Error> {
    match opcode.jump_kind() {
        JumpKind::Absolute => to_operand(opcode, target.0),
        JumpKind::Relative => {
            if target < end {
                return Err(Error::BackwardRelativeJump {
                    opcode,
                    from: end,
                    to: target,
                });
            }
            to_operand(opcode, target.0 - end.0)
        }
        JumpKind::None => Ok(0),
    }
}
