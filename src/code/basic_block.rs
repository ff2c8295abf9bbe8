use crate::bytecode::{instr_size, to_operand, OpCode, CODE_UNIT};
use crate::code::BlockId;
use crate::util::{Offset, Width};
use crate::Error;
use std::collections::HashMap;

/// Operand of a symbolic instruction
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Operand {
    /// Operand byte is unused (and written as `0`)
    None,

    /// Literal integer operand (argument counts, comparison kinds, flags, ...)
    Immediate(u32),

    /// Index into the constant pool
    Constant(usize),

    /// Index into the name table
    Name(usize),

    /// Index into the local variable table
    Local(usize),

    /// Index into the cell variables followed by the free variables
    Deref(usize),

    /// Jump target, resolved to an offset during flattening
    Block(BlockId),
}

impl Operand {
    /// Symbolic jump target, if any
    pub fn target(&self) -> Option<BlockId> {
        match self {
            Operand::Block(block) => Some(*block),
            _ => None,
        }
    }

    /// Integer value of the operand, for operands that don't depend on layout
    pub fn value(&self) -> Option<usize> {
        match *self {
            Operand::None => Some(0),
            Operand::Immediate(value) => Some(value as usize),
            Operand::Constant(idx)
            | Operand::Name(idx)
            | Operand::Local(idx)
            | Operand::Deref(idx) => Some(idx),
            Operand::Block(_) => None,
        }
    }
}

/// Symbolic instruction
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,

    /// Source line the instruction was emitted for
    pub line: u32,

    /// Code units the instruction currently takes up, prefixes included
    ///
    /// For jumps, this starts at `1` and only ever grows while jumps are being resolved.
    pub(crate) units: u8,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand, line: u32) -> Instruction {
        Instruction {
            opcode,
            operand,
            line,
            units: 1,
        }
    }

    /// Set the width of non-jump instructions from their operand
    pub(crate) fn size_operand(&mut self) -> Result<(), Error> {
        if let Some(value) = self.operand.value() {
            let operand = to_operand(self.opcode, value)?;
            self.units = instr_size(operand) as u8;
        }
        Ok(())
    }
}

impl Width for Instruction {
    fn width(&self) -> usize {
        self.units as usize * CODE_UNIT
    }
}

/// Basic block of symbolic instructions
#[derive(Clone, Debug, Default)]
pub struct Block {
    /// Instructions in the block
    pub instructions: Vec<Instruction>,

    /// Blocks targeted by jumps inside this block (without duplicates)
    pub out_edges: Vec<BlockId>,

    /// Block that execution continues into when the end of this block is reached
    pub fallthrough: Option<BlockId>,
}

impl Block {
    /// Can execution reach the end of the block?
    ///
    /// Instructions after an unconditional transfer are dead, so any such transfer in the block
    /// (not just a trailing one) prevents falling through.
    pub fn can_fall_through(&self) -> bool {
        !self
            .instructions
            .iter()
            .any(|insn| insn.opcode.is_unconditional_transfer())
    }

    /// Given an expected order of blocks, compute the offset of every basic block with respect to
    /// the start of the code.
    pub fn compute_block_offsets(
        block_layout_order: &[BlockId],
        blocks: &[Block],
    ) -> HashMap<BlockId, Offset> {
        let mut block_offsets: HashMap<BlockId, Offset> = HashMap::new();
        let mut offset = Offset(0);
        for block_id in block_layout_order {
            block_offsets.insert(*block_id, offset);
            offset.0 += blocks[block_id.index()].width();
        }
        block_offsets
    }
}

impl Width for Block {
    fn width(&self) -> usize {
        self.instructions.width()
    }
}
