use crate::code::{Block, BlockId, Instruction};
use crate::Error;

/// Control flow graph of symbolic instructions for one code unit
///
/// ### Block layout
///
/// Blocks are laid out in the order they get placed (with [`FlowGraph::start_block`] or
/// [`FlowGraph::use_next_block`]), not in some order derived from the graph structure. This means
/// the producer decides the layout, which it usually knows best (it follows the structure of the
/// source). The only block that is placed implicitly is the exit block, which goes last (see
/// [`FlowGraph::seal`]).
///
/// ### Fall-through
///
/// Any placed block that doesn't end in an unconditional transfer of control must fall through
/// into the block placed right after it, and that must be recorded with
/// [`FlowGraph::link_fallthrough`]. This is checked in [`FlowGraph::validate`].
#[derive(Debug)]
pub struct FlowGraph {
    /// Every block, in creation order (indexed by [`BlockId`])
    blocks: Vec<Block>,

    /// Order in which blocks have been placed
    block_order: Vec<BlockId>,

    /// Which blocks have been placed (indexed by [`BlockId`])
    placed: Vec<bool>,

    /// Block currently receiving instructions
    current: BlockId,

    entry: BlockId,
    exit: BlockId,
}

impl FlowGraph {
    /// Graph with a placed (and current) entry block and an unplaced exit block
    pub fn new() -> FlowGraph {
        let mut graph = FlowGraph {
            blocks: vec![],
            block_order: vec![],
            placed: vec![],
            current: BlockId::new(0),
            entry: BlockId::new(0),
            exit: BlockId::new(0),
        };
        let entry = graph.new_block();
        graph.exit = graph.new_block();
        graph.start_block(entry);
        graph
    }

    /// Create a fresh unlinked and unplaced block
    pub fn new_block(&mut self) -> BlockId {
        let block = BlockId::new(self.blocks.len());
        self.blocks.push(Block::default());
        self.placed.push(false);
        block
    }

    /// Place a block after all blocks placed so far and direct future instructions into it
    ///
    /// Panics if the block has already been placed.
    pub fn start_block(&mut self, block: BlockId) {
        assert!(
            !self.placed[block.index()],
            "block {:?} has already been placed",
            block
        );
        self.placed[block.index()] = true;
        self.block_order.push(block);
        self.current = block;
    }

    /// Make the current block fall through into `block`, then start `block`
    pub fn use_next_block(&mut self, block: BlockId) {
        self.link_fallthrough(self.current, block);
        self.start_block(block);
    }

    /// Record that `from` falls through into `to`
    ///
    /// Panics if `from` already has a fall-through successor.
    pub fn link_fallthrough(&mut self, from: BlockId, to: BlockId) {
        let from_block = &mut self.blocks[from.index()];
        if let Some(existing) = from_block.fallthrough {
            panic!(
                "block {:?} already falls through to {:?} (cannot also fall through to {:?})",
                from, existing, to
            );
        }
        from_block.fallthrough = Some(to);
    }

    /// Record that `from` jumps to `to`
    pub fn add_out_edge(&mut self, from: BlockId, to: BlockId) {
        let out_edges = &mut self.blocks[from.index()].out_edges;
        if !out_edges.contains(&to) {
            out_edges.push(to);
        }
    }

    /// Append an instruction to the current block
    pub fn emit(&mut self, instruction: Instruction) {
        if let Some(target) = instruction.operand.target() {
            self.add_out_edge(self.current, target);
        }
        self.blocks[self.current.index()]
            .instructions
            .push(instruction);
    }

    /// Place the exit block if anything can reach it
    ///
    /// The exit block is reachable if some block jumps or falls through to it, or if the current
    /// block can fall off its end (in which case it now falls into the exit block instead).
    pub fn seal(&mut self) {
        if self.is_placed(self.exit) {
            return;
        }

        let exit = self.exit;
        let referenced = self
            .blocks
            .iter()
            .any(|block| block.fallthrough == Some(exit) || block.out_edges.contains(&exit));
        let current_falls_through =
            self.current_block().can_fall_through() && self.current_block().fallthrough.is_none();

        if current_falls_through {
            self.use_next_block(exit);
        } else if referenced {
            self.start_block(exit);
        }
    }

    /// Check the layout invariants
    ///
    ///   - every jump target is placed
    ///   - every placed block either doesn't fall through, or falls through into the next block
    ///   - the last block doesn't fall through
    pub fn validate(&self) -> Result<(), Error> {
        for (idx, block_id) in self.block_order.iter().enumerate() {
            let block = self.block(*block_id);

            for target in &block.out_edges {
                if !self.is_placed(*target) {
                    return Err(Error::UnplacedBlock(*target));
                }
            }

            if !block.can_fall_through() {
                continue;
            }
            let placed_next = self.block_order.get(idx + 1).copied();
            match (block.fallthrough, placed_next) {
                (_, None) => return Err(Error::FallsOffEnd(*block_id)),
                (Some(expected), Some(next)) if expected == next => (),
                (expected, placed_next) => {
                    return Err(Error::BrokenFallthrough {
                        block: *block_id,
                        expected,
                        placed_next,
                    })
                }
            }
        }
        Ok(())
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.index()]
    }

    pub(crate) fn block_mut(&mut self, block: BlockId) -> &mut Block {
        &mut self.blocks[block.index()]
    }

    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn current_block(&self) -> &Block {
        self.block(self.current)
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn is_placed(&self, block: BlockId) -> bool {
        self.placed[block.index()]
    }

    /// Placed blocks, in layout order
    pub fn block_order(&self) -> &[BlockId] {
        &self.block_order
    }
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::OpCode;
    use crate::code::Operand;

    fn insn(opcode: OpCode, operand: Operand) -> Instruction {
        Instruction::new(opcode, operand, 1)
    }

    #[test]
    fn blocks_are_laid_out_in_placement_order() {
        let mut graph = FlowGraph::new();
        let late = graph.new_block();
        let early = graph.new_block();

        graph.emit(insn(OpCode::LoadFast, Operand::Local(0)));
        graph.emit(insn(OpCode::PopJumpIfFalse, Operand::Block(late)));
        graph.use_next_block(early);
        graph.emit(insn(OpCode::LoadConst, Operand::Constant(0)));
        graph.emit(insn(OpCode::ReturnValue, Operand::None));
        graph.start_block(late);
        graph.emit(insn(OpCode::LoadConst, Operand::Constant(1)));
        graph.emit(insn(OpCode::ReturnValue, Operand::None));
        graph.seal();

        assert_eq!(graph.block_order(), &[graph.entry(), early, late]);
        assert_eq!(graph.block(graph.entry()).out_edges, vec![late]);
        assert!(!graph.is_placed(graph.exit()));
        graph.validate().unwrap();
    }

    #[test]
    #[should_panic]
    fn second_fallthrough_panics() {
        let mut graph = FlowGraph::new();
        let a = graph.new_block();
        let b = graph.new_block();
        graph.link_fallthrough(graph.entry(), a);
        graph.link_fallthrough(graph.entry(), b);
    }

    #[test]
    fn exit_is_placed_when_reachable() {
        let mut graph = FlowGraph::new();
        let exit = graph.exit();
        graph.emit(insn(OpCode::LoadFast, Operand::Local(0)));
        graph.emit(insn(OpCode::PopJumpIfTrue, Operand::Block(exit)));
        graph.emit(insn(OpCode::LoadConst, Operand::Constant(0)));
        graph.emit(insn(OpCode::ReturnValue, Operand::None));
        graph.seal();
        assert_eq!(graph.block_order(), &[graph.entry(), exit]);

        // Exit block is empty so it still falls off the end
        assert!(matches!(graph.validate(), Err(Error::FallsOffEnd(b)) if b == exit));
    }

    #[test]
    fn layout_violations_are_reported() {
        let mut graph = FlowGraph::new();
        let other = graph.new_block();
        graph.emit(insn(OpCode::LoadFast, Operand::Local(0)));
        graph.start_block(other);
        graph.emit(insn(OpCode::ReturnValue, Operand::None));
        assert!(matches!(
            graph.validate(),
            Err(Error::BrokenFallthrough { expected: None, placed_next: Some(b), .. }) if b == other
        ));

        let mut graph = FlowGraph::new();
        let never_placed = graph.new_block();
        graph.emit(insn(OpCode::JumpAbsolute, Operand::Block(never_placed)));
        assert!(matches!(
            graph.validate(),
            Err(Error::UnplacedBlock(b)) if b == never_placed
        ));
    }
}
