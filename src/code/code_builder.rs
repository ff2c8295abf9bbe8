use crate::bytecode::{OpCode, StackEffectTable};
use crate::code::{
    flatten, max_stack_depth, BlockId, CodeMetadata, CodeObject, Constant, ConstantPool,
    FlowGraph, Instruction, LineTableBuilder, Operand, Variables,
};
use crate::peephole::PeepholeOptimizer;
use crate::settings::Settings;
use crate::Error;
use indexmap::IndexSet;

/// This provides the interface through which a front-end emits the body of one code unit. It does
/// the internal bookkeeping for blocks, side tables (constants, names, variables) and source
/// lines, then assembles everything into a [`CodeObject`].
///
/// ### Block layout
///
/// Instructions always go into the current block. Starting a new block places it after all
/// blocks placed so far: use [`CodeBuilder::use_next_block`] if the current block can fall
/// through into the new one, and [`CodeBuilder::start_block`] if it can't (because it ends in a
/// jump, return, or raise).
///
/// ### Nested units
///
/// Nested units are built with their own builder. Once assembled, they are just constants of the
/// enclosing unit (see [`Constant::Code`]).
pub struct CodeBuilder {
    graph: FlowGraph,
    constants: ConstantPool,

    /// Names used by global/attribute/import instructions
    names: IndexSet<String>,

    /// Local variables (the symbol table's locals, extended with any other locals emitted)
    varnames: IndexSet<String>,
    cellvars: Vec<String>,
    freevars: Vec<String>,

    metadata: CodeMetadata,

    /// Line attached to instructions being emitted
    line: u32,
}

impl CodeBuilder {
    pub fn new(metadata: CodeMetadata, variables: Variables) -> CodeBuilder {
        CodeBuilder {
            graph: FlowGraph::new(),
            constants: ConstantPool::new(),
            names: IndexSet::new(),
            varnames: variables.varnames.into_iter().collect(),
            cellvars: variables.cellvars,
            freevars: variables.freevars,
            line: metadata.first_line,
            metadata,
        }
    }

    /// Set the source line of instructions emitted from here on
    pub fn set_lineno(&mut self, line: u32) {
        self.line = line;
    }

    fn push(&mut self, opcode: OpCode, operand: Operand) {
        self.graph
            .emit(Instruction::new(opcode, operand, self.line));
    }

    /// Emit an instruction which takes no operand
    pub fn emit(&mut self, opcode: OpCode) {
        self.push(opcode, Operand::None);
    }

    /// Emit an instruction with an immediate operand
    pub fn emit_arg(&mut self, opcode: OpCode, arg: u32) {
        self.push(opcode, Operand::Immediate(arg));
    }

    /// Emit a jump to a block
    pub fn emit_jump(&mut self, opcode: OpCode, target: BlockId) {
        debug_assert!(opcode.is_jump(), "{:?} is not a jump", opcode);
        self.push(opcode, Operand::Block(target));
    }

    /// Emit a `LOAD_CONST`, returning the index of the constant
    pub fn load_const(&mut self, constant: Constant) -> usize {
        let index = self.constants.get_or_insert(constant);
        self.push(OpCode::LoadConst, Operand::Constant(index));
        index
    }

    /// Emit an instruction operating on a name (global, attribute, import, ...)
    pub fn emit_name(&mut self, opcode: OpCode, name: &str) {
        let index = match self.names.get_index_of(name) {
            Some(index) => index,
            None => self.names.insert_full(name.to_owned()).0,
        };
        self.push(opcode, Operand::Name(index));
    }

    /// Emit an instruction operating on a fast local
    pub fn emit_local(&mut self, opcode: OpCode, name: &str) {
        let index = match self.varnames.get_index_of(name) {
            Some(index) => index,
            None => self.varnames.insert_full(name.to_owned()).0,
        };
        self.push(opcode, Operand::Local(index));
    }

    /// Emit an instruction operating on a cell or free variable
    pub fn emit_deref(&mut self, opcode: OpCode, name: &str) -> Result<(), Error> {
        let index = self
            .cellvars
            .iter()
            .position(|cell| cell == name)
            .or_else(|| {
                self.freevars
                    .iter()
                    .position(|free| free == name)
                    .map(|idx| idx + self.cellvars.len())
            })
            .ok_or_else(|| Error::UnknownDerefVariable(name.to_owned()))?;
        self.push(opcode, Operand::Deref(index));
        Ok(())
    }

    pub fn new_block(&mut self) -> BlockId {
        self.graph.new_block()
    }

    /// Place a block which the current block does not fall into
    pub fn start_block(&mut self, block: BlockId) {
        self.graph.start_block(block);
    }

    /// Place a block which the current block falls into
    pub fn use_next_block(&mut self, block: BlockId) {
        self.graph.use_next_block(block);
    }

    pub fn current_block(&self) -> BlockId {
        self.graph.current()
    }

    /// Block placed at the very end, if anything reaches it
    pub fn exit_block(&self) -> BlockId {
        self.graph.exit()
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Assemble the code unit, then run the optimizer on it
    pub fn assemble(
        mut self,
        effects: &StackEffectTable,
        settings: &Settings,
    ) -> Result<CodeObject, Error> {
        self.graph.seal();
        if settings.implicit_return && self.graph.current_block().can_fall_through() {
            self.load_const(Constant::None);
            self.emit(OpCode::ReturnValue);
        }
        self.graph.validate()?;

        let stacksize = max_stack_depth(&self.graph, effects)?;
        let flat = flatten(&mut self.graph)?;

        let mut line_table = LineTableBuilder::new(self.metadata.first_line);
        for line_break in &flat.line_breaks {
            line_table.push(*line_break)?;
        }

        log::debug!(
            "assembled {:?}: {} bytes, max stack depth {}, jumps resolved in {} passes",
            self.metadata.name,
            flat.code.len(),
            stacksize,
            flat.iterations
        );

        let code = CodeObject::assemble(
            self.metadata,
            Variables {
                varnames: self.varnames.into_iter().collect(),
                cellvars: self.cellvars,
                freevars: self.freevars,
            },
            self.names.into_iter().collect(),
            self.constants.into_vec(),
            flat.code,
            stacksize,
            line_table.finish(),
        );

        PeepholeOptimizer::new(&settings.fold_limits).optimize(code, settings.peephole_passes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::DecodedInstruction;
    use crate::code::CodeFlags;

    fn ops(code: &CodeObject) -> Vec<(OpCode, u32)> {
        code.instructions()
            .unwrap()
            .iter()
            .map(|insn: &DecodedInstruction| (insn.opcode, insn.arg))
            .collect()
    }

    fn unoptimized() -> Settings {
        Settings {
            peephole_passes: 0,
            ..Settings::new()
        }
    }

    #[test]
    fn implicit_return_is_appended() {
        let mut builder = CodeBuilder::new(
            CodeMetadata::new("<module>", "m.py", 1),
            Variables::default(),
        );
        builder.load_const(Constant::int(1));
        builder.emit_name(OpCode::StoreName, "x");

        let code = builder
            .assemble(&StackEffectTable::base(), &unoptimized())
            .unwrap();
        assert_eq!(
            ops(&code),
            vec![
                (OpCode::LoadConst, 0),
                (OpCode::StoreName, 0),
                (OpCode::LoadConst, 1),
                (OpCode::ReturnValue, 0),
            ]
        );
        assert_eq!(code.constants, vec![Constant::int(1), Constant::None]);
        assert_eq!(code.names, vec!["x".to_owned()]);
        assert_eq!(code.stacksize, 1);
        assert!(code.flags.contains(CodeFlags::NOFREE));
    }

    #[test]
    fn falling_off_the_end_without_implicit_return() {
        let mut builder = CodeBuilder::new(
            CodeMetadata::new("<module>", "m.py", 1),
            Variables::default(),
        );
        builder.emit(OpCode::Nop);
        let settings = Settings {
            implicit_return: false,
            ..unoptimized()
        };
        assert!(matches!(
            builder.assemble(&StackEffectTable::base(), &settings),
            Err(Error::FallsOffEnd(_))
        ));
    }

    #[test]
    fn variable_tables() {
        let mut builder = CodeBuilder::new(
            CodeMetadata::new("f", "m.py", 3),
            Variables {
                varnames: vec!["a".to_owned()],
                cellvars: vec!["c".to_owned()],
                freevars: vec!["f".to_owned()],
            },
        );
        builder.emit_local(OpCode::LoadFast, "a");
        builder.emit_deref(OpCode::LoadDeref, "f").unwrap();
        builder.emit_deref(OpCode::LoadDeref, "c").unwrap();
        builder.emit_local(OpCode::StoreFast, "tmp");
        builder.emit(OpCode::BinaryAdd);
        builder.emit(OpCode::ReturnValue);
        assert!(matches!(
            builder.emit_deref(OpCode::LoadDeref, "nope"),
            Err(Error::UnknownDerefVariable(_))
        ));

        let code = builder
            .assemble(&StackEffectTable::base(), &unoptimized())
            .unwrap();
        assert_eq!(
            ops(&code),
            vec![
                (OpCode::LoadFast, 0),
                (OpCode::LoadDeref, 1),
                (OpCode::LoadDeref, 0),
                (OpCode::StoreFast, 1),
                (OpCode::BinaryAdd, 0),
                (OpCode::ReturnValue, 0),
            ]
        );
        assert_eq!(code.varnames, vec!["a".to_owned(), "tmp".to_owned()]);
        assert_eq!(code.nlocals, 2);
        assert_eq!(code.stacksize, 3);
        assert!(!code.flags.contains(CodeFlags::NOFREE));
    }

    #[test]
    fn exit_block_is_shared() {
        let mut builder = CodeBuilder::new(
            CodeMetadata::new("f", "m.py", 1),
            Variables {
                varnames: vec!["a".to_owned()],
                ..Variables::default()
            },
        );
        let exit = builder.exit_block();
        let other = builder.new_block();
        builder.emit_local(OpCode::LoadFast, "a");
        builder.emit_jump(OpCode::PopJumpIfFalse, exit);
        builder.use_next_block(other);
        builder.set_lineno(2);
        builder.load_const(Constant::str("yes"));
        builder.emit(OpCode::PrintExpr);

        let code = builder
            .assemble(&StackEffectTable::base(), &unoptimized())
            .unwrap();
        assert_eq!(
            ops(&code),
            vec![
                (OpCode::LoadFast, 0),
                (OpCode::PopJumpIfFalse, 8),
                (OpCode::LoadConst, 0),
                (OpCode::PrintExpr, 0),
                (OpCode::LoadConst, 1),
                (OpCode::ReturnValue, 0),
            ]
        );
        let starts: Vec<(usize, u32)> = code
            .line_starts()
            .unwrap()
            .iter()
            .map(|brk| (brk.offset.0, brk.line))
            .collect();
        assert_eq!(starts, vec![(0, 1), (4, 2)]);
    }
}
