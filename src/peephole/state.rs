use crate::bytecode::{
    instr_size, write_instruction, CodeUnit, JumpKind, OpCode, CODE_UNIT, MAX_INSTRUCTION_UNITS,
};
use crate::code::ConstantPool;
use crate::settings::FoldLimits;
use crate::util::Offset;
use crate::Error;

/// `LOAD_CONST` (or folded run of instructions ending in a `LOAD_CONST`) whose value is known
#[derive(Copy, Clone, Debug)]
pub(crate) struct ConstSlot {
    /// First unit of the run
    pub start: usize,

    /// Unit of the `LOAD_CONST` opcode
    pub end: usize,

    /// Constant pool index
    pub index: usize,
}

/// Working state of one optimizer pass
pub(crate) struct OptimizerState<'a> {
    /// Instruction stream being rewritten in place
    pub units: Vec<CodeUnit>,

    /// Basic block number of every unit (incremented at every jump target)
    pub blocks: Vec<usize>,

    /// Existing constants keep their indices, folded ones are appended
    pub constants: ConstantPool,

    /// Constants pushed by the run of instructions right before the cursor
    pub const_stack: Vec<ConstSlot>,

    pub limits: &'a FoldLimits,

    /// Number of rewrites done
    pub replacements: usize,
}

impl<'a> OptimizerState<'a> {
    pub fn new(
        units: Vec<CodeUnit>,
        constants: ConstantPool,
        limits: &'a FoldLimits,
    ) -> Result<OptimizerState<'a>, Error> {
        let mut state = OptimizerState {
            units,
            blocks: vec![],
            constants,
            const_stack: vec![],
            limits,
            replacements: 0,
        };
        state.blocks = state.mark_blocks()?;
        Ok(state)
    }

    /// Partition the units into basic blocks: the block number goes up by one at every unit that
    /// some jump targets
    fn mark_blocks(&self) -> Result<Vec<usize>, Error> {
        let len = self.units.len();
        let mut is_target = vec![false; len];
        for i in 0..len {
            if self.units[i].op == OpCode::ExtendedArg || !self.units[i].op.is_jump() {
                continue;
            }
            let offset = Offset(self.op_start(i) * CODE_UNIT);
            let arg = self.get_arg(i) as usize;
            if arg % CODE_UNIT != 0 {
                return Err(Error::MalformedBytecode {
                    offset,
                    reason: "jump into the middle of a code unit",
                });
            }
            match self.jump_target(i) {
                Some(target) if target < len => is_target[target] = true,
                _ => {
                    return Err(Error::MalformedBytecode {
                        offset,
                        reason: "jump past the end of the code",
                    })
                }
            }
        }

        let mut block = 0;
        Ok(is_target
            .into_iter()
            .map(|target| {
                if target {
                    block += 1;
                }
                block
            })
            .collect())
    }

    /// Operand of the instruction whose opcode is at `i`, including the bytes from prefixes
    pub fn get_arg(&self, i: usize) -> u32 {
        let mut arg = self.units[i].arg as u32;
        for k in 1..MAX_INSTRUCTION_UNITS {
            if i < k || self.units[i - k].op != OpCode::ExtendedArg {
                break;
            }
            arg |= (self.units[i - k].arg as u32) << (8 * k);
        }
        arg
    }

    /// First unit (including prefixes) of the instruction whose opcode is at `i`
    pub fn op_start(&self, i: usize) -> usize {
        let mut start = i;
        while start >= 1 && i - start < MAX_INSTRUCTION_UNITS - 1 {
            if self.units[start - 1].op != OpCode::ExtendedArg {
                break;
            }
            start -= 1;
        }
        start
    }

    /// Opcode unit of the instruction starting at unit `i`
    pub fn find_op(&self, mut i: usize) -> usize {
        while i + 1 < self.units.len() && self.units[i].op == OpCode::ExtendedArg {
            i += 1;
        }
        i
    }

    /// Opcode unit of the next instruction that isn't a `NOP`
    pub fn next_op(&self, i: usize) -> Option<usize> {
        (i + 1..self.units.len())
            .find(|j| !matches!(self.units[*j].op, OpCode::Nop | OpCode::ExtendedArg))
    }

    pub fn same_block(&self, first: usize, last: usize) -> bool {
        self.blocks[first] == self.blocks[last]
    }

    /// Unit targeted by the jump whose opcode is at `i`
    pub fn jump_target(&self, i: usize) -> Option<usize> {
        let arg = self.get_arg(i) as usize / CODE_UNIT;
        match self.units[i].op.jump_kind() {
            JumpKind::None => None,
            JumpKind::Relative => Some(i + 1 + arg),
            JumpKind::Absolute => Some(arg),
        }
    }

    /// Operand that makes a jump whose opcode is at `i` land on unit `target`
    ///
    /// Returns `None` for relative jumps that would need to go backwards.
    pub fn jump_arg(&self, i: usize, opcode: OpCode, target: usize) -> Option<u32> {
        let distance = match opcode.jump_kind() {
            JumpKind::Absolute => target,
            JumpKind::Relative => target.checked_sub(i + 1)?,
            JumpKind::None => return None,
        };
        u32::try_from(distance * CODE_UNIT).ok()
    }

    pub fn fill_nops(&mut self, start: usize, end: usize) {
        for unit in &mut self.units[start..end] {
            *unit = CodeUnit::nop();
        }
    }

    /// Overwrite the units `start..end` with one instruction (placed at the end) and `NOP`s
    ///
    /// Returns `false` without touching anything if the operand doesn't fit in the span.
    pub fn write_op_arg(&mut self, start: usize, end: usize, opcode: OpCode, arg: u32) -> bool {
        let needed = instr_size(arg);
        if needed > end - start {
            return false;
        }
        let mut instruction = Vec::with_capacity(needed);
        write_instruction(&mut instruction, opcode, arg, needed);
        self.fill_nops(start, end - needed);
        self.units[end - needed..end].copy_from_slice(&instruction);
        true
    }

    /// Record a rewrite
    pub fn replaced(&mut self, what: &str, at: usize) {
        log::trace!("peephole: {} at offset {}", what, at * CODE_UNIT);
        self.replacements += 1;
    }
}
