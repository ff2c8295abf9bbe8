use crate::bytecode::OpCode;
use crate::code::BlockId;
use crate::util::Offset;

/// Errors that abort assembly (or optimization) of a whole code unit.
///
/// Every variant indicates that the producer handed over an instruction stream that breaks the
/// assembler's contract. None of them are recoverable: no partially built code object escapes.
#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// The opcode has no entry in the stack effect table being used
    MissingStackEffect(OpCode),

    /// Some control path pops more values than it pushed
    NegativeStackDepth {
        block: BlockId,
        opcode: OpCode,
        depth: i64,
    },

    /// A loop pushes more values than it pops, so the stack grows without bound
    UnboundedStackGrowth { block: BlockId, depth: i64 },

    /// Operand does not fit in the widest supported encoding (4 bytes)
    OperandOverflow { opcode: OpCode, operand: u64 },

    /// Jump operand widths did not stabilize (indicates a bug)
    JumpResolutionDiverged { iterations: usize },

    /// A jump targets a block which was never placed in the instruction stream
    UnplacedBlock(BlockId),

    /// Relative jumps only go forward
    BackwardRelativeJump {
        opcode: OpCode,
        from: Offset,
        to: Offset,
    },

    /// A block does not end in a control transfer but also doesn't fall through to the block
    /// placed right after it
    BrokenFallthrough {
        block: BlockId,
        expected: Option<BlockId>,
        placed_next: Option<BlockId>,
    },

    /// Execution can run past the last instruction
    FallsOffEnd(BlockId),

    /// Name is neither a cell nor a free variable of the unit
    UnknownDerefVariable(String),

    /// Byte stream handed to the optimizer cannot be decoded
    MalformedBytecode { offset: Offset, reason: &'static str },

    /// Position table handed to the optimizer cannot be decoded
    MalformedLineTable { offset: usize },

    /// Position break points must be given in increasing offset order
    NonMonotonicLineBreak { previous: Offset, next: Offset },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
