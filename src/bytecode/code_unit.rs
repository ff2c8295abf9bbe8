use super::{JumpKind, OpCode, Serialize};
use crate::util::{Offset, Width};
use crate::Error;
use byteorder::WriteBytesExt;

/// Size of a code unit in bytes
pub const CODE_UNIT: usize = 2;

/// Most code units a single instruction can take up (3 prefixes + the instruction itself)
pub const MAX_INSTRUCTION_UNITS: usize = 4;

/// One fixed-size slot of the instruction stream
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CodeUnit {
    pub op: OpCode,
    pub arg: u8,
}

impl CodeUnit {
    pub fn new(op: OpCode, arg: u8) -> CodeUnit {
        CodeUnit { op, arg }
    }

    pub fn nop() -> CodeUnit {
        CodeUnit::new(OpCode::Nop, 0)
    }
}

impl Width for CodeUnit {
    fn width(&self) -> usize {
        CODE_UNIT
    }
}

impl Serialize for CodeUnit {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.op as u8).serialize(writer)?;
        self.arg.serialize(writer)
    }
}

/// Number of code units needed to encode an instruction with the given operand
pub fn instr_size(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

/// Convert an index or offset into an operand, failing if it would need more than 4 bytes
pub fn to_operand(opcode: OpCode, value: usize) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::OperandOverflow {
        opcode,
        operand: value as u64,
    })
}

/// Write an instruction that takes up exactly `units` code units
///
/// Extra leading prefixes beyond what the operand needs carry zero bytes, which leaves the decoded
/// operand unchanged. This is what lets jumps keep a width picked in an earlier iteration.
pub fn write_instruction(out: &mut Vec<CodeUnit>, op: OpCode, arg: u32, units: usize) {
    debug_assert!(units <= MAX_INSTRUCTION_UNITS);
    debug_assert!(instr_size(arg) <= units, "{:?} {} in {} units", op, arg, units);
    for i in (1..units).rev() {
        let byte = if i < 4 { (arg >> (8 * i)) as u8 } else { 0 };
        out.push(CodeUnit::new(OpCode::ExtendedArg, byte));
    }
    out.push(CodeUnit::new(op, arg as u8));
}

/// Split a byte stream into code units, checking that every opcode is known
pub fn decode_units(bytes: &[u8]) -> Result<Vec<CodeUnit>, Error> {
    if bytes.len() % CODE_UNIT != 0 {
        return Err(Error::MalformedBytecode {
            offset: Offset(bytes.len() - bytes.len() % CODE_UNIT),
            reason: "trailing half code unit",
        });
    }
    bytes
        .chunks_exact(CODE_UNIT)
        .enumerate()
        .map(|(idx, chunk)| match OpCode::try_from(chunk[0]) {
            Ok(op) => Ok(CodeUnit::new(op, chunk[1])),
            Err(_) => Err(Error::MalformedBytecode {
                offset: Offset(idx * CODE_UNIT),
                reason: "unknown opcode",
            }),
        })
        .collect()
}

/// Fully decoded instruction, including its prefixes
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DecodedInstruction {
    /// Offset of the first prefix (or of the instruction itself if it has no prefixes)
    pub offset: Offset,
    pub opcode: OpCode,
    pub arg: u32,

    /// Code units taken up, prefixes included
    pub units: usize,
}

impl DecodedInstruction {
    /// Offset right after the instruction
    pub fn end(&self) -> Offset {
        Offset(self.offset.0 + self.units * CODE_UNIT)
    }

    /// Where the instruction jumps to, if it is a jump
    pub fn jump_target(&self) -> Option<Offset> {
        match self.opcode.jump_kind() {
            JumpKind::None => None,
            JumpKind::Relative => Some(Offset(self.end().0 + self.arg as usize)),
            JumpKind::Absolute => Some(Offset(self.arg as usize)),
        }
    }
}

impl Width for DecodedInstruction {
    fn width(&self) -> usize {
        self.units * CODE_UNIT
    }
}

/// Decode a flattened stream into instructions, folding prefixes into the operands they extend
pub fn decode_instructions(bytes: &[u8]) -> Result<Vec<DecodedInstruction>, Error> {
    let units = decode_units(bytes)?;
    let mut instructions = vec![];

    let mut start = 0;
    let mut arg: u32 = 0;
    for (idx, unit) in units.iter().enumerate() {
        arg = (arg << 8) | unit.arg as u32;
        if unit.op == OpCode::ExtendedArg {
            if idx + 1 - start >= MAX_INSTRUCTION_UNITS {
                return Err(Error::MalformedBytecode {
                    offset: Offset(start * CODE_UNIT),
                    reason: "too many operand prefixes",
                });
            }
            continue;
        }
        instructions.push(DecodedInstruction {
            offset: Offset(start * CODE_UNIT),
            opcode: unit.op,
            arg,
            units: idx + 1 - start,
        });
        start = idx + 1;
        arg = 0;
    }

    if start != units.len() {
        return Err(Error::MalformedBytecode {
            offset: Offset(start * CODE_UNIT),
            reason: "operand prefix without an instruction",
        });
    }
    Ok(instructions)
}
