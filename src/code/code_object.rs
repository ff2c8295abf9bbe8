use crate::bytecode::{decode_instructions, DecodedInstruction};
use crate::code::{line_table, Constant, LineBreak};
use crate::Error;
use bitflags::bitflags;

bitflags! {
    /// Flags on code objects
    pub struct CodeFlags: u32 {
        /// Locals are accessed through fast slots
        const OPTIMIZED = 0x0001;

        /// A fresh local namespace is created on every invocation
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const NESTED = 0x0010;
        const GENERATOR = 0x0020;

        /// No cell or free variables
        const NOFREE = 0x0040;
    }
}

/// Header information about a code unit, decided by the producer
#[derive(Clone, Debug)]
pub struct CodeMetadata {
    /// Name of the unit (function name, `<module>`, ...)
    pub name: String,

    /// Identifier of the declaring unit, usually a file name
    pub filename: String,
    pub first_line: u32,
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub flags: CodeFlags,
}

impl CodeMetadata {
    pub fn new(name: &str, filename: &str, first_line: u32) -> CodeMetadata {
        CodeMetadata {
            name: name.to_owned(),
            filename: filename.to_owned(),
            first_line,
            argcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::empty(),
        }
    }
}

/// Variables of a code unit, as classified by the symbol table
#[derive(Clone, Debug, Default)]
pub struct Variables {
    /// Local variables, starting with the arguments
    pub varnames: Vec<String>,

    /// Locals captured by nested units
    pub cellvars: Vec<String>,

    /// Variables captured from enclosing units
    pub freevars: Vec<String>,
}

/// Final assembled code unit
///
/// The fields are public for inspection. Nothing in the crate changes a code object after
/// assembly, and the optimizer returns a new one instead.
#[derive(Clone, Debug)]
pub struct CodeObject {
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub filename: String,
    pub name: String,
    pub first_line: u32,

    /// Encoded position table (see [`line_table`])
    pub line_table: Vec<u8>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
}

impl CodeObject {
    /// Bundle together the pieces of an assembled unit
    pub fn assemble(
        metadata: CodeMetadata,
        variables: Variables,
        names: Vec<String>,
        constants: Vec<Constant>,
        code: Vec<u8>,
        stacksize: u32,
        line_table: Vec<u8>,
    ) -> CodeObject {
        let mut flags = metadata.flags;
        if variables.cellvars.is_empty() && variables.freevars.is_empty() {
            flags |= CodeFlags::NOFREE;
        }

        CodeObject {
            argcount: metadata.argcount,
            kwonlyargcount: metadata.kwonlyargcount,
            nlocals: variables.varnames.len() as u32,
            stacksize,
            flags,
            code,
            constants,
            names,
            varnames: variables.varnames,
            filename: metadata.filename,
            name: metadata.name,
            first_line: metadata.first_line,
            line_table,
            freevars: variables.freevars,
            cellvars: variables.cellvars,
        }
    }

    /// Decode the instruction stream
    pub fn instructions(&self) -> Result<Vec<DecodedInstruction>, Error> {
        decode_instructions(&self.code)
    }

    /// Decode the position table
    pub fn line_starts(&self) -> Result<Vec<LineBreak>, Error> {
        line_table::decode(&self.line_table, self.first_line)
    }

    /// Name referred to by a `Deref` operand (cell variables come before free variables)
    pub fn deref_name(&self, index: usize) -> Option<&str> {
        self.cellvars
            .iter()
            .chain(self.freevars.iter())
            .nth(index)
            .map(String::as_str)
    }
}
