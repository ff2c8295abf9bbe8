/// Opcodes numbered at or above this take an operand
pub const HAVE_ARGUMENT: u8 = 90;

macro_rules! opcodes {
    ($( $name:ident = $value:literal, )*) => {
        /// Operation codes of the virtual machine
        ///
        /// The discriminant is the byte written into the instruction stream.
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        #[repr(u8)]
        pub enum OpCode {
            $( $name = $value, )*
        }

        impl OpCode {
            /// Every opcode, in increasing numeric order
            pub const ALL: &'static [OpCode] = &[$( OpCode::$name, )*];
        }

        impl TryFrom<u8> for OpCode {
            type Error = u8;

            fn try_from(byte: u8) -> Result<OpCode, u8> {
                match byte {
                    $( $value => Ok(OpCode::$name), )*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    DupTopTwo = 5,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    BeginFinally = 53,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    GetIter = 68,
    PrintExpr = 70,
    LoadBuildClass = 71,
    ReturnValue = 83,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    PopExcept = 89,
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildSet = 104,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    DeleteDeref = 138,
    CallFunctionKw = 141,
    SetupWith = 143,
    ExtendedArg = 144,
    BuildConstKeyMap = 156,
    LoadMethod = 160,
    CallMethod = 161,
}

/// How the operand of an instruction is interpreted when it transfers control
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum JumpKind {
    /// The instruction never jumps
    None,

    /// Operand is a forward distance in bytes from the end of the instruction
    Relative,

    /// Operand is a byte offset from the start of the code
    Absolute,
}

impl OpCode {
    /// Does the operand byte carry meaning?
    pub fn has_argument(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    pub fn jump_kind(self) -> JumpKind {
        match self {
            OpCode::JumpForward | OpCode::ForIter | OpCode::SetupFinally | OpCode::SetupWith => {
                JumpKind::Relative
            }
            OpCode::JumpIfFalseOrPop
            | OpCode::JumpIfTrueOrPop
            | OpCode::JumpAbsolute
            | OpCode::PopJumpIfFalse
            | OpCode::PopJumpIfTrue => JumpKind::Absolute,
            _ => JumpKind::None,
        }
    }

    pub fn is_jump(self) -> bool {
        self.jump_kind() != JumpKind::None
    }

    /// Jumps which are always taken
    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, OpCode::JumpForward | OpCode::JumpAbsolute)
    }

    /// Instructions after which control never falls through to the next instruction
    pub fn is_unconditional_transfer(self) -> bool {
        self.is_unconditional_jump() || matches!(self, OpCode::ReturnValue | OpCode::RaiseVarargs)
    }

    /// Jumps taken depending on the truthiness of the top of the stack
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            OpCode::PopJumpIfFalse
                | OpCode::PopJumpIfTrue
                | OpCode::JumpIfFalseOrPop
                | OpCode::JumpIfTrueOrPop
        )
    }

    /// For conditional jumps: is the jump taken when the value is truthy?
    pub fn jumps_on_true(self) -> bool {
        matches!(self, OpCode::PopJumpIfTrue | OpCode::JumpIfTrueOrPop)
    }
}

/// Operand of [`OpCode::CompareOp`]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Comparison {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExceptionMatch = 10,
}

impl Comparison {
    pub fn from_operand(operand: u32) -> Option<Comparison> {
        let comparison = match operand {
            0 => Comparison::Lt,
            1 => Comparison::Le,
            2 => Comparison::Eq,
            3 => Comparison::Ne,
            4 => Comparison::Gt,
            5 => Comparison::Ge,
            6 => Comparison::In,
            7 => Comparison::NotIn,
            8 => Comparison::Is,
            9 => Comparison::IsNot,
            10 => Comparison::ExceptionMatch,
            _ => return None,
        };
        Some(comparison)
    }

    pub fn operand(self) -> u32 {
        self as u32
    }

    /// Comparison whose result is always the negation of this one.
    ///
    /// Only membership and identity tests qualify: rich comparisons such as `==` and `!=` can be
    /// overloaded independently, so `not (a == b)` is not necessarily `a != b`.
    pub fn inverse(self) -> Option<Comparison> {
        match self {
            Comparison::In => Some(Comparison::NotIn),
            Comparison::NotIn => Some(Comparison::In),
            Comparison::Is => Some(Comparison::IsNot),
            Comparison::IsNot => Some(Comparison::Is),
            _ => None,
        }
    }

    /// Is this a membership test (`in` / `not in`)?
    pub fn is_membership(self) -> bool {
        matches!(self, Comparison::In | Comparison::NotIn)
    }
}
