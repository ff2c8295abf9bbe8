use super::OpCode;
use crate::Error;

/// Net effect of one opcode on the depth of the operand stack
#[derive(Copy, Clone)]
pub enum StackEffect {
    /// Same effect whatever the operand and whether or not the jump is taken
    Fixed(i32),

    /// Jump with different effects depending on whether the jump is taken
    Branching { fallthrough: i32, taken: i32 },

    /// Effect computed from the operand and from whether the jump is taken
    Computed(fn(u32, bool) -> i32),
}

impl StackEffect {
    pub fn apply(&self, arg: u32, jump: bool) -> i32 {
        match *self {
            StackEffect::Fixed(delta) => delta,
            StackEffect::Branching { fallthrough, taken } => {
                if jump {
                    taken
                } else {
                    fallthrough
                }
            }
            StackEffect::Computed(compute) => compute(arg, jump),
        }
    }
}

impl std::fmt::Debug for StackEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackEffect::Fixed(delta) => write!(f, "Fixed({})", delta),
            StackEffect::Branching { fallthrough, taken } => {
                write!(f, "Branching({}, {})", fallthrough, taken)
            }
            StackEffect::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// Frozen lookup from opcode to stack effect
///
/// Tables are built once per instruction set variant (see [`StackEffectTableBuilder`]) and then
/// only ever read: the assembler and optimizer take them by shared reference.
#[derive(Clone)]
pub struct StackEffectTable {
    effects: [Option<StackEffect>; 256],
}

impl StackEffectTable {
    /// Net stack effect of an instruction
    ///
    /// For jumps, `jump` selects between the effect when the jump is taken and the effect when
    /// execution falls through. For non-jumps it is ignored.
    pub fn effect(&self, opcode: OpCode, arg: u32, jump: bool) -> Result<i32, Error> {
        match &self.effects[opcode as usize] {
            Some(effect) => Ok(effect.apply(arg, jump)),
            None => Err(Error::MissingStackEffect(opcode)),
        }
    }

    pub fn contains(&self, opcode: OpCode) -> bool {
        self.effects[opcode as usize].is_some()
    }

    /// Stack effects of the base instruction set
    pub fn base() -> StackEffectTable {
        use OpCode::*;
        use StackEffect::*;

        let mut builder = StackEffectTableBuilder::new();
        builder
            .set_all(&[Nop, RotTwo, RotThree], Fixed(0))
            .set(PopTop, Fixed(-1))
            .set(DupTop, Fixed(1))
            .set(DupTopTwo, Fixed(2))
            .set_all(
                &[UnaryPositive, UnaryNegative, UnaryNot, UnaryInvert, GetIter],
                Fixed(0),
            )
            .set_all(
                &[
                    BinaryPower,
                    BinaryMultiply,
                    BinaryModulo,
                    BinaryAdd,
                    BinarySubtract,
                    BinarySubscr,
                    BinaryFloorDivide,
                    BinaryTrueDivide,
                    BinaryLshift,
                    BinaryRshift,
                    BinaryAnd,
                    BinaryXor,
                    BinaryOr,
                ],
                Fixed(-1),
            )
            .set(StoreSubscr, Fixed(-3))
            .set(DeleteSubscr, Fixed(-2))
            .set(PrintExpr, Fixed(-1))
            .set(LoadBuildClass, Fixed(1))
            .set(ReturnValue, Fixed(-1))
            .set(YieldValue, Fixed(0))
            .set(PopBlock, Fixed(0))
            .set(PopExcept, Fixed(-3))
            // Exception handlers and `finally` blocks are entered with 6 extra values pushed
            .set(BeginFinally, Fixed(6))
            .set(EndFinally, Fixed(-6))
            .set_all(&[StoreName, StoreGlobal, StoreFast, StoreDeref], Fixed(-1))
            .set_all(
                &[DeleteName, DeleteGlobal, DeleteFast, DeleteDeref],
                Fixed(0),
            )
            .set(UnpackSequence, Computed(|n, _| n as i32 - 1))
            .set(
                ForIter,
                Branching {
                    fallthrough: 1,
                    taken: -1,
                },
            )
            .set(StoreAttr, Fixed(-2))
            .set(DeleteAttr, Fixed(-1))
            .set_all(
                &[
                    LoadConst,
                    LoadName,
                    LoadGlobal,
                    LoadFast,
                    LoadClosure,
                    LoadDeref,
                ],
                Fixed(1),
            )
            .set(LoadAttr, Fixed(0))
            .set_all(
                &[BuildTuple, BuildList, BuildSet],
                Computed(|n, _| 1 - n as i32),
            )
            .set(BuildMap, Computed(|n, _| 1 - 2 * n as i32))
            .set(BuildConstKeyMap, Computed(|n, _| -(n as i32)))
            .set(CompareOp, Fixed(-1))
            .set(ImportName, Fixed(-1))
            .set(ImportFrom, Fixed(1))
            .set_all(&[JumpForward, JumpAbsolute], Fixed(0))
            .set_all(
                &[JumpIfFalseOrPop, JumpIfTrueOrPop],
                Branching {
                    fallthrough: -1,
                    taken: 0,
                },
            )
            .set_all(&[PopJumpIfFalse, PopJumpIfTrue], Fixed(-1))
            .set(
                SetupFinally,
                Branching {
                    fallthrough: 0,
                    taken: 6,
                },
            )
            .set(
                SetupWith,
                Branching {
                    fallthrough: 1,
                    taken: 6,
                },
            )
            .set(RaiseVarargs, Computed(|n, _| -(n as i32)))
            .set(CallFunction, Computed(|n, _| -(n as i32)))
            .set(CallFunctionKw, Computed(|n, _| -(n as i32) - 1))
            .set(
                MakeFunction,
                Computed(|flags, _| -1 - (flags & 0x0f).count_ones() as i32),
            )
            .set(
                BuildSlice,
                Computed(|n, _| if n == 3 { -2 } else { -1 }),
            );
        builder.build()
    }

    /// Base stack effects, extended with the method call opcodes
    pub fn with_method_calls() -> StackEffectTable {
        let mut builder = StackEffectTableBuilder::from_table(&StackEffectTable::base());
        builder
            .set(OpCode::LoadMethod, StackEffect::Fixed(1))
            .set(
                OpCode::CallMethod,
                StackEffect::Computed(|n, _| -(n as i32) - 1),
            );
        builder.build()
    }
}

impl std::fmt::Debug for StackEffectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                OpCode::ALL
                    .iter()
                    .filter_map(|op| self.effects[*op as usize].map(|effect| (op, effect))),
            )
            .finish()
    }
}

/// Builder for [`StackEffectTable`]
pub struct StackEffectTableBuilder {
    effects: [Option<StackEffect>; 256],
}

impl StackEffectTableBuilder {
    /// Builder starting from an empty table
    pub fn new() -> StackEffectTableBuilder {
        StackEffectTableBuilder {
            effects: [None; 256],
        }
    }

    /// Builder starting from a copy of an existing table
    pub fn from_table(table: &StackEffectTable) -> StackEffectTableBuilder {
        StackEffectTableBuilder {
            effects: table.effects,
        }
    }

    pub fn set(&mut self, opcode: OpCode, effect: StackEffect) -> &mut Self {
        self.effects[opcode as usize] = Some(effect);
        self
    }

    pub fn set_all(&mut self, opcodes: &[OpCode], effect: StackEffect) -> &mut Self {
        for opcode in opcodes {
            self.set(*opcode, effect);
        }
        self
    }

    pub fn remove(&mut self, opcode: OpCode) -> &mut Self {
        self.effects[opcode as usize] = None;
        self
    }

    pub fn build(&self) -> StackEffectTable {
        StackEffectTable {
            effects: self.effects,
        }
    }
}

impl Default for StackEffectTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}
