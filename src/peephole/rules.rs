//! Rewrite rules, keyed on the opcode under the cursor
//!
//! Rules only ever match the instruction under the cursor together with the instructions right
//! around it (skipping `NOP`s), and only when all of them are in the same basic block: fusing
//! instructions across a jump target would change what the other path into the block sees.
//!
//! Rules never grow the code. When the new operand doesn't fit in the units being replaced, the
//! rule declines.

use super::fold;
use super::state::{ConstSlot, OptimizerState};
use crate::bytecode::{Comparison, OpCode, CODE_UNIT};
use crate::code::Constant;

/// Longest chain of unconditional jumps followed when retargeting a jump
const MAX_JUMP_CHAIN: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Outcome {
    /// Nothing changed
    Declined,

    /// Instructions were rewritten
    Rewritten,

    /// Instructions were replaced by a `LOAD_CONST` of a known value (now on the constant stack)
    Folded,
}

/// Try to rewrite the instruction whose opcode is at unit `i`
pub(crate) fn apply(state: &mut OptimizerState, i: usize) -> Outcome {
    let opcode = state.units[i].op;
    match opcode {
        OpCode::LoadConst => load_const(state, i),
        OpCode::UnaryNot => unary_not(state, i),
        OpCode::CompareOp => compare_op(state, i),
        OpCode::BuildTuple | OpCode::BuildList | OpCode::BuildSet => build_sequence(state, i),
        OpCode::UnaryNegative | OpCode::UnaryPositive | OpCode::UnaryInvert => {
            fold_unary(state, i)
        }
        OpCode::JumpIfFalseOrPop | OpCode::JumpIfTrueOrPop => conditional_or_pop(state, i),
        OpCode::PopJumpIfFalse
        | OpCode::PopJumpIfTrue
        | OpCode::JumpAbsolute
        | OpCode::JumpForward => jump_chain(state, i),
        _ if fold::is_foldable_binary(opcode) => fold_binary(state, i),
        _ => Outcome::Declined,
    }
}

/// Turn code following an unconditional transfer at unit `i` into `NOP`s, up to the end of the
/// basic block
pub(crate) fn remove_dead_code(state: &mut OptimizerState, i: usize) {
    let mut end = i + 1;
    while end < state.units.len() && state.same_block(i, end) {
        end += 1;
    }
    if state.units[i + 1..end]
        .iter()
        .any(|unit| unit.op != OpCode::Nop)
    {
        state.fill_nops(i + 1, end);
        state.replaced("dead code", i + 1);
    }
}

/// `LOAD_CONST c; POP_JUMP_IF_*` where the truthiness of `c` decides the jump
fn load_const(state: &mut OptimizerState, i: usize) -> Outcome {
    let start = state.op_start(i);
    let index = state.get_arg(i) as usize;
    let slot = ConstSlot {
        start,
        end: i,
        index,
    };

    let next = match state.next_op(i) {
        Some(next) if state.same_block(start, next) => next,
        _ => {
            state.const_stack.push(slot);
            return Outcome::Declined;
        }
    };
    let jump = state.units[next].op;
    let truthy = match state.constants.get(index) {
        Some(constant) if matches!(jump, OpCode::PopJumpIfFalse | OpCode::PopJumpIfTrue) => {
            constant.is_truthy()
        }
        _ => {
            state.const_stack.push(slot);
            return Outcome::Declined;
        }
    };

    if truthy == jump.jumps_on_true() {
        let target = state.get_arg(next);
        if !state.write_op_arg(start, next + 1, OpCode::JumpAbsolute, target) {
            state.const_stack.push(slot);
            return Outcome::Declined;
        }
        state.replaced("constant condition (always jumps)", start);
    } else {
        state.fill_nops(start, next + 1);
        state.replaced("constant condition (never jumps)", start);
    }
    Outcome::Rewritten
}

/// `UNARY_NOT; POP_JUMP_IF_FALSE` is `POP_JUMP_IF_TRUE` (and vice versa)
fn unary_not(state: &mut OptimizerState, i: usize) -> Outcome {
    let start = state.op_start(i);
    let next = match state.next_op(i) {
        Some(next) if state.same_block(start, next) => next,
        _ => return Outcome::Declined,
    };
    let flipped = match state.units[next].op {
        OpCode::PopJumpIfFalse => OpCode::PopJumpIfTrue,
        OpCode::PopJumpIfTrue => OpCode::PopJumpIfFalse,
        _ => return Outcome::Declined,
    };
    state.fill_nops(start, i + 1);
    state.units[next].op = flipped;
    state.replaced("negated condition", start);
    Outcome::Rewritten
}

/// `COMPARE_OP c; UNARY_NOT` is `COMPARE_OP (not c)` for comparisons with an exact inverse
fn compare_op(state: &mut OptimizerState, i: usize) -> Outcome {
    let start = state.op_start(i);
    let next = match state.next_op(i) {
        Some(next) if state.same_block(start, next) && state.units[next].op == OpCode::UnaryNot => {
            next
        }
        _ => return Outcome::Declined,
    };
    let inverse = match Comparison::from_operand(state.get_arg(i)).and_then(Comparison::inverse) {
        Some(inverse) => inverse,
        None => return Outcome::Declined,
    };
    if !state.write_op_arg(start, i + 1, OpCode::CompareOp, inverse.operand()) {
        return Outcome::Declined;
    }
    let next_start = state.op_start(next);
    state.fill_nops(next_start, next + 1);
    state.replaced("negated comparison", start);
    Outcome::Rewritten
}

/// Sequence building instructions:
///
///   - tuples of constants are folded into constants
///   - lists and sets of constants only used for a membership test are folded into a constant
///     tuple or frozen set
///   - building a small sequence just to unpack it is a stack rotation
fn build_sequence(state: &mut OptimizerState, i: usize) -> Outcome {
    let opcode = state.units[i].op;
    let count = state.get_arg(i) as usize;
    let start = state.op_start(i);

    if count > 0 && count <= state.const_stack.len() {
        let first = state.const_stack[state.const_stack.len() - count];
        if state.same_block(first.start, i) {
            let membership_test = match state.next_op(i) {
                Some(next) if state.same_block(start, next) => {
                    state.units[next].op == OpCode::CompareOp
                        && Comparison::from_operand(state.get_arg(next))
                            .map_or(false, Comparison::is_membership)
                }
                _ => false,
            };
            let elems = || -> Option<Vec<Constant>> {
                state.const_stack[state.const_stack.len() - count..]
                    .iter()
                    .map(|slot| state.constants.get(slot.index).cloned())
                    .collect()
            };
            let folded = match opcode {
                OpCode::BuildTuple => elems().map(Constant::Tuple),
                OpCode::BuildList if membership_test => elems().map(Constant::Tuple),
                OpCode::BuildSet if membership_test => elems().map(Constant::frozenset),
                _ => None,
            };
            if let Some(constant) = folded {
                if replace_with_constant(state, first.start, i, constant, count) {
                    return Outcome::Folded;
                }
            }
        }
    }

    if !matches!(opcode, OpCode::BuildTuple | OpCode::BuildList) || !(1..=3).contains(&count) {
        return Outcome::Declined;
    }
    let next = match state.next_op(i) {
        Some(next)
            if state.same_block(start, next)
                && state.units[next].op == OpCode::UnpackSequence
                && state.get_arg(next) as usize == count =>
        {
            next
        }
        _ => return Outcome::Declined,
    };
    match count {
        1 => state.fill_nops(start, next + 1),
        2 => {
            state.units[start].op = OpCode::RotTwo;
            state.units[start].arg = 0;
            state.fill_nops(start + 1, next + 1);
        }
        _ => {
            state.units[start].op = OpCode::RotThree;
            state.units[start].arg = 0;
            state.units[start + 1].op = OpCode::RotTwo;
            state.units[start + 1].arg = 0;
            state.fill_nops(start + 2, next + 1);
        }
    }
    state.replaced("build and unpack", start);
    Outcome::Rewritten
}

fn fold_unary(state: &mut OptimizerState, i: usize) -> Outcome {
    let operand = match state.const_stack.last() {
        Some(slot) if state.same_block(slot.start, i) => *slot,
        _ => return Outcome::Declined,
    };
    let folded = state
        .constants
        .get(operand.index)
        .and_then(|constant| fold::unary(state.units[i].op, constant));
    if let Some(constant) = folded {
        if replace_with_constant(state, operand.start, i, constant, 1) {
            return Outcome::Folded;
        }
    }
    Outcome::Declined
}

fn fold_binary(state: &mut OptimizerState, i: usize) -> Outcome {
    let len = state.const_stack.len();
    if len < 2 {
        return Outcome::Declined;
    }
    let (lhs, rhs) = (state.const_stack[len - 2], state.const_stack[len - 1]);
    if !state.same_block(lhs.start, i) {
        return Outcome::Declined;
    }
    let folded = match (state.constants.get(lhs.index), state.constants.get(rhs.index)) {
        (Some(lhs), Some(rhs)) => fold::binary(state.units[i].op, lhs, rhs, state.limits),
        _ => None,
    };
    if let Some(constant) = folded {
        if replace_with_constant(state, lhs.start, i, constant, 2) {
            return Outcome::Folded;
        }
    }
    Outcome::Declined
}

/// Replace units `start..=end` with a `LOAD_CONST` of `constant`, which consumes the top
/// `consumed` entries of the constant stack
fn replace_with_constant(
    state: &mut OptimizerState,
    start: usize,
    end: usize,
    constant: Constant,
    consumed: usize,
) -> bool {
    let index = state
        .constants
        .index_of(&constant)
        .unwrap_or(state.constants.len());
    let operand = match u32::try_from(index) {
        Ok(operand) => operand,
        Err(_) => return false,
    };
    if !state.write_op_arg(start, end + 1, OpCode::LoadConst, operand) {
        return false;
    }
    state.constants.get_or_insert(constant);

    let remaining = state.const_stack.len() - consumed;
    state.const_stack.truncate(remaining);
    state.const_stack.push(ConstSlot { start, end, index });
    state.replaced("constant fold", start);
    true
}

/// `JUMP_IF_*_OR_POP` to another conditional jump
///
///   - if the second jump tests the same way, it is taken whenever the first one is, so the first
///     jump might as well do what the second does
///   - otherwise, the second jump is never taken after the first one is (and pops the value), so
///     the first jump can pop the value itself and land right after the second jump
fn conditional_or_pop(state: &mut OptimizerState, i: usize) -> Outcome {
    let opcode = state.units[i].op;
    let start = state.op_start(i);
    let target = match state.jump_target(i) {
        Some(target) => state.find_op(target),
        None => return Outcome::Declined,
    };
    let target_op = state.units[target].op;

    if target_op.is_conditional_jump() {
        let (new_op, new_arg) = if target_op.jumps_on_true() == opcode.jumps_on_true() {
            (target_op, state.get_arg(target))
        } else {
            let popping = if opcode.jumps_on_true() {
                OpCode::PopJumpIfTrue
            } else {
                OpCode::PopJumpIfFalse
            };
            (popping, ((target + 1) * CODE_UNIT) as u32)
        };
        if (new_op, new_arg) != (opcode, state.get_arg(i))
            && state.write_op_arg(start, i + 1, new_op, new_arg)
        {
            state.replaced("threaded conditional jump", start);
            return Outcome::Rewritten;
        }
    }

    jump_chain(state, i)
}

/// Jumps to unconditional jumps go straight to the final destination, and unconditional jumps to
/// a return are just returns
fn jump_chain(state: &mut OptimizerState, i: usize) -> Outcome {
    let opcode = state.units[i].op;
    let start = state.op_start(i);
    let original = match state.jump_target(i) {
        Some(target) => target,
        None => return Outcome::Declined,
    };

    let landing = state.find_op(original);
    if opcode.is_unconditional_jump() && state.units[landing].op == OpCode::ReturnValue {
        state.write_op_arg(start, i + 1, OpCode::ReturnValue, 0);
        state.replaced("jump to return", start);
        return Outcome::Rewritten;
    }

    // Follow the chain, stopping on cycles
    let mut destination = original;
    let mut visited: Vec<usize> = vec![];
    while visited.len() < MAX_JUMP_CHAIN {
        let hop = state.find_op(destination);
        if !state.units[hop].op.is_unconditional_jump() || visited.contains(&hop) {
            break;
        }
        visited.push(hop);
        destination = match state.jump_target(hop) {
            Some(next) => next,
            None => break,
        };
    }
    if destination == original {
        return Outcome::Declined;
    }

    // Relative jumps only go forward, but an unconditional one can become absolute
    let (new_op, new_arg) = match state.jump_arg(i, opcode, destination) {
        Some(arg) => (opcode, arg),
        None if opcode == OpCode::JumpForward => {
            match state.jump_arg(i, OpCode::JumpAbsolute, destination) {
                Some(arg) => (OpCode::JumpAbsolute, arg),
                None => return Outcome::Declined,
            }
        }
        None => return Outcome::Declined,
    };
    if !state.write_op_arg(start, i + 1, new_op, new_arg) {
        return Outcome::Declined;
    }
    state.replaced("jump chain", start);
    Outcome::Rewritten
}
