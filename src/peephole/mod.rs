//! Peephole optimizer over flattened instruction streams
//!
//! The optimizer works directly on the bytes of an assembled [`CodeObject`], one pass at a time.
//! Each pass:
//!
//!   1. partitions the code units into basic blocks, starting a new block at every jump target
//!   2. scans the instructions in order, trying the rewrite rule for each opcode (see [`rules`])
//!      and turning code after unconditional control transfers into `NOP`s
//!   3. drops every `NOP`, re-targets the jumps and re-maps the line table onto the new offsets
//!
//! Rewrites happen in place: an instruction span is overwritten by an instruction of at most the
//! same width, padded with `NOP`s. So while a pass is in progress, no offset moves and the blocks
//! computed up front stay valid.
//!
//! Passes are repeated until one doesn't change anything, or until the configured number of
//! passes is reached.

mod fold;
mod rules;
mod state;

use crate::bytecode::{
    decode_instructions, decode_units, instr_size, write_instruction, CodeUnit, JumpKind, OpCode,
    Serialize, CODE_UNIT,
};
use crate::code::{CodeObject, ConstantPool, LineBreak, LineTableBuilder};
use crate::settings::FoldLimits;
use crate::util::Offset;
use crate::Error;
use rules::Outcome;
use state::OptimizerState;

pub struct PeepholeOptimizer<'a> {
    limits: &'a FoldLimits,
}

impl<'a> PeepholeOptimizer<'a> {
    pub fn new(limits: &'a FoldLimits) -> PeepholeOptimizer<'a> {
        PeepholeOptimizer { limits }
    }

    /// Run up to `passes` passes, stopping early when a pass makes no change
    pub fn optimize(&self, mut code: CodeObject, passes: usize) -> Result<CodeObject, Error> {
        for pass in 0..passes {
            match self.run_pass(&code)? {
                Some(optimized) => code = optimized,
                None => {
                    log::debug!("peephole: `{}` is stable after {} passes", code.name, pass);
                    break;
                }
            }
        }
        Ok(code)
    }

    /// Run a single pass, returning `None` if nothing changed
    pub fn run_pass(&self, code: &CodeObject) -> Result<Option<CodeObject>, Error> {
        // Rejects malformed prefixes up front, so the backwards operand walks are safe
        decode_instructions(&code.code)?;
        let units = decode_units(&code.code)?;
        let line_starts = code.line_starts()?;

        let constants = match ConstantPool::from_constants(code.constants.clone()) {
            Some(constants) => constants,
            None => {
                log::debug!("peephole: duplicate constants in `{}`, skipping", code.name);
                return Ok(None);
            }
        };
        let mut state = OptimizerState::new(units, constants, self.limits)?;

        let mut i = 0;
        while i < state.units.len() {
            let opcode = state.units[i].op;
            if matches!(opcode, OpCode::ExtendedArg | OpCode::Nop) {
                i += 1;
                continue;
            }

            let outcome = rules::apply(&mut state, i);
            let extends_constant_run = match outcome {
                Outcome::Folded => true,
                Outcome::Declined => opcode == OpCode::LoadConst,
                Outcome::Rewritten => false,
            };
            if !extends_constant_run {
                state.const_stack.clear();
            }

            if state.units[i].op.is_unconditional_transfer() {
                rules::remove_dead_code(&mut state, i);
            }
            i += 1;
        }

        log::debug!(
            "peephole: {} replacements in `{}`",
            state.replacements,
            code.name
        );
        if state.replacements == 0 && state.units.iter().all(|unit| unit.op != OpCode::Nop) {
            return Ok(None);
        }

        let (units, new_index) = match compact(&state) {
            Some(compacted) => compacted,
            None => {
                log::debug!("peephole: jump re-targeting overflowed, abandoning the pass");
                return Ok(None);
            }
        };

        let mut line_table = LineTableBuilder::new(code.first_line);
        for line_break in remap_line_starts(&line_starts, &new_index) {
            line_table.push(line_break)?;
        }

        Ok(Some(CodeObject {
            code: units.to_bytes(),
            constants: state.constants.into_vec(),
            line_table: line_table.finish(),
            ..code.clone()
        }))
    }
}

/// Drop every `NOP` (along with any prefixes) and re-target jumps accordingly
///
/// Returns the compacted units and, for every old unit index, the index of the first surviving
/// unit at or after it (with one extra entry for the end of the code). Every jump keeps its
/// width, so this only fails if a jump somehow needs a wider operand than before.
fn compact(state: &OptimizerState) -> Option<(Vec<CodeUnit>, Vec<usize>)> {
    let len = state.units.len();

    let mut keep = vec![true; len];
    for i in 0..len {
        if state.units[i].op == OpCode::Nop {
            for kept in &mut keep[state.op_start(i)..=i] {
                *kept = false;
            }
        }
    }

    let mut new_index = Vec::with_capacity(len + 1);
    let mut surviving = 0;
    for kept in &keep {
        new_index.push(surviving);
        if *kept {
            surviving += 1;
        }
    }
    new_index.push(surviving);

    let mut units = Vec::with_capacity(surviving);
    for i in 0..len {
        let unit = state.units[i];
        if !keep[i] || unit.op == OpCode::ExtendedArg {
            continue;
        }
        let start = state.op_start(i);
        let target = match state.jump_target(i) {
            Some(target) => new_index[target],
            None => {
                units.extend_from_slice(&state.units[start..=i]);
                continue;
            }
        };
        let arg = match unit.op.jump_kind() {
            JumpKind::Relative => target.checked_sub(new_index[i] + 1)? * CODE_UNIT,
            _ => target * CODE_UNIT,
        };
        let arg = u32::try_from(arg).ok()?;
        let width = i + 1 - start;
        if instr_size(arg) > width {
            return None;
        }
        write_instruction(&mut units, unit.op, arg, width);
    }

    Some((units, new_index))
}

/// Move line starts to the offsets their instructions now have
///
/// Line starts of removed instructions land on the next surviving instruction, where the last of
/// them wins.
fn remap_line_starts(line_starts: &[LineBreak], new_index: &[usize]) -> Vec<LineBreak> {
    let last_unit = new_index.len() - 1;
    let mut remapped: Vec<LineBreak> = vec![];
    for line_start in line_starts {
        let unit = (line_start.offset.0 / CODE_UNIT).min(last_unit);
        let line_break = LineBreak {
            offset: Offset(new_index[unit] * CODE_UNIT),
            line: line_start.line,
        };
        match remapped.last_mut() {
            Some(last) if last.offset == line_break.offset => *last = line_break,
            _ => remapped.push(line_break),
        }
    }
    remapped
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::StackEffectTable;
    use crate::code::{CodeMetadata, Constant, Variables};
    use std::collections::HashMap;

    fn code_object(code: Vec<u8>, constants: Vec<Constant>) -> CodeObject {
        with_lines(code, constants, vec![])
    }

    fn with_lines(code: Vec<u8>, constants: Vec<Constant>, line_table: Vec<u8>) -> CodeObject {
        CodeObject::assemble(
            CodeMetadata::new("f", "<test>", 1),
            Variables::default(),
            vec![],
            constants,
            code,
            4,
            line_table,
        )
    }

    fn optimize(code: CodeObject, passes: usize) -> CodeObject {
        let limits = FoldLimits::default();
        PeepholeOptimizer::new(&limits)
            .optimize(code, passes)
            .unwrap()
    }

    fn run_pass(code: &CodeObject) -> Option<CodeObject> {
        let limits = FoldLimits::default();
        PeepholeOptimizer::new(&limits).run_pass(code).unwrap()
    }

    fn ints(values: &[i64]) -> Vec<Constant> {
        values.iter().map(|v| Constant::int(*v)).collect()
    }

    /// Stack depth on entry to every reachable instruction, and the deepest the stack gets
    fn entry_depths(code: &CodeObject) -> (HashMap<Offset, i32>, i32) {
        let effects = StackEffectTable::base();
        let instructions = code.instructions().unwrap();
        let mut depths = HashMap::new();
        let mut max_depth = 0;
        let mut worklist = vec![(Offset(0), 0)];
        while let Some((offset, depth)) = worklist.pop() {
            if let Some(seen) = depths.get(&offset) {
                assert_eq!(*seen, depth, "two depths at {:?}", offset);
                continue;
            }
            depths.insert(offset, depth);
            let insn = instructions
                .iter()
                .find(|insn| insn.offset == offset)
                .unwrap();
            if let Some(target) = insn.jump_target() {
                let taken = depth + effects.effect(insn.opcode, insn.arg, true).unwrap();
                max_depth = max_depth.max(taken);
                worklist.push((target, taken));
            }
            if !insn.opcode.is_unconditional_transfer() {
                let next = depth + effects.effect(insn.opcode, insn.arg, false).unwrap();
                max_depth = max_depth.max(next);
                worklist.push((insn.end(), next));
            }
        }
        (depths, max_depth)
    }

    #[test]
    fn negated_condition_flips_the_jump() {
        // LOAD_FAST 0; UNARY_NOT; POP_JUMP_IF_FALSE 10; LOAD_CONST 0; RETURN_VALUE;
        // LOAD_CONST 1; RETURN_VALUE
        let code = code_object(
            vec![124, 0, 12, 0, 114, 10, 100, 0, 83, 0, 100, 1, 83, 0],
            vec![Constant::None, Constant::int(1)],
        );
        let optimized = optimize(code, 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 115, 8, 100, 0, 83, 0, 100, 1, 83, 0]
        );
    }

    #[test]
    fn only_exact_comparisons_are_inverted() {
        // LOAD_FAST 0; LOAD_FAST 1; COMPARE_OP in; UNARY_NOT; RETURN_VALUE
        let code = code_object(vec![124, 0, 124, 1, 107, 6, 12, 0, 83, 0], vec![]);
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![124, 0, 124, 1, 107, 7, 83, 0]);
        assert!(run_pass(&optimized).is_none());

        // `not (a == b)` stays as it is
        let code = code_object(vec![124, 0, 124, 1, 107, 2, 12, 0, 83, 0], vec![]);
        assert!(run_pass(&code).is_none());
    }

    #[test]
    fn constant_tuples_and_arithmetic_fold() {
        // LOAD_CONST 0; LOAD_CONST 1; BUILD_TUPLE 2; RETURN_VALUE
        let code = code_object(vec![100, 0, 100, 1, 102, 2, 83, 0], ints(&[1, 2]));
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![100, 2, 83, 0]);
        assert_eq!(
            optimized.constants[2],
            Constant::Tuple(vec![Constant::int(1), Constant::int(2)])
        );

        // 2 * 3 + 4
        let code = code_object(
            vec![100, 0, 100, 1, 20, 0, 100, 2, 23, 0, 83, 0],
            ints(&[2, 3, 4]),
        );
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![100, 4, 83, 0]);
        assert_eq!(optimized.constants, ints(&[2, 3, 4, 6, 10]));
    }

    #[test]
    fn folding_respects_limits() {
        // 2 ** 10
        let code = code_object(vec![100, 0, 100, 1, 19, 0, 83, 0], ints(&[2, 10]));
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![100, 2, 83, 0]);
        assert_eq!(optimized.constants[2], Constant::int(1024));

        // 2 ** 200 is left for run time
        let code = code_object(vec![100, 0, 100, 1, 19, 0, 83, 0], ints(&[2, 200]));
        assert!(run_pass(&code).is_none());
    }

    #[test]
    fn folds_that_need_wider_operands_are_declined() {
        // LOAD_CONST 0; UNARY_NEGATIVE; RETURN_VALUE, where the folded constant would need an
        // index past 0xffff
        let constants = (0..0x10000).map(Constant::int).collect::<Vec<_>>();
        let code = code_object(vec![100, 1, 11, 0, 83, 0], constants);
        assert!(run_pass(&code).is_none());
    }

    #[test]
    fn membership_tests_use_constant_containers() {
        // LOAD_FAST 0; LOAD_CONST 0; LOAD_CONST 1; BUILD_LIST 2; COMPARE_OP in; RETURN_VALUE
        let code = code_object(
            vec![124, 0, 100, 0, 100, 1, 103, 2, 107, 6, 83, 0],
            ints(&[1, 2]),
        );
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![124, 0, 100, 2, 107, 6, 83, 0]);
        assert_eq!(
            optimized.constants[2],
            Constant::Tuple(vec![Constant::int(1), Constant::int(2)])
        );
        assert!(run_pass(&optimized).is_none());

        // Same with BUILD_SET
        let code = code_object(
            vec![124, 0, 100, 0, 100, 1, 104, 2, 107, 7, 83, 0],
            ints(&[1, 2]),
        );
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![124, 0, 100, 2, 107, 7, 83, 0]);
        assert_eq!(
            optimized.constants[2],
            Constant::frozenset(vec![Constant::int(1), Constant::int(2)])
        );
        assert!(run_pass(&optimized).is_none());

        // A list that isn't only used for membership has to stay mutable
        let code = code_object(vec![100, 0, 100, 1, 103, 2, 83, 0], ints(&[1, 2]));
        assert!(run_pass(&code).is_none());
    }

    #[test]
    fn build_then_unpack_is_a_rotation() {
        // LOAD_FAST 0; LOAD_FAST 1; BUILD_TUPLE 2; UNPACK_SEQUENCE 2; STORE_FAST 0; STORE_FAST 1;
        // LOAD_CONST 0; RETURN_VALUE
        let code = code_object(
            vec![124, 0, 124, 1, 102, 2, 92, 2, 125, 0, 125, 1, 100, 0, 83, 0],
            vec![Constant::None],
        );
        let optimized = optimize(code, 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 124, 1, 2, 0, 125, 0, 125, 1, 100, 0, 83, 0]
        );
        assert!(run_pass(&optimized).is_none());

        // Three values: BUILD_TUPLE 3; UNPACK_SEQUENCE 3 becomes ROT_THREE; ROT_TWO
        let code = code_object(
            vec![
                124, 0, 124, 1, 124, 2, 102, 3, 92, 3, 125, 0, 125, 1, 125, 2, 100, 0, 83, 0,
            ],
            vec![Constant::None],
        );
        let optimized = optimize(code, 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 124, 1, 124, 2, 3, 0, 2, 0, 125, 0, 125, 1, 125, 2, 100, 0, 83, 0]
        );
        assert!(run_pass(&optimized).is_none());
    }

    #[test]
    fn constant_conditions() {
        // LOAD_CONST True; POP_JUMP_IF_FALSE 8; LOAD_CONST 1; RETURN_VALUE; LOAD_CONST 2;
        // RETURN_VALUE
        let constants = vec![Constant::Bool(true), Constant::int(1), Constant::int(2)];
        let bytes = vec![100, 0, 114, 8, 100, 1, 83, 0, 100, 2, 83, 0];

        // The jump is never taken, and once it is gone the `else` branch is dead too
        let code = code_object(bytes.clone(), constants.clone());
        assert_eq!(optimize(code, 2).code, vec![100, 1, 83, 0]);

        // Same with `False`, where the jump is always taken
        let mut constants = constants;
        constants[0] = Constant::Bool(false);
        let code = code_object(bytes, constants);
        assert_eq!(optimize(code, 1).code, vec![113, 2, 100, 2, 83, 0]);
    }

    #[test]
    fn conditional_jumps_are_threaded() {
        // LOAD_FAST 0; JUMP_IF_FALSE_OR_POP 6; LOAD_FAST 1; POP_JUMP_IF_FALSE 12; LOAD_CONST 0;
        // RETURN_VALUE; LOAD_CONST 1; RETURN_VALUE
        let bytes = vec![124, 0, 111, 6, 124, 1, 114, 12, 100, 0, 83, 0, 100, 1, 83, 0];
        let code = code_object(bytes.clone(), ints(&[0, 1]));
        let optimized = optimize(code, 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 114, 12, 124, 1, 114, 12, 100, 0, 83, 0, 100, 1, 83, 0]
        );
        assert!(run_pass(&optimized).is_none());

        // JUMP_IF_TRUE_OR_POP into a jump testing the other way can skip right past it
        let mut bytes = bytes;
        bytes[2] = 112;
        let code = code_object(bytes, ints(&[0, 1]));
        let optimized = optimize(code, 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 115, 8, 124, 1, 114, 12, 100, 0, 83, 0, 100, 1, 83, 0]
        );
        assert!(run_pass(&optimized).is_none());
    }

    #[test]
    fn or_pop_jumps_thread_into_each_other() {
        // 0: LOAD_FAST 0; 2: JUMP_IF_FALSE_OR_POP 6; 4: LOAD_FAST 1; 6: JUMP_IF_FALSE_OR_POP 12;
        // 8: LOAD_CONST 0; 10: RETURN_VALUE; 12: LOAD_CONST 1; 14: RETURN_VALUE
        let code = code_object(
            vec![124, 0, 111, 6, 124, 1, 111, 12, 100, 0, 83, 0, 100, 1, 83, 0],
            ints(&[0, 1]),
        );
        let optimized = optimize(code.clone(), 1);
        assert_eq!(
            optimized.code,
            vec![124, 0, 111, 12, 124, 1, 111, 12, 100, 0, 83, 0, 100, 1, 83, 0]
        );
        assert!(run_pass(&optimized).is_none());

        // The kept value reaches the final target at the same depth along both paths
        let (before, max_before) = entry_depths(&code);
        let (after, max_after) = entry_depths(&optimized);
        assert_eq!(before[&Offset(12)], 1);
        assert_eq!(after[&Offset(12)], before[&Offset(12)]);
        assert_eq!(max_after, max_before);
    }

    #[test]
    fn jumps_to_jumps_are_chained() {
        // 0: LOAD_FAST 0; 2: POP_JUMP_IF_FALSE 8; 4: LOAD_CONST 0; 6: RETURN_VALUE;
        // 8: JUMP_ABSOLUTE 12; 10: LOAD_CONST 0; 12: LOAD_CONST 1; 14: RETURN_VALUE
        let code = code_object(
            vec![124, 0, 114, 8, 100, 0, 83, 0, 113, 12, 100, 0, 100, 1, 83, 0],
            ints(&[0, 1]),
        );
        assert_eq!(
            optimize(code, 1).code,
            vec![124, 0, 114, 10, 100, 0, 83, 0, 113, 10, 100, 1, 83, 0]
        );
    }

    #[test]
    fn jump_cycles_terminate() {
        // 0: LOAD_FAST 0; 2: POP_JUMP_IF_FALSE 6; 4: JUMP_ABSOLUTE 6; 6: JUMP_ABSOLUTE 4
        let code = code_object(vec![124, 0, 114, 6, 113, 6, 113, 4], vec![]);
        let optimized = optimize(code, 3);
        assert!(run_pass(&optimized).is_none());
    }

    #[test]
    fn unconditional_jump_to_return_is_a_return() {
        // 0: LOAD_FAST 0; 2: POP_JUMP_IF_FALSE 8; 4: JUMP_FORWARD 2; 6: LOAD_CONST 0;
        // 8: RETURN_VALUE
        let code = code_object(vec![124, 0, 114, 8, 110, 2, 100, 0, 83, 0], ints(&[0]));
        assert_eq!(optimize(code, 1).code, vec![124, 0, 114, 6, 83, 0, 83, 0]);
    }

    #[test]
    fn dead_code_is_removed() {
        // LOAD_CONST 0; RETURN_VALUE; LOAD_CONST 1; RETURN_VALUE
        let code = code_object(vec![100, 0, 83, 0, 100, 1, 83, 0], ints(&[0, 1]));
        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![100, 0, 83, 0]);
        assert_eq!(optimized.constants, ints(&[0, 1]));
    }

    #[test]
    fn optimized_code_is_stable() {
        //  0: LOAD_FAST 0
        //  2: UNARY_NOT
        //  4: POP_JUMP_IF_FALSE 16
        //  6: LOAD_CONST 0
        //  8: LOAD_CONST 1
        // 10: BINARY_ADD
        // 12: RETURN_VALUE
        // 14: LOAD_CONST 0
        // 16: JUMP_ABSOLUTE 20
        // 18: NOP
        // 20: LOAD_CONST 2
        // 22: RETURN_VALUE
        let code = code_object(
            vec![
                124, 0, 12, 0, 114, 16, 100, 0, 100, 1, 23, 0, 83, 0, 100, 0, 113, 20, 9, 0, 100,
                2, 83, 0,
            ],
            vec![Constant::int(1), Constant::int(2), Constant::None],
        );

        let first = run_pass(&code).unwrap();
        assert_eq!(
            first.code,
            vec![124, 0, 115, 10, 100, 3, 83, 0, 113, 10, 100, 2, 83, 0]
        );

        // The `JUMP_ABSOLUTE` is only unreachable once its target has moved
        let optimized = optimize(code, 4);
        assert_eq!(
            optimized.code,
            vec![124, 0, 115, 8, 100, 3, 83, 0, 100, 2, 83, 0]
        );
        assert_eq!(optimized.constants[3], Constant::int(3));
        assert!(run_pass(&optimized).is_none());
    }

    #[test]
    fn line_starts_follow_their_instructions() {
        // Line 1: LOAD_CONST 0
        // Line 2: LOAD_CONST 1; BINARY_ADD
        // Line 3: RETURN_VALUE
        let mut lines = LineTableBuilder::new(1);
        for (offset, line) in [(0, 1), (2, 2), (6, 3)] {
            lines
                .push(LineBreak {
                    offset: Offset(offset),
                    line,
                })
                .unwrap();
        }
        let code = with_lines(
            vec![100, 0, 100, 1, 23, 0, 83, 0],
            ints(&[1, 2]),
            lines.finish(),
        );

        let optimized = optimize(code, 1);
        assert_eq!(optimized.code, vec![100, 2, 83, 0]);
        assert_eq!(
            optimized.line_starts().unwrap(),
            vec![
                LineBreak {
                    offset: Offset(0),
                    line: 2
                },
                LineBreak {
                    offset: Offset(2),
                    line: 3
                },
            ]
        );
    }

    #[test]
    fn passes_return_a_new_code_object() {
        // 2 * 3 + 4
        let code = code_object(
            vec![100, 0, 100, 1, 20, 0, 100, 2, 23, 0, 83, 0],
            ints(&[2, 3, 4]),
        );
        let optimized = run_pass(&code).unwrap();
        assert_ne!(optimized.code, code.code);
        assert_eq!(code.code, vec![100, 0, 100, 1, 20, 0, 100, 2, 23, 0, 83, 0]);
        assert_eq!(code.constants, ints(&[2, 3, 4]));
    }

    #[test]
    fn duplicate_constants_are_left_alone() {
        // 1 + 1 with both operands in their own slot
        let code = code_object(vec![100, 0, 100, 1, 23, 0, 83, 0], ints(&[1, 1]));
        assert!(run_pass(&code).is_none());
    }

    #[test]
    fn malformed_code_is_rejected() {
        let limits = FoldLimits::default();
        let optimizer = PeepholeOptimizer::new(&limits);
        assert!(matches!(
            optimizer.run_pass(&code_object(vec![144, 1], vec![])),
            Err(Error::MalformedBytecode { .. })
        ));
        assert!(matches!(
            optimizer.run_pass(&code_object(vec![113, 9, 83, 0], vec![])),
            Err(Error::MalformedBytecode { .. })
        ));
    }
}
