use crate::bytecode::{OpCode, StackEffectTable};
use crate::code::{BlockId, FlowGraph, Operand};
use crate::Error;
use std::collections::HashMap;

/// Compute the maximum depth the operand stack can reach along any control path
///
/// This is a worklist traversal from the entry block (entered with an empty stack). Blocks get
/// re-queued only when they are reached with a strictly larger entry depth than any seen so far,
/// which makes the traversal terminate on loops: depths are bounded by the (finite) number of
/// pushes along acyclic paths. Code that grows the stack on every trip around a loop breaks that
/// bound and is reported as [`Error::UnboundedStackGrowth`].
///
/// Jumps queue their target with the depth the stack has _if the jump is taken_. For exception
/// handler setup, this is where the extra values pushed by the runtime before entering the handler
/// come in (it is all encoded in the stack effect table).
pub fn max_stack_depth(graph: &FlowGraph, effects: &StackEffectTable) -> Result<u32, Error> {
    let bound = depth_bound(graph, effects)?;
    let mut best_entry_depth: HashMap<BlockId, i64> = HashMap::new();
    let mut worklist: Vec<(BlockId, i64)> = vec![];
    let mut max_depth: i64 = 0;

    enqueue(&mut worklist, &mut best_entry_depth, bound, graph.entry(), 0)?;

    while let Some((block_id, entry_depth)) = worklist.pop() {
        // Stale entry: the block has since been queued with a larger depth
        if best_entry_depth[&block_id] > entry_depth {
            continue;
        }
        log::trace!("stack depth: entering {:?} at {}", block_id, entry_depth);

        let block = graph.block(block_id);
        let mut depth = entry_depth;
        max_depth = max_depth.max(depth);
        let mut falls_through = true;

        for insn in &block.instructions {
            let arg = insn.operand.value().unwrap_or(0) as u32;

            if let Operand::Block(target) = insn.operand {
                let taken_depth = depth + effects.effect(insn.opcode, arg, true)? as i64;
                check_depth(block_id, insn.opcode, taken_depth)?;
                max_depth = max_depth.max(taken_depth);
                enqueue(&mut worklist, &mut best_entry_depth, bound, target, taken_depth)?;
            }

            depth += effects.effect(insn.opcode, arg, false)? as i64;
            check_depth(block_id, insn.opcode, depth)?;
            max_depth = max_depth.max(depth);

            // Rest of the block is unreachable
            if insn.opcode.is_unconditional_transfer() {
                falls_through = false;
                break;
            }
        }

        if falls_through {
            if let Some(next) = block.fallthrough {
                enqueue(&mut worklist, &mut best_entry_depth, bound, next, depth)?;
            }
        }
    }

    Ok(max_depth as u32)
}

fn check_depth(block: BlockId, opcode: OpCode, depth: i64) -> Result<(), Error> {
    if depth < 0 {
        Err(Error::NegativeStackDepth {
            block,
            opcode,
            depth,
        })
    } else {
        Ok(())
    }
}

/// Largest depth any block can be entered with, unless some loop grows the stack
///
/// Without such a loop, every entry depth is reached along a path that visits each instruction at
/// most once, so it can't exceed the sum of every instruction's largest push.
fn depth_bound(graph: &FlowGraph, effects: &StackEffectTable) -> Result<i64, Error> {
    let mut bound: i64 = 0;
    for block in graph.blocks() {
        for insn in &block.instructions {
            let arg = insn.operand.value().unwrap_or(0) as u32;
            let mut push = effects.effect(insn.opcode, arg, false)?;
            if insn.operand.target().is_some() {
                push = push.max(effects.effect(insn.opcode, arg, true)?);
            }
            bound += push.max(0) as i64;
        }
    }
    Ok(bound)
}

/// Queue a block if this is the largest depth it has been reached with so far
fn enqueue(
    worklist: &mut Vec<(BlockId, i64)>,
    best_entry_depth: &mut HashMap<BlockId, i64>,
    bound: i64,
    block: BlockId,
    depth: i64,
) -> Result<(), Error> {
    let improved = match best_entry_depth.get(&block) {
        Some(best) => depth > *best,
        None => true,
    };
    if improved {
        if depth > bound {
            return Err(Error::UnboundedStackGrowth { block, depth });
        }
        best_entry_depth.insert(block, depth);
        worklist.push((block, depth));
    }
    Ok(())
}
