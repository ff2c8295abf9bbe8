//! Compile-time evaluation of operations on constants
//!
//! Every function here returns `None` when it declines to fold: because the operation would fail
//! at run time (division by zero, bad index, ...), because the result depends on something only
//! known at run time, or because the result would exceed the [`FoldLimits`].

use crate::bytecode::OpCode;
use crate::code::Constant;
use crate::settings::FoldLimits;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

/// Binary operations that constant folding knows about
pub fn is_foldable_binary(opcode: OpCode) -> bool {
    matches!(
        opcode,
        OpCode::BinaryPower
            | OpCode::BinaryMultiply
            | OpCode::BinaryModulo
            | OpCode::BinaryAdd
            | OpCode::BinarySubtract
            | OpCode::BinarySubscr
            | OpCode::BinaryFloorDivide
            | OpCode::BinaryTrueDivide
            | OpCode::BinaryLshift
            | OpCode::BinaryRshift
            | OpCode::BinaryAnd
            | OpCode::BinaryXor
            | OpCode::BinaryOr
    )
}

pub fn unary(opcode: OpCode, operand: &Constant) -> Option<Constant> {
    match (opcode, operand) {
        (OpCode::UnaryNegative, Constant::Int(i)) => Some(Constant::Int(-i)),
        (OpCode::UnaryNegative, Constant::Float(f)) => Some(Constant::Float(-f)),
        (OpCode::UnaryPositive, Constant::Int(_) | Constant::Float(_)) => Some(operand.clone()),
        (OpCode::UnaryInvert, Constant::Int(i)) => Some(Constant::Int(!i)),
        _ => None,
    }
}

pub fn binary(
    opcode: OpCode,
    lhs: &Constant,
    rhs: &Constant,
    limits: &FoldLimits,
) -> Option<Constant> {
    match (opcode, lhs, rhs) {
        (OpCode::BinarySubscr, _, _) => subscript(lhs, rhs),

        (OpCode::BinaryAdd, Constant::Str(s1), Constant::Str(s2)) => {
            if s1.chars().count() + s2.chars().count() > limits.max_str_size {
                return None;
            }
            Some(Constant::Str(format!("{}{}", s1, s2)))
        }
        (OpCode::BinaryAdd, Constant::Bytes(b1), Constant::Bytes(b2)) => {
            if b1.len() + b2.len() > limits.max_str_size {
                return None;
            }
            Some(Constant::Bytes([b1.as_slice(), b2.as_slice()].concat()))
        }
        (OpCode::BinaryAdd, Constant::Tuple(t1), Constant::Tuple(t2)) => {
            if t1.len() + t2.len() > limits.max_collection_size
                || complexity(t1) + complexity(t2) > limits.max_total_items
            {
                return None;
            }
            Some(Constant::Tuple([t1.as_slice(), t2.as_slice()].concat()))
        }

        (
            OpCode::BinaryMultiply,
            Constant::Str(_) | Constant::Bytes(_) | Constant::Tuple(_),
            Constant::Int(n),
        ) => repeat(lhs, n, limits),
        (
            OpCode::BinaryMultiply,
            Constant::Int(n),
            Constant::Str(_) | Constant::Bytes(_) | Constant::Tuple(_),
        ) => repeat(rhs, n, limits),

        // `%` on strings is formatting
        (OpCode::BinaryModulo, Constant::Str(_) | Constant::Bytes(_), _) => None,

        // Integer division is correctly rounded, which float division only matches as long as both
        // operands are exact floats
        (OpCode::BinaryTrueDivide, Constant::Int(i1), Constant::Int(i2)) => {
            float_binary(opcode, exact_float(i1)?, exact_float(i2)?)
        }
        (_, Constant::Int(i1), Constant::Int(i2)) => int_binary(opcode, i1, i2, limits),
        (_, Constant::Int(_) | Constant::Float(_), Constant::Int(_) | Constant::Float(_)) => {
            float_binary(opcode, as_float(lhs)?, as_float(rhs)?)
        }
        _ => None,
    }
}

fn int_binary(opcode: OpCode, i1: &BigInt, i2: &BigInt, limits: &FoldLimits) -> Option<Constant> {
    let result = match opcode {
        OpCode::BinaryAdd => i1 + i2,
        OpCode::BinarySubtract => i1 - i2,
        OpCode::BinaryMultiply => {
            if !i1.is_zero() && !i2.is_zero() && i1.bits() + i2.bits() > limits.max_int_bits {
                return None;
            }
            i1 * i2
        }
        OpCode::BinaryPower => {
            if i2.is_negative() {
                return None;
            }
            if !i1.is_zero() && !i2.is_zero() {
                let exponent_bits = i1.bits().checked_mul(i2.to_u64()?)?;
                if exponent_bits > limits.max_int_bits {
                    return None;
                }
            }
            i1.pow(i2.to_u32()?)
        }
        OpCode::BinaryLshift => {
            if i2.is_negative() {
                return None;
            }
            if i1.is_zero() {
                return Some(Constant::Int(BigInt::zero()));
            }
            let shift = i2.to_u64()?;
            if shift > limits.max_int_bits || i1.bits() > limits.max_int_bits - shift {
                return None;
            }
            i1 << (shift as usize)
        }
        OpCode::BinaryRshift => {
            if i2.is_negative() {
                return None;
            }
            match i2.to_usize() {
                Some(shift) => i1 >> shift,
                None if i1.is_negative() => BigInt::from(-1),
                None => BigInt::zero(),
            }
        }
        OpCode::BinaryModulo => {
            if i2.is_zero() {
                return None;
            }
            i1.mod_floor(i2)
        }
        OpCode::BinaryFloorDivide => {
            if i2.is_zero() {
                return None;
            }
            i1.div_floor(i2)
        }
        OpCode::BinaryAnd => i1 & i2,
        OpCode::BinaryOr => i1 | i2,
        OpCode::BinaryXor => i1 ^ i2,
        _ => return None,
    };
    Some(Constant::Int(result))
}

fn float_binary(opcode: OpCode, f1: f64, f2: f64) -> Option<Constant> {
    let result = match opcode {
        OpCode::BinaryAdd => f1 + f2,
        OpCode::BinarySubtract => f1 - f2,
        OpCode::BinaryMultiply => f1 * f2,
        OpCode::BinaryTrueDivide if f2 != 0.0 => f1 / f2,
        _ => return None,
    };
    Some(Constant::Float(result))
}

fn as_float(constant: &Constant) -> Option<f64> {
    match constant {
        Constant::Float(f) => Some(*f),
        Constant::Int(i) => i.to_f64().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn exact_float(int: &BigInt) -> Option<f64> {
    if int.bits() > f64::MANTISSA_DIGITS as u64 {
        return None;
    }
    int.to_f64()
}

/// Sequence repetition (`seq * n` or `n * seq`)
fn repeat(sequence: &Constant, count: &BigInt, limits: &FoldLimits) -> Option<Constant> {
    let count = if count.is_negative() {
        0
    } else {
        count.to_usize()?
    };
    match sequence {
        Constant::Str(s) => {
            let size = s.chars().count();
            if size > 0 && count > limits.max_str_size / size {
                return None;
            }
            Some(Constant::Str(s.repeat(count)))
        }
        Constant::Bytes(b) => {
            if !b.is_empty() && count > limits.max_str_size / b.len() {
                return None;
            }
            Some(Constant::Bytes(b.repeat(count)))
        }
        Constant::Tuple(t) => {
            if !t.is_empty() && count > limits.max_collection_size / t.len() {
                return None;
            }
            if count > 0 && complexity(t) > limits.max_total_items / count {
                return None;
            }
            Some(Constant::Tuple(
                (0..count).flat_map(|_| t.iter().cloned()).collect(),
            ))
        }
        _ => None,
    }
}

/// Number of items, counting items of nested collections
fn complexity(elems: &[Constant]) -> usize {
    elems
        .iter()
        .map(|elem| match elem {
            Constant::Tuple(nested) | Constant::FrozenSet(nested) => 1 + complexity(nested),
            _ => 1,
        })
        .sum()
}

fn subscript(container: &Constant, index: &Constant) -> Option<Constant> {
    let index = match index {
        Constant::Int(i) => i.to_i64()?,
        _ => return None,
    };
    match container {
        Constant::Str(s) => {
            let idx = normalize_index(index, s.chars().count())?;
            s.chars().nth(idx).map(|c| Constant::Str(c.to_string()))
        }
        Constant::Bytes(b) => {
            let idx = normalize_index(index, b.len())?;
            Some(Constant::int(b[idx]))
        }
        Constant::Tuple(t) => {
            let idx = normalize_index(index, t.len())?;
            Some(t[idx].clone())
        }
        _ => None,
    }
}

/// Resolve negative indices from the end, rejecting out of bounds indices
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 {
        index + len as i64
    } else {
        index
    };
    usize::try_from(resolved).ok().filter(|idx| *idx < len)
}
