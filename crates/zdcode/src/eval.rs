//! Compile-time numeric evaluation and format-string expansion.
//!
//! Eval expressions (`e{ … }`) are interpreted during lowering and their
//! result is spliced into the output as text. Integers stay integers until a
//! float operand is mixed in; `/` always produces a float; `//` floors.

use smallvec::SmallVec;

use crate::{
    ast::{EvalNode, EvalOperator, FormatPart},
    context::{ContextTree, CtxId},
    error::{CompileError, CompileResult},
    text::unstringify,
};

/// A compile-time numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn truthy(self) -> bool {
        match self {
            Self::Int(v) => v != 0,
            Self::Float(v) => v != 0.0,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

}

impl std::fmt::Display for Num {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{}", float_repr(*v)),
        }
    }
}

/// Returns the shortest decimal text that round-trips through `f64`.
///
/// ryu produces `1e20` where the reference formatting is `1e+20`; the
/// exponent sign is patched in, and special values render lowercase.
pub(crate) fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value.is_sign_negative() { "-inf" } else { "inf" }.to_string();
    }

    let mut buffer = ryu::Buffer::new();
    let s = buffer.format(value);
    if let Some(e_pos) = s.find('e') {
        let (mantissa, exp) = s.split_at(e_pos);
        let exp = &exp[1..];
        if exp.starts_with('-') {
            format!("{mantissa}e{exp}")
        } else {
            format!("{mantissa}e+{exp}")
        }
    } else {
        s.to_string()
    }
}

/// Evaluates a compile-time numeric expression.
pub(crate) fn evaluate(tree: &ContextTree, ctx: CtxId, node: &EvalNode) -> CompileResult<Num> {
    match node {
        EvalNode::Int(v) => Ok(Num::Int(*v)),
        EvalNode::Float(v) => Ok(Num::Float(*v)),
        EvalNode::Var(name) => {
            let Some(value) = tree.lookup_replacement(ctx, name) else {
                return Err(CompileError::at(
                    tree.describe(ctx),
                    format!("cannot get compile-time variable '{name}' for evaluation"),
                ));
            };
            value.trim().parse::<f64>().map(Num::Float).map_err(|_| {
                CompileError::at(
                    tree.describe(ctx),
                    format!("compile-time variable '{name}' is not numeric: got '{value}'"),
                )
            })
        }
        EvalNode::Op(op) => {
            let mut values: SmallVec<[Num; 3]> = SmallVec::new();
            for operand in &op.operands {
                values.push(evaluate(tree, ctx, operand)?);
            }
            apply(tree, ctx, op.op, &values)
        }
    }
}

/// Evaluates the parts of a compile-time format string and concatenates
/// their unquoted text.
pub(crate) fn eval_format_string(
    tree: &ContextTree,
    ctx: CtxId,
    parts: &[FormatPart],
) -> CompileResult<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            FormatPart::Text(text) => out.push_str(unstringify(text)),
            FormatPart::Eval(node) => {
                out.push_str(unstringify(&evaluate(tree, ctx, node)?.to_string()));
            }
            FormatPart::Replace(name) => match tree.lookup_replacement(ctx, name) {
                Some(value) => out.push_str(unstringify(&value)),
                None => {
                    return Err(CompileError::at(
                        tree.describe(ctx),
                        format!("replacement '{name}' not found while formatting string"),
                    ));
                }
            },
        }
    }
    Ok(out)
}

fn arith_error(tree: &ContextTree, ctx: CtxId, message: impl Into<String>) -> CompileError {
    CompileError::at(tree.describe(ctx), message)
}

fn float_to_int(tree: &ContextTree, ctx: CtxId, value: f64) -> CompileResult<i64> {
    if value.is_finite() && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        Ok(value as i64)
    } else {
        Err(arith_error(
            tree,
            ctx,
            format!("compile-time value {} does not fit an integer", float_repr(value)),
        ))
    }
}

fn checked(tree: &ContextTree, ctx: CtxId, value: Option<i64>, what: &str) -> CompileResult<Num> {
    value.map(Num::Int).ok_or_else(|| {
        arith_error(tree, ctx, format!("integer overflow in compile-time {what}"))
    })
}

/// Floor modulo: the result follows the sign of the divisor.
fn floor_mod_i64(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && (r < 0) != (b < 0) {
        r.checked_add(b)
    } else {
        Some(r)
    }
}

/// Floor division, rounding toward negative infinity.
fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    let r = a.checked_rem(b)?;
    if r != 0 && (r < 0) != (b < 0) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn both_ints(values: &[Num]) -> Option<(i64, i64)> {
    match (values[0], values[1]) {
        (Num::Int(a), Num::Int(b)) => Some((a, b)),
        _ => None,
    }
}

fn apply(tree: &ContextTree, ctx: CtxId, op: EvalOperator, values: &[Num]) -> CompileResult<Num> {
    use EvalOperator as Op;

    let unary = || values[0];
    match op {
        Op::Pos => Ok(unary()),
        Op::Neg => match unary() {
            Num::Int(v) => checked(tree, ctx, v.checked_neg(), "negation"),
            Num::Float(v) => Ok(Num::Float(-v)),
        },
        Op::Round => match unary() {
            Num::Int(v) => Ok(Num::Int(v)),
            Num::Float(v) => Ok(Num::Int(float_to_int(tree, ctx, v.trunc())?)),
        },
        Op::Floor => match unary() {
            Num::Int(v) => Ok(Num::Int(v)),
            Num::Float(v) => Ok(Num::Int(float_to_int(tree, ctx, v.floor())?)),
        },
        Op::Ceil => match unary() {
            Num::Int(v) => Ok(Num::Int(v)),
            Num::Float(v) => Ok(Num::Int(float_to_int(tree, ctx, v.ceil())?)),
        },
        Op::Sin => Ok(Num::Float(unary().as_f64().sin())),
        Op::Cos => Ok(Num::Float(unary().as_f64().cos())),
        Op::Tan => Ok(Num::Float(unary().as_f64().tan())),
        Op::Asin => Ok(Num::Float(unary().as_f64().asin())),
        Op::Acos => Ok(Num::Float(unary().as_f64().acos())),
        Op::Atan => Ok(Num::Float(unary().as_f64().atan())),
        Op::Pi => Ok(Num::Float(std::f64::consts::PI * unary().as_f64())),

        Op::Add => match both_ints(values) {
            Some((a, b)) => checked(tree, ctx, a.checked_add(b), "addition"),
            None => Ok(Num::Float(values[0].as_f64() + values[1].as_f64())),
        },
        Op::Sub => match both_ints(values) {
            Some((a, b)) => checked(tree, ctx, a.checked_sub(b), "subtraction"),
            None => Ok(Num::Float(values[0].as_f64() - values[1].as_f64())),
        },
        Op::Mul => match both_ints(values) {
            Some((a, b)) => checked(tree, ctx, a.checked_mul(b), "multiplication"),
            None => Ok(Num::Float(values[0].as_f64() * values[1].as_f64())),
        },
        Op::Div => {
            let b = values[1].as_f64();
            if b == 0.0 {
                return Err(arith_error(tree, ctx, "division by zero in compile-time expression"));
            }
            Ok(Num::Float(values[0].as_f64() / b))
        }
        Op::FloorDiv => match both_ints(values) {
            Some((_, 0)) => Err(arith_error(
                tree,
                ctx,
                "division by zero in compile-time expression",
            )),
            Some((a, b)) => checked(tree, ctx, floor_div_i64(a, b), "floor division"),
            None => {
                let b = values[1].as_f64();
                if b == 0.0 {
                    return Err(arith_error(
                        tree,
                        ctx,
                        "division by zero in compile-time expression",
                    ));
                }
                Ok(Num::Float((values[0].as_f64() / b).floor()))
            }
        },
        Op::Mod => match both_ints(values) {
            Some((_, 0)) => Err(arith_error(
                tree,
                ctx,
                "modulo by zero in compile-time expression",
            )),
            Some((a, b)) => checked(tree, ctx, floor_mod_i64(a, b), "modulo"),
            None => {
                let (a, b) = (values[0].as_f64(), values[1].as_f64());
                if b == 0.0 {
                    return Err(arith_error(
                        tree,
                        ctx,
                        "modulo by zero in compile-time expression",
                    ));
                }
                Ok(Num::Float(a - b * (a / b).floor()))
            }
        },

        Op::Shl | Op::Shr | Op::BitAnd | Op::BitXor | Op::BitOr => {
            let Some((a, b)) = both_ints(values) else {
                return Err(arith_error(
                    tree,
                    ctx,
                    "bitwise operators require integer operands",
                ));
            };
            match op {
                Op::BitAnd => Ok(Num::Int(a & b)),
                Op::BitXor => Ok(Num::Int(a ^ b)),
                Op::BitOr => Ok(Num::Int(a | b)),
                Op::Shl | Op::Shr => {
                    let shift = u32::try_from(b).ok().filter(|s| *s < 64).ok_or_else(|| {
                        arith_error(tree, ctx, format!("invalid shift amount {b}"))
                    })?;
                    if op == Op::Shl {
                        checked(tree, ctx, a.checked_shl(shift), "left shift")
                    } else {
                        Ok(Num::Int(a >> shift))
                    }
                }
                _ => unreachable!(),
            }
        }

        Op::And => Ok(Num::Int(i64::from(values[0].truthy() && values[1].truthy()))),
        Op::Or => Ok(Num::Int(i64::from(values[0].truthy() || values[1].truthy()))),
        Op::Xor => Ok(Num::Int(i64::from(values[0].truthy() != values[1].truthy()))),

        Op::Ternary => Ok(if values[0].truthy() { values[1] } else { values[2] }),
        Op::Comma => Ok(values[1]),
    }
}
