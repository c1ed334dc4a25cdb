//! Operator dispatch over runtime values.
//!
//! The VM's `BinaryOp`/`UnaryOp` instructions and the AST constant folder
//! both route through here, so folded constants and runtime results always
//! agree. Errors are kernel-level [`ErrorValue`]s; the VM wraps them with
//! source positions.
//!
//! Coercion rules: within the numeric set `{Bool, Int, Uint, Float, Char}`
//! a `Float` operand forces float arithmetic, a `Uint` operand forces
//! unsigned arithmetic, `Bool` coerces to `Int` 0/1, and `Char` stays a
//! `Char` under `+`/`-` (both against `Char` and against `Int`). Integer
//! overflow wraps, two's-complement style.

use std::rc::Rc;

use ecow::EcoString;

use crate::errors::{ErrorKind, ErrorValue};
use crate::token::Token;
use crate::value::Value;

/// Apply a binary operator. Comparison tokens yield `Bool`.
pub fn binary_op(op: Token, lhs: &Value, rhs: &Value) -> Result<Value, ErrorValue> {
    use Token::*;
    match op {
        Eql => return Ok(Value::Bool(lhs.equals(rhs))),
        Neq => return Ok(Value::Bool(!lhs.equals(rhs))),
        Lss | Gtr | Leq | Geq => return compare(op, lhs, rhs).map(Value::Bool),
        _ => {}
    }

    // Shared cells act as the value they hold.
    if let Value::ObjectPtr(p) = lhs {
        return binary_op(op, &p.get(), rhs);
    }
    if let Value::ObjectPtr(p) = rhs {
        return binary_op(op, lhs, &p.get());
    }

    match (lhs, rhs) {
        (Value::Foreign(obj), _) => return obj.binary_op(op, rhs),

        // Float on either side forces float arithmetic.
        (Value::Float(_), other) | (other, Value::Float(_)) if other.is_numeric() => {
            return float_op(op, lhs.as_f64_lossy(), rhs.as_f64_lossy(), lhs, rhs);
        }

        // Char + Int, Int + Char, Char +- Char keep the char space.
        (Value::Char(a), Value::Char(b)) => match op {
            Token::Add => return char_result((*a as u32 as i64).wrapping_add(*b as u32 as i64)),
            Token::Sub => return char_result((*a as u32 as i64).wrapping_sub(*b as u32 as i64)),
            _ => return int_op(op, *a as u32 as i64, *b as u32 as i64),
        },
        (Value::Char(a), Value::Int(b)) => match op {
            Token::Add => return char_result((*a as u32 as i64).wrapping_add(*b)),
            Token::Sub => return char_result((*a as u32 as i64).wrapping_sub(*b)),
            _ => return int_op(op, *a as u32 as i64, *b),
        },
        (Value::Int(a), Value::Char(b)) => match op {
            Token::Add => return char_result(a.wrapping_add(*b as u32 as i64)),
            _ => return int_op(op, *a, *b as u32 as i64),
        },

        // Uint on either side forces unsigned arithmetic.
        (Value::Uint(_), other) | (other, Value::Uint(_)) if other.is_numeric() => {
            return uint_op(op, lhs.as_i128() as u64, rhs.as_i128() as u64);
        }

        (Value::Int(a), Value::Int(b)) => return int_op(op, *a, *b),

        // Bool coerces to Int and retries.
        (Value::Bool(_), other) | (other, Value::Bool(_)) if other.is_numeric() => {
            return binary_op(
                op,
                &coerce_bool(lhs),
                &coerce_bool(rhs),
            );
        }

        (Value::String(a), Value::String(b)) => {
            if op == Token::Add {
                let mut out = a.clone();
                out.push_str(b);
                return Ok(Value::String(out));
            }
        }
        (Value::String(a), Value::Char(c)) => {
            if op == Token::Add {
                let mut out = a.clone();
                out.push(*c);
                return Ok(Value::String(out));
            }
        }
        (Value::Char(c), Value::String(b)) => {
            if op == Token::Add {
                let mut out = EcoString::new();
                out.push(*c);
                out.push_str(b);
                return Ok(Value::String(out));
            }
        }

        (Value::Bytes(a), Value::Bytes(b)) => {
            if op == Token::Add {
                let mut out = a.borrow().clone();
                out.extend_from_slice(&b.borrow());
                return Ok(Value::bytes(out));
            }
        }
        (Value::Bytes(a), Value::String(s)) => {
            if op == Token::Add {
                let mut out = a.borrow().clone();
                out.extend_from_slice(s.as_bytes());
                return Ok(Value::bytes(out));
            }
        }

        (Value::Array(a), Value::Array(b)) => {
            if op == Token::Add {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                return Ok(Value::array(out));
            }
        }

        _ => {}
    }

    Err(invalid_operator(op, lhs, rhs))
}

/// Apply a unary operator (`-`, `+`, `!`, `^`).
pub fn unary_op(op: Token, v: &Value) -> Result<Value, ErrorValue> {
    if let Value::ObjectPtr(p) = v {
        return unary_op(op, &p.get());
    }
    match op {
        Token::Not => return Ok(Value::Bool(v.is_falsy())),
        Token::Add => match v {
            Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Char(_) => {
                return Ok(v.clone());
            }
            Value::Bool(b) => return Ok(Value::Int(*b as i64)),
            _ => {}
        },
        Token::Sub => match v {
            Value::Int(i) => return Ok(Value::Int(i.wrapping_neg())),
            Value::Uint(u) => return Ok(Value::Uint(u.wrapping_neg())),
            Value::Float(f) => return Ok(Value::Float(-f)),
            Value::Char(c) => return Ok(Value::Int(-(*c as u32 as i64))),
            Value::Bool(b) => return Ok(Value::Int(-(*b as i64))),
            _ => {}
        },
        Token::Xor => match v {
            Value::Int(i) => return Ok(Value::Int(!i)),
            Value::Uint(u) => return Ok(Value::Uint(!u)),
            Value::Char(c) => return Ok(Value::Int(!(*c as u32 as i64))),
            Value::Bool(b) => return Ok(Value::Int(!(*b as i64))),
            _ => {}
        },
        _ => {}
    }
    Err(ErrorValue::with_message(
        ErrorKind::InvalidOperator,
        format!("unary operator '{}' not allowed with '{}'", op, v.type_name()),
    ))
}

/// Ordered comparison (`<`, `>`, `<=`, `>=`).
///
/// `Undefined` sorts below every other value; two `Undefined`s are equal,
/// so strict comparisons are false and non-strict ones are true.
pub fn compare(op: Token, lhs: &Value, rhs: &Value) -> Result<bool, ErrorValue> {
    use Token::*;
    if let Value::ObjectPtr(p) = lhs {
        return compare(op, &p.get(), rhs);
    }
    if let Value::ObjectPtr(p) = rhs {
        return compare(op, lhs, &p.get());
    }
    match (lhs, rhs) {
        (Value::Undefined, Value::Undefined) => {
            return Ok(matches!(op, Leq | Geq));
        }
        (Value::Undefined, _) => return Ok(matches!(op, Lss | Leq)),
        (_, Value::Undefined) => return Ok(matches!(op, Gtr | Geq)),
        (a, b) if a.is_numeric() && b.is_numeric() => {
            let ord = if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
                a.as_f64_lossy().partial_cmp(&b.as_f64_lossy())
            } else {
                Some(a.as_i128().cmp(&b.as_i128()))
            };
            let Some(ord) = ord else {
                // NaN involved: every ordered comparison is false.
                return Ok(false);
            };
            return Ok(match op {
                Lss => ord.is_lt(),
                Gtr => ord.is_gt(),
                Leq => ord.is_le(),
                Geq => ord.is_ge(),
                _ => unreachable!("compare called with non-ordering token"),
            });
        }
        (Value::String(a), Value::String(b)) => return Ok(apply_ord(op, a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => {
            return Ok(apply_ord(op, a.borrow().as_slice().cmp(b.borrow().as_slice())));
        }
        (Value::String(a), Value::Bytes(b)) => {
            return Ok(apply_ord(op, a.as_bytes().cmp(b.borrow().as_slice())));
        }
        (Value::Bytes(a), Value::String(b)) => {
            return Ok(apply_ord(op, a.borrow().as_slice().cmp(b.as_bytes())));
        }
        _ => {}
    }
    Err(invalid_operator(op, lhs, rhs))
}

fn apply_ord(op: Token, ord: std::cmp::Ordering) -> bool {
    match op {
        Token::Lss => ord.is_lt(),
        Token::Gtr => ord.is_gt(),
        Token::Leq => ord.is_le(),
        Token::Geq => ord.is_ge(),
        _ => unreachable!("apply_ord called with non-ordering token"),
    }
}

fn coerce_bool(v: &Value) -> Value {
    match v {
        Value::Bool(b) => Value::Int(*b as i64),
        other => other.clone(),
    }
}

fn char_result(code: i64) -> Result<Value, ErrorValue> {
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(Value::Char)
        .ok_or_else(|| {
            ErrorValue::with_message(
                ErrorKind::InvalidOperator,
                format!("char arithmetic out of range: {}", code),
            )
        })
}

fn int_op(op: Token, a: i64, b: i64) -> Result<Value, ErrorValue> {
    use Token::*;
    Ok(Value::Int(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Quo => {
            if b == 0 {
                return Err(ErrorValue::kind(ErrorKind::ZeroDivision));
            }
            a.wrapping_div(b)
        }
        Rem => {
            if b == 0 {
                return Err(ErrorValue::kind(ErrorKind::ZeroDivision));
            }
            a.wrapping_rem(b)
        }
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        AndNot => a & !b,
        Shl => {
            let s = shift_count(b)?;
            if s >= 64 { 0 } else { a.wrapping_shl(s as u32) }
        }
        Shr => {
            let s = shift_count(b)?;
            if s >= 64 {
                if a < 0 { -1 } else { 0 }
            } else {
                a >> s
            }
        }
        _ => {
            return Err(ErrorValue::with_message(
                ErrorKind::InvalidOperator,
                format!("operator '{}' not allowed with 'int'", op),
            ));
        }
    }))
}

fn uint_op(op: Token, a: u64, b: u64) -> Result<Value, ErrorValue> {
    use Token::*;
    Ok(Value::Uint(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Quo => {
            if b == 0 {
                return Err(ErrorValue::kind(ErrorKind::ZeroDivision));
            }
            a / b
        }
        Rem => {
            if b == 0 {
                return Err(ErrorValue::kind(ErrorKind::ZeroDivision));
            }
            a % b
        }
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        AndNot => a & !b,
        Shl => {
            if b >= 64 { 0 } else { a.wrapping_shl(b as u32) }
        }
        Shr => {
            if b >= 64 { 0 } else { a >> b }
        }
        _ => {
            return Err(ErrorValue::with_message(
                ErrorKind::InvalidOperator,
                format!("operator '{}' not allowed with 'uint'", op),
            ));
        }
    }))
}

fn float_op(op: Token, a: f64, b: f64, lhs: &Value, rhs: &Value) -> Result<Value, ErrorValue> {
    use Token::*;
    Ok(Value::Float(match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        // IEEE semantics: x/0.0 is an infinity, not an error.
        Quo => a / b,
        Rem => a % b,
        _ => return Err(invalid_operator(op, lhs, rhs)),
    }))
}

fn shift_count(b: i64) -> Result<u64, ErrorValue> {
    u64::try_from(b).map_err(|_| {
        ErrorValue::with_message(ErrorKind::InvalidOperator, "negative shift count")
    })
}

fn invalid_operator(op: Token, lhs: &Value, rhs: &Value) -> ErrorValue {
    ErrorValue::with_message(
        ErrorKind::InvalidOperator,
        format!(
            "operator '{}' not allowed between '{}' and '{}'",
            op,
            lhs.type_name(),
            rhs.type_name()
        ),
    )
}

/// Derive an error value for a `throw` of an arbitrary value: errors pass
/// through, everything else becomes `error(string(v))`.
pub fn to_error_value(v: &Value) -> ErrorValue {
    match v {
        Value::Error(e) => e.as_ref().clone(),
        Value::RuntimeError(e) => e.error.clone(),
        Value::String(s) => ErrorValue::new(s.clone()),
        other => ErrorValue::new(other.to_string()),
    }
}

/// Re-wrap an error value as a throwable script value.
pub fn error_to_value(e: ErrorValue) -> Value {
    Value::Error(Rc::new(e))
}
