//! The builtin registry: callable builtins, error sentinels, and the call
//! convention shared by builtins and host functions.
//!
//! Builtin ids are stable: `GetBuiltin` encodes them as a byte, so the
//! order of [`BuiltinId`] is part of the bytecode format. The registry
//! holds two kinds of entries: functions (pushed as
//! `Value::BuiltinFunction`) and error sentinels (pushed as `Value::Error`
//! so scripts can compare against them with `isError`). The hidden
//! `:makeArray` entry backs destructuring assignment and is not reachable
//! by name from script source.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write as _};

use crate::errors::{ErrorKind, ErrorValue};
use crate::token::Token;
use crate::value::{ops, MapData, Value, UNDEFINED};

/// One invocation of a builtin or host function.
///
/// This is the canonical (rich) call convention: positional arguments, an
/// optional named-argument view, and the pieces of VM context a builtin
/// may touch (the globals value and the print sink). Positional-only
/// host functions are adapted via
/// [`HostFunction::positional`](crate::value::HostFunction::positional).
pub struct Call<'a> {
    pub args: &'a [Value],
    pub named: Option<&'a MapData>,
    pub globals: &'a Value,
    pub sink: &'a mut dyn io::Write,
}

impl<'a> Call<'a> {
    /// Positional argument `i`, `undefined` when absent.
    pub fn arg(&self, i: usize) -> &Value {
        self.args.get(i).unwrap_or(&UNDEFINED)
    }

    /// A named argument, when the caller supplied any.
    pub fn named_arg(&self, name: &str) -> Option<Value> {
        self.named.and_then(|m| m.get(name).cloned())
    }

    pub fn check_len(&self, want: usize) -> Result<(), ErrorValue> {
        if self.args.len() != want {
            return Err(wrong_num_args(&want.to_string(), self.args.len()));
        }
        Ok(())
    }

    pub fn check_range(&self, min: usize, max: usize) -> Result<(), ErrorValue> {
        if self.args.len() < min || self.args.len() > max {
            return Err(wrong_num_args(&format!("{min}..{max}"), self.args.len()));
        }
        Ok(())
    }

    pub fn check_min(&self, min: usize) -> Result<(), ErrorValue> {
        if self.args.len() < min {
            return Err(wrong_num_args(&format!(">={min}"), self.args.len()));
        }
        Ok(())
    }
}

pub fn wrong_num_args(want: &str, got: usize) -> ErrorValue {
    ErrorValue::with_message(
        ErrorKind::WrongNumArguments,
        format!("want={want} got={got}"),
    )
}

fn type_error(want: &str, got: &Value) -> ErrorValue {
    ErrorValue::with_message(
        ErrorKind::Type,
        format!("want {want}, got '{}'", got.type_name()),
    )
}

/// The implementation signature of a builtin.
pub type BuiltinFn = fn(&mut Call<'_>) -> Result<Value, ErrorValue>;

/// A registry entry for a callable builtin.
pub struct BuiltinDescriptor {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for BuiltinDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinDescriptor({})", self.name)
    }
}

/// Stable builtin ids; the discriminant is the `GetBuiltin` operand.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinId {
    Append = 0,
    Delete,
    Copy,
    Repeat,
    Contains,
    Len,
    Cap,
    Sort,
    SortReverse,
    Error,
    TypeName,
    Bool,
    Int,
    Uint,
    Float,
    Char,
    String,
    Bytes,
    Chars,
    Printf,
    Println,
    Sprintf,
    Globals,
    IsError,
    IsInt,
    IsUint,
    IsFloat,
    IsChar,
    IsBool,
    IsString,
    IsBytes,
    IsMap,
    IsSyncMap,
    IsArray,
    IsUndefined,
    IsFunction,
    IsCallable,
    IsIterable,

    // Error sentinels: pushed as error values, not callables.
    WrongNumArgumentsError,
    InvalidOperatorError,
    IndexOutOfBoundsError,
    NotIterableError,
    NotIndexableError,
    NotIndexAssignableError,
    NotCallableError,
    NotImplementedError,
    ZeroDivisionError,
    TypeError,

    /// Hidden: arranges destructuring right-hand sides. `:makeArray(n, v)`
    /// pads or truncates `v` (unpacking arrays) to exactly `n` elements.
    MakeArray,
}

/// Number of entries in the builtin id space.
pub const NUM_BUILTINS: usize = BuiltinId::MakeArray as usize + 1;

const NUM_SENTINELS: usize = 10;
const FIRST_SENTINEL: usize = BuiltinId::WrongNumArgumentsError as usize;

impl BuiltinId {
    pub fn from_u8(v: u8) -> Option<BuiltinId> {
        if (v as usize) < NUM_BUILTINS {
            // Discriminants are dense from 0; the table below pins them.
            Some(ALL_IDS[v as usize])
        } else {
            None
        }
    }

    /// Resolve a script-visible name to its id. The hidden `:makeArray`
    /// resolves too, but its name cannot be written as an identifier.
    pub fn lookup(name: &str) -> Option<BuiltinId> {
        ALL_IDS
            .iter()
            .find(|id| id.name() == name)
            .copied()
    }

    pub fn name(self) -> &'static str {
        let idx = self as usize;
        if idx < FIRST_SENTINEL {
            FUNCS[idx].name
        } else if idx < FIRST_SENTINEL + NUM_SENTINELS {
            self.sentinel_kind().name()
        } else {
            ":makeArray"
        }
    }

    /// The registry value pushed by `GetBuiltin`.
    pub fn value(self) -> Value {
        let idx = self as usize;
        if idx < FIRST_SENTINEL {
            Value::BuiltinFunction(&FUNCS[idx])
        } else if idx < FIRST_SENTINEL + NUM_SENTINELS {
            Value::error(ErrorValue::kind(self.sentinel_kind()))
        } else {
            Value::BuiltinFunction(&MAKE_ARRAY_DESC)
        }
    }

    fn sentinel_kind(self) -> ErrorKind {
        match self {
            BuiltinId::WrongNumArgumentsError => ErrorKind::WrongNumArguments,
            BuiltinId::InvalidOperatorError => ErrorKind::InvalidOperator,
            BuiltinId::IndexOutOfBoundsError => ErrorKind::IndexOutOfBounds,
            BuiltinId::NotIterableError => ErrorKind::NotIterable,
            BuiltinId::NotIndexableError => ErrorKind::NotIndexable,
            BuiltinId::NotIndexAssignableError => ErrorKind::NotIndexAssignable,
            BuiltinId::NotCallableError => ErrorKind::NotCallable,
            BuiltinId::NotImplementedError => ErrorKind::NotImplemented,
            BuiltinId::ZeroDivisionError => ErrorKind::ZeroDivision,
            BuiltinId::TypeError => ErrorKind::Type,
            _ => unreachable!("not a sentinel id"),
        }
    }
}

const ALL_IDS: [BuiltinId; NUM_BUILTINS] = [
    BuiltinId::Append,
    BuiltinId::Delete,
    BuiltinId::Copy,
    BuiltinId::Repeat,
    BuiltinId::Contains,
    BuiltinId::Len,
    BuiltinId::Cap,
    BuiltinId::Sort,
    BuiltinId::SortReverse,
    BuiltinId::Error,
    BuiltinId::TypeName,
    BuiltinId::Bool,
    BuiltinId::Int,
    BuiltinId::Uint,
    BuiltinId::Float,
    BuiltinId::Char,
    BuiltinId::String,
    BuiltinId::Bytes,
    BuiltinId::Chars,
    BuiltinId::Printf,
    BuiltinId::Println,
    BuiltinId::Sprintf,
    BuiltinId::Globals,
    BuiltinId::IsError,
    BuiltinId::IsInt,
    BuiltinId::IsUint,
    BuiltinId::IsFloat,
    BuiltinId::IsChar,
    BuiltinId::IsBool,
    BuiltinId::IsString,
    BuiltinId::IsBytes,
    BuiltinId::IsMap,
    BuiltinId::IsSyncMap,
    BuiltinId::IsArray,
    BuiltinId::IsUndefined,
    BuiltinId::IsFunction,
    BuiltinId::IsCallable,
    BuiltinId::IsIterable,
    BuiltinId::WrongNumArgumentsError,
    BuiltinId::InvalidOperatorError,
    BuiltinId::IndexOutOfBoundsError,
    BuiltinId::NotIterableError,
    BuiltinId::NotIndexableError,
    BuiltinId::NotIndexAssignableError,
    BuiltinId::NotCallableError,
    BuiltinId::NotImplementedError,
    BuiltinId::ZeroDivisionError,
    BuiltinId::TypeError,
    BuiltinId::MakeArray,
];

static FUNCS: [BuiltinDescriptor; FIRST_SENTINEL] = [
    BuiltinDescriptor { name: "append", func: builtin_append },
    BuiltinDescriptor { name: "delete", func: builtin_delete },
    BuiltinDescriptor { name: "copy", func: builtin_copy },
    BuiltinDescriptor { name: "repeat", func: builtin_repeat },
    BuiltinDescriptor { name: "contains", func: builtin_contains },
    BuiltinDescriptor { name: "len", func: builtin_len },
    BuiltinDescriptor { name: "cap", func: builtin_cap },
    BuiltinDescriptor { name: "sort", func: builtin_sort },
    BuiltinDescriptor { name: "sortReverse", func: builtin_sort_reverse },
    BuiltinDescriptor { name: "error", func: builtin_error },
    BuiltinDescriptor { name: "typeName", func: builtin_type_name },
    BuiltinDescriptor { name: "bool", func: builtin_bool },
    BuiltinDescriptor { name: "int", func: builtin_int },
    BuiltinDescriptor { name: "uint", func: builtin_uint },
    BuiltinDescriptor { name: "float", func: builtin_float },
    BuiltinDescriptor { name: "char", func: builtin_char },
    BuiltinDescriptor { name: "string", func: builtin_string },
    BuiltinDescriptor { name: "bytes", func: builtin_bytes },
    BuiltinDescriptor { name: "chars", func: builtin_chars },
    BuiltinDescriptor { name: "printf", func: builtin_printf },
    BuiltinDescriptor { name: "println", func: builtin_println },
    BuiltinDescriptor { name: "sprintf", func: builtin_sprintf },
    BuiltinDescriptor { name: "globals", func: builtin_globals },
    BuiltinDescriptor { name: "isError", func: builtin_is_error },
    BuiltinDescriptor { name: "isInt", func: |c| is_variant(c, |v| matches!(v, Value::Int(_))) },
    BuiltinDescriptor { name: "isUint", func: |c| is_variant(c, |v| matches!(v, Value::Uint(_))) },
    BuiltinDescriptor { name: "isFloat", func: |c| is_variant(c, |v| matches!(v, Value::Float(_))) },
    BuiltinDescriptor { name: "isChar", func: |c| is_variant(c, |v| matches!(v, Value::Char(_))) },
    BuiltinDescriptor { name: "isBool", func: |c| is_variant(c, |v| matches!(v, Value::Bool(_))) },
    BuiltinDescriptor { name: "isString", func: |c| is_variant(c, |v| matches!(v, Value::String(_))) },
    BuiltinDescriptor { name: "isBytes", func: |c| is_variant(c, |v| matches!(v, Value::Bytes(_))) },
    BuiltinDescriptor { name: "isMap", func: |c| is_variant(c, |v| matches!(v, Value::Map(_))) },
    BuiltinDescriptor { name: "isSyncMap", func: |c| is_variant(c, |v| matches!(v, Value::SyncMap(_))) },
    BuiltinDescriptor { name: "isArray", func: |c| is_variant(c, |v| matches!(v, Value::Array(_))) },
    BuiltinDescriptor { name: "isUndefined", func: |c| is_variant(c, |v| matches!(v, Value::Undefined)) },
    BuiltinDescriptor {
        name: "isFunction",
        func: |c| {
            is_variant(c, |v| {
                matches!(
                    v,
                    Value::Function(_) | Value::BuiltinFunction(_) | Value::CompiledFunction(_)
                )
            })
        },
    },
    BuiltinDescriptor { name: "isCallable", func: |c| is_variant(c, Value::is_callable) },
    BuiltinDescriptor { name: "isIterable", func: |c| is_variant(c, Value::is_iterable) },
];

static MAKE_ARRAY_DESC: BuiltinDescriptor = BuiltinDescriptor {
    name: ":makeArray",
    func: builtin_make_array,
};

fn is_variant(call: &mut Call<'_>, pred: impl Fn(&Value) -> bool) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(Value::Bool(pred(call.arg(0))))
}

// === container builtins ===

fn builtin_append(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_min(1)?;
    let target = call.arg(0);
    let items = &call.args[1..];
    match target {
        // append to undefined starts a fresh array.
        Value::Undefined => Ok(Value::array(items.to_vec())),
        Value::Array(arr) => {
            let mut out = arr.borrow().clone();
            out.extend(items.iter().cloned());
            Ok(Value::array(out))
        }
        Value::Bytes(bytes) => {
            let mut out = bytes.borrow().clone();
            for item in items {
                match item {
                    Value::Int(v) if (0..=255).contains(v) => out.push(*v as u8),
                    Value::Uint(v) if *v <= 255 => out.push(*v as u8),
                    Value::Char(c) if (*c as u32) <= 255 => out.push(*c as u8),
                    Value::Bytes(b) => out.extend_from_slice(&b.borrow()),
                    Value::String(s) => out.extend_from_slice(s.as_bytes()),
                    other => return Err(type_error("byte, bytes or string", other)),
                }
            }
            Ok(Value::bytes(out))
        }
        other => Err(type_error("array or bytes", other)),
    }
}

fn builtin_delete(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(2)?;
    crate::value::index::index_delete(call.arg(0), call.arg(1))?;
    Ok(UNDEFINED)
}

fn builtin_copy(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(call.arg(0).copy_value())
}

fn builtin_repeat(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(2)?;
    let count = match call.arg(1) {
        Value::Int(n) if *n >= 0 => *n as usize,
        Value::Uint(n) => *n as usize,
        other => return Err(type_error("non-negative int", other)),
    };
    match call.arg(0) {
        Value::String(s) => Ok(Value::string(s.as_str().repeat(count))),
        Value::Bytes(b) => Ok(Value::bytes(b.borrow().repeat(count))),
        Value::Array(a) => {
            let src = a.borrow();
            let mut out = Vec::with_capacity(src.len() * count);
            for _ in 0..count {
                out.extend(src.iter().cloned());
            }
            Ok(Value::array(out))
        }
        other => Err(type_error("string, bytes or array", other)),
    }
}

fn builtin_contains(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(2)?;
    let needle = call.arg(1);
    let found = match call.arg(0) {
        Value::String(s) => match needle {
            Value::Char(c) => s.contains(*c),
            other => s.contains(other.key_string().as_str()),
        },
        Value::Bytes(b) => {
            let hay = b.borrow();
            match needle {
                Value::Bytes(n) => {
                    let n = n.borrow();
                    n.is_empty() || hay.windows(n.len()).any(|w| w == n.as_slice())
                }
                Value::Int(v) if (0..=255).contains(v) => hay.contains(&(*v as u8)),
                other => {
                    let key = other.key_string();
                    let n = key.as_bytes();
                    n.is_empty() || hay.windows(n.len()).any(|w| w == n)
                }
            }
        }
        Value::Array(a) => a.borrow().iter().any(|v| v.equals(needle)),
        Value::Map(m) => m.borrow().contains_key(&needle.key_string()),
        Value::SyncMap(m) => crate::value::read_sync(m).contains_key(&needle.key_string()),
        Value::Undefined => false,
        other => return Err(type_error("container", other)),
    };
    Ok(Value::Bool(found))
}

fn builtin_len(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0).len() {
        Some(n) => Ok(Value::Int(n as i64)),
        None => Err(type_error("sized value", call.arg(0))),
    }
}

fn builtin_cap(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0).capacity() {
        Some(n) => Ok(Value::Int(n as i64)),
        None => Err(type_error("sized value", call.arg(0))),
    }
}

fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), ErrorValue> {
    let mut first_err: Option<ErrorValue> = None;
    items.sort_by(|a, b| {
        if first_err.is_some() {
            return Ordering::Equal;
        }
        let (a, b) = if reverse { (b, a) } else { (a, b) };
        match ops::compare(Token::Lss, a, b) {
            Ok(true) => Ordering::Less,
            Ok(false) => match ops::compare(Token::Lss, b, a) {
                Ok(true) => Ordering::Greater,
                Ok(false) => Ordering::Equal,
                Err(e) => {
                    first_err = Some(e);
                    Ordering::Equal
                }
            },
            Err(e) => {
                first_err = Some(e);
                Ordering::Equal
            }
        }
    });
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn sort_impl(call: &mut Call<'_>, reverse: bool) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Array(a) => {
            let mut items = a.borrow_mut();
            sort_values(&mut items, reverse)?;
            drop(items);
            Ok(call.arg(0).clone())
        }
        Value::String(s) => {
            let mut chars: Vec<char> = s.chars().collect();
            chars.sort_unstable();
            if reverse {
                chars.reverse();
            }
            Ok(Value::String(chars.into_iter().collect::<String>().into()))
        }
        Value::Bytes(b) => {
            let mut bytes = b.borrow_mut();
            bytes.sort_unstable();
            if reverse {
                bytes.reverse();
            }
            drop(bytes);
            Ok(call.arg(0).clone())
        }
        Value::Undefined => Ok(UNDEFINED),
        other => Err(type_error("array, string or bytes", other)),
    }
}

fn builtin_sort(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    sort_impl(call, false)
}

fn builtin_sort_reverse(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    sort_impl(call, true)
}

// === errors and reflection ===

fn builtin_error(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(Value::error(ErrorValue::new(call.arg(0).key_string())))
}

fn builtin_type_name(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(Value::string(call.arg(0).type_name()))
}

fn builtin_is_error(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_range(1, 2)?;
    let value = call.arg(0);
    if call.args.len() == 1 {
        return Ok(Value::Bool(matches!(
            value,
            Value::Error(_) | Value::RuntimeError(_)
        )));
    }
    // isError(e, target): walk e's cause chain looking for target.
    let target = match call.arg(1) {
        Value::Error(t) => t.clone(),
        Value::RuntimeError(t) => std::rc::Rc::new(t.error.clone()),
        other => return Err(type_error("error", other)),
    };
    Ok(Value::Bool(match value {
        Value::Error(e) => e.is_a(&target),
        Value::RuntimeError(e) => e.error.is_a(&target),
        _ => false,
    }))
}

fn builtin_globals(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(0)?;
    Ok(call.globals.clone())
}

// === conversions ===

fn builtin_bool(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(Value::Bool(!call.arg(0).is_falsy()))
}

fn parse_prefixed<T>(
    text: &str,
    parse: impl Fn(&str, u32) -> Option<T>,
) -> Option<T> {
    let t = text.trim();
    if let Some(h) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        parse(h, 16)
    } else if let Some(o) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        parse(o, 8)
    } else if let Some(b) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        parse(b, 2)
    } else {
        parse(t, 10)
    }
}

fn parse_int_text(text: &str) -> Option<i64> {
    let t = text.trim();
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let v = parse_prefixed(body, |s, radix| i64::from_str_radix(s, radix).ok())?;
    Some(if neg { v.wrapping_neg() } else { v })
}

fn builtin_int(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Uint(u) => Ok(Value::Int(*u as i64)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Char(c) => Ok(Value::Int(*c as u32 as i64)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::String(s) => parse_int_text(s)
            .map(Value::Int)
            .ok_or_else(|| conversion_error("int", s)),
        other => Err(type_error("convertible to int", other)),
    }
}

fn builtin_uint(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Uint(u) => Ok(Value::Uint(*u)),
        Value::Int(i) => Ok(Value::Uint(*i as u64)),
        Value::Float(f) => Ok(Value::Uint(*f as u64)),
        Value::Char(c) => Ok(Value::Uint(*c as u32 as u64)),
        Value::Bool(b) => Ok(Value::Uint(*b as u64)),
        Value::String(s) => {
            parse_prefixed(s.trim(), |t, radix| u64::from_str_radix(t, radix).ok())
                .map(Value::Uint)
                .ok_or_else(|| conversion_error("uint", s))
        }
        other => Err(type_error("convertible to uint", other)),
    }
}

fn builtin_float(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Uint(u) => Ok(Value::Float(*u as f64)),
        Value::Char(c) => Ok(Value::Float(*c as u32 as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as u8 as f64)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| conversion_error("float", s)),
        other => Err(type_error("convertible to float", other)),
    }
}

fn builtin_char(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Char(c) => Ok(Value::Char(*c)),
        Value::Int(i) => u32::try_from(*i)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(|| conversion_error("char", &i.to_string())),
        Value::Uint(u) => u32::try_from(*u)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(|| conversion_error("char", &u.to_string())),
        Value::String(s) => s
            .chars()
            .next()
            .map(Value::Char)
            .ok_or_else(|| conversion_error("char", "empty string")),
        other => Err(type_error("convertible to char", other)),
    }
}

fn builtin_string(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    Ok(Value::String(call.arg(0).key_string()))
}

fn builtin_bytes(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::Undefined => Ok(Value::bytes(Vec::new())),
        Value::Bytes(b) => Ok(Value::bytes(b.borrow().clone())),
        Value::String(s) => Ok(Value::bytes(s.as_bytes().to_vec())),
        Value::Int(n) if *n >= 0 => Ok(Value::bytes(vec![0u8; *n as usize])),
        Value::Uint(n) => Ok(Value::bytes(vec![0u8; *n as usize])),
        Value::Array(a) => {
            let mut out = Vec::with_capacity(a.borrow().len());
            for v in a.borrow().iter() {
                match v {
                    Value::Int(b) if (0..=255).contains(b) => out.push(*b as u8),
                    Value::Uint(b) if *b <= 255 => out.push(*b as u8),
                    other => return Err(type_error("array of bytes", other)),
                }
            }
            Ok(Value::bytes(out))
        }
        other => Err(type_error("convertible to bytes", other)),
    }
}

fn builtin_chars(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(1)?;
    match call.arg(0) {
        Value::String(s) => Ok(Value::array(s.chars().map(Value::Char).collect())),
        Value::Bytes(b) => match std::str::from_utf8(&b.borrow()) {
            Ok(s) => Ok(Value::array(s.chars().map(Value::Char).collect())),
            // Invalid UTF-8 yields undefined rather than an error.
            Err(_) => Ok(UNDEFINED),
        },
        other => Err(type_error("string or bytes", other)),
    }
}

fn conversion_error(target: &str, text: &str) -> ErrorValue {
    ErrorValue::with_message(
        ErrorKind::Type,
        format!("cannot convert {:?} to {target}", text),
    )
}

// === printing ===

fn builtin_printf(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_min(1)?;
    let format = match call.arg(0) {
        Value::String(s) => s.clone(),
        other => return Err(type_error("format string", other)),
    };
    let text = format_with(&format, &call.args[1..])?;
    call.sink
        .write_all(text.as_bytes())
        .map_err(|e| ErrorValue::new(format!("write failed: {e}")))?;
    Ok(UNDEFINED)
}

fn builtin_println(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    let mut line = String::new();
    for (i, arg) in call.args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&arg.to_string());
    }
    line.push('\n');
    call.sink
        .write_all(line.as_bytes())
        .map_err(|e| ErrorValue::new(format!("write failed: {e}")))?;
    Ok(UNDEFINED)
}

fn builtin_sprintf(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_min(1)?;
    let format = match call.arg(0) {
        Value::String(s) => s.clone(),
        other => return Err(type_error("format string", other)),
    };
    format_with(&format, &call.args[1..]).map(|s| Value::String(s.into()))
}

/// A small printf: `%v %s %d %f %g %t %q %c %x %%` with optional width
/// and precision (`%8.3f`). Missing arguments render Go-style as
/// `%!verb(MISSING)`.
fn format_with(format: &str, args: &[Value]) -> Result<String, ErrorValue> {
    use std::fmt::Write;

    let mut out = String::with_capacity(format.len() + 16);
    let mut chars = format.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut width = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            width.push(chars.next().unwrap());
        }
        let mut precision = String::new();
        if chars.peek() == Some(&'.') {
            chars.next();
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                precision.push(chars.next().unwrap());
            }
        }
        let Some(verb) = chars.next() else {
            out.push('%');
            break;
        };
        let arg = args.get(next_arg);
        next_arg += 1;
        let Some(arg) = arg else {
            let _ = write!(out, "%!{verb}(MISSING)");
            continue;
        };
        let width: usize = width.parse().unwrap_or(0);
        let prec: Option<usize> = precision.parse().ok();
        let rendered = match verb {
            'v' | 's' => arg.to_string(),
            'd' => match arg {
                Value::Int(i) => i.to_string(),
                Value::Uint(u) => u.to_string(),
                Value::Char(c) => (*c as u32).to_string(),
                Value::Bool(b) => (*b as u8).to_string(),
                Value::Float(f) => (*f as i64).to_string(),
                other => format!("%!d({})", other.type_name()),
            },
            'f' => {
                let f = arg.as_f64_lossy();
                match prec {
                    Some(p) => format!("{f:.p$}"),
                    None => format!("{f:.6}"),
                }
            }
            'g' => format!("{}", arg.as_f64_lossy()),
            't' => (!arg.is_falsy()).to_string(),
            'q' => match arg {
                Value::String(s) => format!("{:?}", s.as_str()),
                Value::Char(c) => format!("{c:?}"),
                other => format!("{:?}", other.to_string()),
            },
            'c' => match arg {
                Value::Char(c) => c.to_string(),
                Value::Int(i) => u32::try_from(*i)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| format!("%!c({i})")),
                other => format!("%!c({})", other.type_name()),
            },
            'x' => match arg {
                Value::Int(i) => format!("{i:x}"),
                Value::Uint(u) => format!("{u:x}"),
                Value::Bytes(b) => b.borrow().iter().map(|b| format!("{b:02x}")).collect(),
                Value::String(s) => s.bytes().map(|b| format!("{b:02x}")).collect(),
                other => format!("%!x({})", other.type_name()),
            },
            other => {
                let _ = write!(out, "%!{other}(UNKNOWN)");
                continue;
            }
        };
        if rendered.len() < width {
            for _ in 0..width - rendered.len() {
                out.push(' ');
            }
        }
        out.push_str(&rendered);
    }
    Ok(out)
}

// === destructuring support ===

/// `:makeArray(n, v)`: produce exactly `n` values for an n-ary
/// destructuring target. Arrays are padded with `undefined` or truncated;
/// any other value becomes the first element.
fn builtin_make_array(call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    call.check_len(2)?;
    let n = match call.arg(0) {
        Value::Int(n) if *n >= 0 => *n as usize,
        other => return Err(type_error("non-negative int", other)),
    };
    let out = match call.arg(1) {
        Value::Array(items) => {
            let items = items.borrow();
            let mut out: Vec<Value> = items.iter().take(n).cloned().collect();
            out.resize(n, UNDEFINED);
            out
        }
        other => {
            let mut out = vec![UNDEFINED; n];
            if n > 0 {
                out[0] = other.clone();
            }
            out
        }
    };
    Ok(Value::array(out))
}

/// Invoke a builtin descriptor directly (used by the VM and tests).
pub fn invoke(desc: &BuiltinDescriptor, call: &mut Call<'_>) -> Result<Value, ErrorValue> {
    (desc.func)(call)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_builtin(id: BuiltinId, args: &[Value]) -> Result<Value, ErrorValue> {
        let mut sink = Vec::new();
        let globals = UNDEFINED;
        let mut call = Call {
            args,
            named: None,
            globals: &globals,
            sink: &mut sink,
        };
        match id.value() {
            Value::BuiltinFunction(desc) => invoke(desc, &mut call),
            other => panic!("{id:?} is not callable: {other:?}"),
        }
    }

    #[test]
    fn test_id_space_is_dense_and_stable() {
        for (i, id) in ALL_IDS.iter().enumerate() {
            assert_eq!(*id as usize, i, "discriminant gap at {id:?}");
            assert_eq!(BuiltinId::from_u8(i as u8), Some(*id));
        }
        assert_eq!(BuiltinId::lookup("append"), Some(BuiltinId::Append));
        assert_eq!(BuiltinId::lookup("isIterable"), Some(BuiltinId::IsIterable));
        assert_eq!(
            BuiltinId::lookup("ZeroDivisionError"),
            Some(BuiltinId::ZeroDivisionError)
        );
        assert_eq!(BuiltinId::lookup("nope"), None);
    }

    #[test]
    fn test_sentinels_are_error_values() {
        match BuiltinId::TypeError.value() {
            Value::Error(e) => assert_eq!(e.name, "TypeError"),
            other => panic!("expected error value, got {other:?}"),
        }
    }

    #[test]
    fn test_append() {
        let arr = Value::array(vec![Value::Int(1)]);
        let out = call_builtin(BuiltinId::Append, &[arr.clone(), Value::Int(2)]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(1), Value::Int(2)]));
        // Source array untouched.
        assert_eq!(arr.len(), Some(1));

        let out = call_builtin(BuiltinId::Append, &[UNDEFINED, Value::Int(9)]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(9)]));
    }

    #[test]
    fn test_len_cap_invariant() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let len = call_builtin(BuiltinId::Len, &[arr.clone()]).unwrap();
        let cap = call_builtin(BuiltinId::Cap, &[arr]).unwrap();
        match (len, cap) {
            (Value::Int(l), Value::Int(c)) => assert!(c >= l),
            other => panic!("unexpected {other:?}"),
        }
        assert!(call_builtin(BuiltinId::Len, &[Value::Int(3)]).is_err());
    }

    #[test]
    fn test_copy_is_independent() {
        let m = Value::map(MapData::new());
        let copy = call_builtin(BuiltinId::Copy, &[m.clone()]).unwrap();
        if let Value::Map(inner) = &m {
            inner.borrow_mut().insert("k".into(), Value::Int(1));
        }
        assert_eq!(copy.len(), Some(0));
        assert_eq!(m.len(), Some(1));
    }

    #[test]
    fn test_conversions_roundtrip() {
        // int(string(n)) == n
        for n in [0i64, 1, -1, i64::MAX, i64::MIN] {
            let s = call_builtin(BuiltinId::String, &[Value::Int(n)]).unwrap();
            let back = call_builtin(BuiltinId::Int, &[s]).unwrap();
            assert_eq!(back, Value::Int(n));
        }
        // bytes(string(b)) == b for UTF-8 bytes
        let b = Value::bytes("héllo".as_bytes().to_vec());
        let s = call_builtin(BuiltinId::String, &[b.clone()]).unwrap();
        let back = call_builtin(BuiltinId::Bytes, &[s]).unwrap();
        assert!(back.equals(&b));

        assert_eq!(
            call_builtin(BuiltinId::Int, &[Value::string("0x10")]).unwrap(),
            Value::Int(16)
        );
        assert!(call_builtin(BuiltinId::Int, &[Value::string("zz")]).is_err());
    }

    #[test]
    fn test_char_and_chars() {
        assert_eq!(
            call_builtin(BuiltinId::Char, &[Value::Int(97)]).unwrap(),
            Value::Char('a')
        );
        assert_eq!(
            call_builtin(BuiltinId::Chars, &[Value::string("ab")]).unwrap(),
            Value::array(vec![Value::Char('a'), Value::Char('b')])
        );
    }

    #[test]
    fn test_sort_and_reverse() {
        let arr = Value::array(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        let out = call_builtin(BuiltinId::Sort, &[arr]).unwrap();
        assert_eq!(
            out,
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let arr = Value::array(vec![Value::Int(1), Value::Int(3)]);
        let out = call_builtin(BuiltinId::SortReverse, &[arr]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(3), Value::Int(1)]));
        // Unorderable elements error out.
        let arr = Value::array(vec![Value::Int(1), Value::map(MapData::new())]);
        assert!(call_builtin(BuiltinId::Sort, &[arr]).is_err());
    }

    #[test]
    fn test_is_predicates() {
        assert_eq!(
            call_builtin(BuiltinId::IsInt, &[Value::Int(1)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_builtin(BuiltinId::IsInt, &[Value::Uint(1)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            call_builtin(BuiltinId::IsUndefined, &[UNDEFINED]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_builtin(BuiltinId::IsIterable, &[Value::string("x")]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_is_error_with_sentinel() {
        let sentinel = BuiltinId::ZeroDivisionError.value();
        let derived = match &sentinel {
            Value::Error(e) => Value::error(e.derive("while dividing")),
            _ => unreachable!(),
        };
        assert_eq!(
            call_builtin(BuiltinId::IsError, &[derived.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_builtin(BuiltinId::IsError, &[derived, sentinel.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_builtin(
                BuiltinId::IsError,
                &[Value::error(ErrorValue::new("other")), sentinel]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_println_writes_to_sink() {
        let mut sink = Vec::new();
        let globals = UNDEFINED;
        let mut call = Call {
            args: &[Value::string("f")],
            named: None,
            globals: &globals,
            sink: &mut sink,
        };
        builtin_println(&mut call).unwrap();
        assert_eq!(sink, b"f\n");
    }

    #[test]
    fn test_sprintf() {
        let out = call_builtin(
            BuiltinId::Sprintf,
            &[
                Value::string("%d + %s = %v!"),
                Value::Int(1),
                Value::string("two"),
                Value::Float(3.0),
            ],
        )
        .unwrap();
        assert_eq!(out, Value::string("1 + two = 3!"));

        let out = call_builtin(
            BuiltinId::Sprintf,
            &[Value::string("%.2f|%q|%x"), Value::Float(1.5), Value::string("a"), Value::Int(255)],
        )
        .unwrap();
        assert_eq!(out, Value::string("1.50|\"a\"|ff"));

        let out = call_builtin(BuiltinId::Sprintf, &[Value::string("%d")]).unwrap();
        assert_eq!(out, Value::string("%!d(MISSING)"));
    }

    #[test]
    fn test_make_array_pads_and_truncates() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = call_builtin(BuiltinId::MakeArray, &[Value::Int(2), arr.clone()]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(1), Value::Int(2)]));

        let out = call_builtin(BuiltinId::MakeArray, &[Value::Int(4), arr]).unwrap();
        assert_eq!(out.len(), Some(4));

        let out = call_builtin(BuiltinId::MakeArray, &[Value::Int(2), Value::Int(7)]).unwrap();
        assert_eq!(out, Value::array(vec![Value::Int(7), UNDEFINED]));
    }

    #[test]
    fn test_contains() {
        assert_eq!(
            call_builtin(
                BuiltinId::Contains,
                &[Value::string("hello"), Value::string("ell")]
            )
            .unwrap(),
            Value::Bool(true)
        );
        let arr = Value::array(vec![Value::Int(1), Value::string("x")]);
        assert_eq!(
            call_builtin(BuiltinId::Contains, &[arr, Value::string("x")]).unwrap(),
            Value::Bool(true)
        );
        let mut data = MapData::new();
        data.insert("k".into(), Value::Int(1));
        assert_eq!(
            call_builtin(BuiltinId::Contains, &[Value::map(data), Value::string("k")]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_repeat() {
        assert_eq!(
            call_builtin(BuiltinId::Repeat, &[Value::string("ab"), Value::Int(3)]).unwrap(),
            Value::string("ababab")
        );
        assert!(call_builtin(BuiltinId::Repeat, &[Value::string("a"), Value::Int(-1)]).is_err());
    }
}
