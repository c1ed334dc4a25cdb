//! Indexing and slicing over runtime values.
//!
//! Bounds rules: an undefined map key reads as `Undefined`, an
//! out-of-range index into an ordered sequence is `IndexOutOfBounds`, and
//! a slice needs `0 <= low <= high <= len` or it is `InvalidIndex`.
//! Selector chains off `Undefined` stay `Undefined` (`undefined.a.b`).

use std::rc::Rc;

use crate::errors::{ErrorKind, ErrorValue};
use crate::value::{read_sync, write_sync, HostFunction, Value, UNDEFINED};

/// `target[index]`.
pub fn index_get(target: &Value, index: &Value) -> Result<Value, ErrorValue> {
    match target {
        // undefined[x] and undefined.x are undefined, not errors.
        Value::Undefined => Ok(UNDEFINED),
        Value::Array(items) => {
            let items = items.borrow();
            let i = seq_index(index, items.len())?;
            Ok(items[i].clone())
        }
        Value::Bytes(bytes) => {
            let bytes = bytes.borrow();
            let i = seq_index(index, bytes.len())?;
            Ok(Value::Int(bytes[i] as i64))
        }
        Value::String(s) => {
            let i = seq_index(index, s.len())?;
            Ok(Value::Int(s.as_bytes()[i] as i64))
        }
        Value::Map(m) => Ok(m
            .borrow()
            .get(&index.key_string())
            .cloned()
            .unwrap_or(UNDEFINED)),
        Value::SyncMap(m) => Ok(read_sync(m)
            .get(&index.key_string())
            .cloned()
            .unwrap_or(UNDEFINED)),
        Value::Error(e) => {
            // Errors expose Name, Message, Cause, and the New deriver.
            match index.key_string().as_str() {
                "Name" => Ok(Value::String(e.name.clone())),
                "Message" => Ok(Value::String(e.message.clone())),
                "Cause" => Ok(e
                    .cause
                    .as_ref()
                    .map(|c| Value::Error(c.clone()))
                    .unwrap_or(UNDEFINED)),
                "New" => Ok(error_deriver(e.clone())),
                _ => Ok(UNDEFINED),
            }
        }
        Value::RuntimeError(e) => match index.key_string().as_str() {
            "Name" => Ok(Value::String(e.error.name.clone())),
            "Message" => Ok(Value::String(e.error.message.clone())),
            "Cause" => Ok(e
                .error
                .cause
                .as_ref()
                .map(|c| Value::Error(c.clone()))
                .unwrap_or(UNDEFINED)),
            "New" => Ok(error_deriver(Rc::new(e.error.clone()))),
            _ => Ok(UNDEFINED),
        },
        Value::ObjectPtr(p) => index_get(&p.get(), index),
        Value::Foreign(obj) => obj.index_get(index),
        other => Err(ErrorValue::with_message(
            ErrorKind::NotIndexable,
            format!("'{}' is not indexable", other.type_name()),
        )),
    }
}

/// `target[index] = value`.
pub fn index_set(target: &Value, index: &Value, value: Value) -> Result<(), ErrorValue> {
    match target {
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            let i = seq_index(index, items.len())?;
            items[i] = value;
            Ok(())
        }
        Value::Bytes(bytes) => {
            let mut bytes = bytes.borrow_mut();
            let i = seq_index(index, bytes.len())?;
            let byte = match &value {
                Value::Int(v) if (0..=255).contains(v) => *v as u8,
                Value::Uint(v) if *v <= 255 => *v as u8,
                other => {
                    return Err(ErrorValue::with_message(
                        ErrorKind::Type,
                        format!("bytes element must be an int in 0..256, got '{}'", other.type_name()),
                    ));
                }
            };
            bytes[i] = byte;
            Ok(())
        }
        Value::Map(m) => {
            m.borrow_mut().insert(index.key_string(), value);
            Ok(())
        }
        Value::SyncMap(m) => {
            write_sync(m).insert(index.key_string(), value);
            Ok(())
        }
        Value::ObjectPtr(p) => index_set(&p.get(), index, value),
        Value::Foreign(obj) => obj.index_set(index, value),
        other => Err(ErrorValue::with_message(
            ErrorKind::NotIndexAssignable,
            format!("'{}' is not index assignable", other.type_name()),
        )),
    }
}

/// The bound `New` method of an error value: derives a new error with the
/// original as its cause, keeping sentinel identity for `isError`.
fn error_deriver(source: Rc<ErrorValue>) -> Value {
    Value::Function(Rc::new(HostFunction::new("New", move |call| {
        call.check_min(1)?;
        let mut message = String::new();
        for (i, arg) in call.args.iter().enumerate() {
            if i > 0 {
                message.push(' ');
            }
            message.push_str(&arg.to_string());
        }
        Ok(Value::error(source.derive(message)))
    })))
}

/// Remove a map key; a missing key is not an error.
pub fn index_delete(target: &Value, index: &Value) -> Result<(), ErrorValue> {
    match target {
        Value::Map(m) => {
            m.borrow_mut().remove(&index.key_string());
            Ok(())
        }
        Value::SyncMap(m) => {
            write_sync(m).remove(&index.key_string());
            Ok(())
        }
        Value::ObjectPtr(p) => index_delete(&p.get(), index),
        other => Err(ErrorValue::with_message(
            ErrorKind::Type,
            format!("cannot delete from '{}'", other.type_name()),
        )),
    }
}

/// `target[low:high]`. `Undefined` bounds default to 0 and `len`.
pub fn slice(target: &Value, low: &Value, high: &Value) -> Result<Value, ErrorValue> {
    let len = match target.len() {
        Some(n) if !matches!(target, Value::Map(_) | Value::SyncMap(_)) => n,
        _ => {
            return Err(ErrorValue::with_message(
                ErrorKind::NotIndexable,
                format!("'{}' cannot be sliced", target.type_name()),
            ));
        }
    };
    let low = slice_bound(low, 0, len)?;
    let high = slice_bound(high, len, len)?;
    if low > high {
        return Err(ErrorValue::with_message(
            ErrorKind::InvalidIndex,
            format!("invalid slice bounds [{}:{}]", low, high),
        ));
    }
    Ok(match target {
        Value::Array(items) => Value::array(items.borrow()[low..high].to_vec()),
        Value::Bytes(bytes) => Value::bytes(bytes.borrow()[low..high].to_vec()),
        Value::String(s) => {
            // Byte-oriented slicing; a split UTF-8 sequence is the
            // script's own problem, as with byte indexing.
            match std::str::from_utf8(&s.as_bytes()[low..high]) {
                Ok(sub) => Value::string(sub),
                Err(_) => Value::bytes(s.as_bytes()[low..high].to_vec()),
            }
        }
        _ => unreachable!("sliceable targets handled above"),
    })
}

/// Validate a sequence index: int-like, in `0..len`.
fn seq_index(index: &Value, len: usize) -> Result<usize, ErrorValue> {
    let i = int_index(index)?;
    if i < 0 || i as usize >= len {
        return Err(ErrorValue::with_message(
            ErrorKind::IndexOutOfBounds,
            format!("index {} out of bounds for length {}", i, len),
        ));
    }
    Ok(i as usize)
}

fn slice_bound(v: &Value, default: usize, len: usize) -> Result<usize, ErrorValue> {
    if matches!(v, Value::Undefined) {
        return Ok(default);
    }
    let i = int_index(v)?;
    if i < 0 || i as usize > len {
        return Err(ErrorValue::with_message(
            ErrorKind::InvalidIndex,
            format!("slice bound {} out of range for length {}", i, len),
        ));
    }
    Ok(i as usize)
}

fn int_index(v: &Value) -> Result<i64, ErrorValue> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Uint(u) => i64::try_from(*u).map_err(|_| {
            ErrorValue::with_message(ErrorKind::IndexOutOfBounds, "index overflows int")
        }),
        Value::Char(c) => Ok(*c as u32 as i64),
        Value::ObjectPtr(p) => int_index(&p.get()),
        other => Err(ErrorValue::with_message(
            ErrorKind::Type,
            format!("index must be int, got '{}'", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapData;

    #[test]
    fn test_array_indexing() {
        let a = Value::array(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(index_get(&a, &Value::Int(1)).unwrap(), Value::Int(20));
        let err = index_get(&a, &Value::Int(2)).unwrap_err();
        assert!(err.is_kind(ErrorKind::IndexOutOfBounds));
        let err = index_get(&a, &Value::Int(-1)).unwrap_err();
        assert!(err.is_kind(ErrorKind::IndexOutOfBounds));

        index_set(&a, &Value::Int(0), Value::Int(7)).unwrap();
        assert_eq!(index_get(&a, &Value::Int(0)).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_map_missing_key_is_undefined() {
        let m = Value::map(MapData::new());
        assert_eq!(index_get(&m, &Value::string("k")).unwrap(), UNDEFINED);
        index_set(&m, &Value::string("k"), Value::Int(1)).unwrap();
        assert_eq!(index_get(&m, &Value::string("k")).unwrap(), Value::Int(1));
        // Keys are stringified: m[1] and m["1"] collide.
        index_set(&m, &Value::Int(1), Value::Int(9)).unwrap();
        assert_eq!(index_get(&m, &Value::string("1")).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_undefined_chains() {
        assert_eq!(index_get(&UNDEFINED, &Value::Int(0)).unwrap(), UNDEFINED);
        let inner = index_get(&UNDEFINED, &Value::string("a")).unwrap();
        assert_eq!(index_get(&inner, &Value::string("b")).unwrap(), UNDEFINED);
    }

    #[test]
    fn test_string_byte_index() {
        let s = Value::string("x");
        assert_eq!(index_get(&s, &Value::Int(0)).unwrap(), Value::Int(b'x' as i64));
        let err = index_get(&s, &Value::Int(1)).unwrap_err();
        assert!(err.is_kind(ErrorKind::IndexOutOfBounds));
        // Strings are immutable.
        let err = index_set(&s, &Value::Int(0), Value::Int(65)).unwrap_err();
        assert!(err.is_kind(ErrorKind::NotIndexAssignable));
    }

    #[test]
    fn test_bytes_index_set_range() {
        let b = Value::bytes(vec![0u8, 1]);
        index_set(&b, &Value::Int(0), Value::Int(255)).unwrap();
        let err = index_set(&b, &Value::Int(0), Value::Int(256)).unwrap_err();
        assert!(err.is_kind(ErrorKind::Type));
    }

    #[test]
    fn test_slices() {
        let a = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(
            slice(&a, &Value::Int(1), &Value::Int(3)).unwrap(),
            Value::array(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            slice(&a, &UNDEFINED, &UNDEFINED).unwrap().len(),
            Some(3)
        );
        let err = slice(&a, &Value::Int(2), &Value::Int(1)).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidIndex));
        let err = slice(&a, &Value::Int(0), &Value::Int(4)).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidIndex));

        assert_eq!(
            slice(&Value::string("hello"), &Value::Int(1), &Value::Int(3)).unwrap(),
            Value::string("el")
        );
    }

    #[test]
    fn test_error_fields() {
        let e = Value::error(ErrorValue::named("TypeError", "bad"));
        assert_eq!(
            index_get(&e, &Value::string("Message")).unwrap(),
            Value::string("bad")
        );
        assert_eq!(
            index_get(&e, &Value::string("Name")).unwrap(),
            Value::string("TypeError")
        );
        assert_eq!(index_get(&e, &Value::string("Cause")).unwrap(), UNDEFINED);
    }
}
