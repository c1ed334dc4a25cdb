//! The iteration protocol behind `for k, v in x`.
//!
//! `IterInit` builds a [`ValueIterator`]; `IterNext` advances it and
//! reports whether a current pair exists; `IterKey`/`IterValue` read the
//! current pair. Arrays iterate in index order with `Int` keys, strings in
//! byte-offset order with `Char` values, bytes in index order with `Int`
//! values, and maps in unspecified order with `String` keys.
//!
//! Map iterators snapshot the key set at creation: entries inserted during
//! iteration may or may not be seen, removed entries read as `Undefined`.
//! A sync map snapshots under a single read-lock acquisition and takes a
//! short read lock per step.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use ecow::EcoString;

use crate::errors::{ErrorKind, ErrorValue};
use crate::value::{read_sync, MapData, Value, UNDEFINED};

/// A live iterator over one iterable value.
#[derive(Debug)]
pub enum ValueIterator {
    Array {
        items: Rc<RefCell<Vec<Value>>>,
        /// Index of the current element; `None` before the first `next`.
        cur: Option<usize>,
    },
    Map {
        map: Rc<RefCell<MapData>>,
        keys: Vec<EcoString>,
        cur: Option<usize>,
    },
    SyncMap {
        map: Arc<RwLock<MapData>>,
        keys: Vec<EcoString>,
        cur: Option<usize>,
    },
    Str {
        s: EcoString,
        /// Byte offset of the current char and the char itself.
        cur: Option<(usize, char)>,
        next_offset: usize,
    },
    Bytes {
        bytes: Rc<RefCell<Vec<u8>>>,
        cur: Option<usize>,
    },
}

impl ValueIterator {
    /// Build an iterator for `v`, or `NotIterable`.
    pub fn new(v: &Value) -> Result<ValueIterator, ErrorValue> {
        match v {
            Value::Array(items) => Ok(ValueIterator::Array {
                items: items.clone(),
                cur: None,
            }),
            Value::Map(map) => {
                let keys = map.borrow().keys().cloned().collect();
                Ok(ValueIterator::Map {
                    map: map.clone(),
                    keys,
                    cur: None,
                })
            }
            Value::SyncMap(map) => {
                let keys = read_sync(map).keys().cloned().collect();
                Ok(ValueIterator::SyncMap {
                    map: map.clone(),
                    keys,
                    cur: None,
                })
            }
            Value::String(s) => Ok(ValueIterator::Str {
                s: s.clone(),
                cur: None,
                next_offset: 0,
            }),
            Value::Bytes(bytes) => Ok(ValueIterator::Bytes {
                bytes: bytes.clone(),
                cur: None,
            }),
            Value::ObjectPtr(p) => ValueIterator::new(&p.get()),
            other => Err(ErrorValue::with_message(
                ErrorKind::NotIterable,
                format!("'{}' is not iterable", other.type_name()),
            )),
        }
    }

    /// Advance to the next element. Returns false when exhausted.
    pub fn next(&mut self) -> bool {
        match self {
            ValueIterator::Array { items, cur } => {
                let next = cur.map(|i| i + 1).unwrap_or(0);
                if next < items.borrow().len() {
                    *cur = Some(next);
                    true
                } else {
                    false
                }
            }
            ValueIterator::Map { keys, cur, .. } | ValueIterator::SyncMap { keys, cur, .. } => {
                let next = cur.map(|i| i + 1).unwrap_or(0);
                if next < keys.len() {
                    *cur = Some(next);
                    true
                } else {
                    false
                }
            }
            ValueIterator::Str {
                s,
                cur,
                next_offset,
            } => match s[*next_offset..].chars().next() {
                Some(c) => {
                    *cur = Some((*next_offset, c));
                    *next_offset += c.len_utf8();
                    true
                }
                None => false,
            },
            ValueIterator::Bytes { bytes, cur } => {
                let next = cur.map(|i| i + 1).unwrap_or(0);
                if next < bytes.borrow().len() {
                    *cur = Some(next);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// The current key; `Undefined` before the first `next`.
    pub fn key(&self) -> Value {
        match self {
            ValueIterator::Array { cur, .. } | ValueIterator::Bytes { cur, .. } => cur
                .map(|i| Value::Int(i as i64))
                .unwrap_or(UNDEFINED),
            ValueIterator::Map { keys, cur, .. } | ValueIterator::SyncMap { keys, cur, .. } => cur
                .map(|i| Value::String(keys[i].clone()))
                .unwrap_or(UNDEFINED),
            ValueIterator::Str { cur, .. } => cur
                .map(|(off, _)| Value::Int(off as i64))
                .unwrap_or(UNDEFINED),
        }
    }

    /// The current value; `Undefined` before the first `next`.
    pub fn value(&self) -> Value {
        match self {
            ValueIterator::Array { items, cur } => cur
                .and_then(|i| items.borrow().get(i).cloned())
                .unwrap_or(UNDEFINED),
            ValueIterator::Map { map, keys, cur } => cur
                .and_then(|i| map.borrow().get(&keys[i]).cloned())
                .unwrap_or(UNDEFINED),
            ValueIterator::SyncMap { map, keys, cur } => cur
                .and_then(|i| read_sync(map).get(&keys[i]).cloned())
                .unwrap_or(UNDEFINED),
            ValueIterator::Str { cur, .. } => {
                cur.map(|(_, c)| Value::Char(c)).unwrap_or(UNDEFINED)
            }
            ValueIterator::Bytes { bytes, cur } => cur
                .and_then(|i| bytes.borrow().get(i).copied())
                .map(|b| Value::Int(b as i64))
                .unwrap_or(UNDEFINED),
        }
    }
}
