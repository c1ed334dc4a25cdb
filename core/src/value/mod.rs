//! The runtime value model.
//!
//! Every value a script can touch is one variant of the closed [`Value`]
//! enum. Operator dispatch, indexing, and iteration live in the sibling
//! modules ([`ops`], [`index`], [`iter`]); this module defines the variants
//! themselves, falsiness, stringification, equality, and the shared-cell
//! indirection used for closure capture.
//!
//! Mutable containers (`Bytes`, `Array`, `Map`, `SyncMap`) are shared by
//! reference: cloning a `Value` clones a handle, not the contents. Host
//! extension goes through the single [`ForeignObject`] trait-object
//! variant.

pub mod index;
pub mod iter;
pub mod ops;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use ecow::EcoString;

use crate::builtins::{BuiltinDescriptor, Call};
use crate::bytecode::CompiledFunction;
use crate::errors::{ErrorKind, ErrorValue, RuntimeError};
use crate::token::Token;
use crate::value::iter::ValueIterator;

/// The map payload shared by `Map` and `SyncMap`. Keys are always the
/// stringification of the index expression.
pub type MapData = hashbrown::HashMap<EcoString, Value>;

/// The singleton undefined value, usable in const contexts.
pub const UNDEFINED: Value = Value::Undefined;

/// A heap cell sharing one binding between a frame and the closures that
/// captured it. Cloning the pointer aliases the cell.
#[derive(Clone)]
pub struct ObjectPtr(Rc<RefCell<Value>>);

impl ObjectPtr {
    pub fn new(value: Value) -> Self {
        ObjectPtr(Rc::new(RefCell::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    /// Identity: two pointers are the same cell.
    pub fn same_cell(&self, other: &ObjectPtr) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:?})", self.0.borrow())
    }
}

/// A host-supplied callable.
pub struct HostFunction {
    pub name: EcoString,
    func: Box<dyn Fn(&mut Call<'_>) -> Result<Value, ErrorValue>>,
}

impl HostFunction {
    /// The canonical call convention: the function receives the full
    /// [`Call`] (positional args, optional named args, VM context).
    pub fn new(
        name: impl Into<EcoString>,
        func: impl Fn(&mut Call<'_>) -> Result<Value, ErrorValue> + 'static,
    ) -> Self {
        HostFunction {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// Adapter for the legacy positional-only convention.
    pub fn positional(
        name: impl Into<EcoString>,
        func: impl Fn(&[Value]) -> Result<Value, ErrorValue> + 'static,
    ) -> Self {
        HostFunction {
            name: name.into(),
            func: Box::new(move |call| func(call.args)),
        }
    }

    pub fn invoke(&self, call: &mut Call<'_>) -> Result<Value, ErrorValue> {
        (self.func)(call)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

/// Host extension point: a named object with an overridable operation
/// table. Everything defaults to the matching "not supported" error, so a
/// foreign type only implements what it means.
pub trait ForeignObject {
    /// Type name reported by `typeName` and used in error messages.
    fn type_name(&self) -> &'static str;

    fn is_falsy(&self) -> bool {
        false
    }

    fn to_display(&self) -> String {
        format!("<{}>", self.type_name())
    }

    fn binary_op(&self, op: Token, _rhs: &Value) -> Result<Value, ErrorValue> {
        Err(ErrorValue::with_message(
            ErrorKind::InvalidOperator,
            format!("operator '{}' not supported by {}", op, self.type_name()),
        ))
    }

    fn index_get(&self, _index: &Value) -> Result<Value, ErrorValue> {
        Err(ErrorValue::with_message(
            ErrorKind::NotIndexable,
            format!("{} is not indexable", self.type_name()),
        ))
    }

    fn index_set(&self, _index: &Value, _value: Value) -> Result<(), ErrorValue> {
        Err(ErrorValue::with_message(
            ErrorKind::NotIndexAssignable,
            format!("{} is not index assignable", self.type_name()),
        ))
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&self, _call: &mut Call<'_>) -> Result<Value, ErrorValue> {
        Err(ErrorValue::with_message(
            ErrorKind::NotCallable,
            format!("{} is not callable", self.type_name()),
        ))
    }
}

/// A runtime value. The set is closed; host extension goes through
/// [`Value::Foreign`].
#[derive(Clone)]
pub enum Value {
    Undefined,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(char),
    String(EcoString),
    Bytes(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<MapData>>),
    SyncMap(Arc<RwLock<MapData>>),
    Error(Rc<ErrorValue>),
    RuntimeError(Box<RuntimeError>),
    Function(Rc<HostFunction>),
    BuiltinFunction(&'static BuiltinDescriptor),
    CompiledFunction(Rc<CompiledFunction>),
    ObjectPtr(ObjectPtr),
    /// The opaque iterator handle pushed by `IterInit`. Not constructible
    /// from script syntax.
    Iterator(Rc<RefCell<ValueIterator>>),
    Foreign(Rc<dyn ForeignObject>),
}

impl Value {
    pub fn string(s: impl Into<EcoString>) -> Value {
        Value::String(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(Rc::new(RefCell::new(b.into())))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn map(data: MapData) -> Value {
        Value::Map(Rc::new(RefCell::new(data)))
    }

    pub fn sync_map(data: MapData) -> Value {
        Value::SyncMap(Arc::new(RwLock::new(data)))
    }

    pub fn error(err: ErrorValue) -> Value {
        Value::Error(Rc::new(err))
    }

    pub fn error_kind(kind: ErrorKind) -> Value {
        Value::Error(Rc::new(ErrorValue::kind(kind)))
    }

    /// The name reported by the `typeName` builtin.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::SyncMap(_) => "sync-map",
            Value::Error(_) => "error",
            Value::RuntimeError(_) => "runtime-error",
            Value::Function(_) => "function",
            Value::BuiltinFunction(_) => "builtin-function",
            Value::CompiledFunction(_) => "compiled-function",
            Value::ObjectPtr(_) => "object-ptr",
            Value::Iterator(_) => "iterator",
            Value::Foreign(obj) => obj.type_name(),
        }
    }

    /// Truthiness, per variant: empty containers, zero numerics, `false`,
    /// NaN, errors, and `Undefined` are falsy; callables never are.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Undefined => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Uint(u) => *u == 0,
            Value::Float(f) => f.is_nan(),
            Value::Char(c) => *c == '\0',
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.borrow().is_empty(),
            Value::Array(a) => a.borrow().is_empty(),
            Value::Map(m) => m.borrow().is_empty(),
            Value::SyncMap(m) => read_sync(m).is_empty(),
            Value::Error(_) | Value::RuntimeError(_) => true,
            Value::Function(_) | Value::BuiltinFunction(_) | Value::CompiledFunction(_) => false,
            Value::ObjectPtr(p) => p.get().is_falsy(),
            Value::Iterator(_) => false,
            Value::Foreign(obj) => obj.is_falsy(),
        }
    }

    /// Number of elements for sized variants; `None` for the rest.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.len()),
            Value::Bytes(b) => Some(b.borrow().len()),
            Value::Array(a) => Some(a.borrow().len()),
            Value::Map(m) => Some(m.borrow().len()),
            Value::SyncMap(m) => Some(read_sync(m).len()),
            _ => None,
        }
    }

    /// Backing capacity for array and bytes; equals `len` elsewhere.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            Value::Bytes(b) => Some(b.borrow().capacity()),
            Value::Array(a) => Some(a.borrow().capacity()),
            _ => self.len(),
        }
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Value::Function(_) | Value::BuiltinFunction(_) | Value::CompiledFunction(_) => true,
            Value::Foreign(obj) => obj.is_callable(),
            Value::ObjectPtr(p) => p.get().is_callable(),
            _ => false,
        }
    }

    pub fn is_iterable(&self) -> bool {
        matches!(
            self,
            Value::String(_)
                | Value::Bytes(_)
                | Value::Array(_)
                | Value::Map(_)
                | Value::SyncMap(_)
        )
    }

    /// The map-key form of this value: its plain stringification.
    pub fn key_string(&self) -> EcoString {
        match self {
            Value::String(s) => s.clone(),
            other => EcoString::from(other.to_string()),
        }
    }

    /// Deep-ish copy for the `copy` builtin: mutable containers get an
    /// independent top-level container (elements are aliased handles);
    /// everything else is a handle clone already.
    pub fn copy_value(&self) -> Value {
        match self {
            Value::Bytes(b) => Value::bytes(b.borrow().clone()),
            Value::Array(a) => Value::array(a.borrow().clone()),
            Value::Map(m) => Value::map(m.borrow().clone()),
            Value::SyncMap(m) => Value::sync_map(read_sync(m).clone()),
            other => other.clone(),
        }
    }

    /// Structural equality with the numeric coercion set of the language:
    /// `{Bool, Int, Uint, Float, Char}` compare by numeric value, `String`
    /// and `Bytes` compare byte-wise (also against each other), containers
    /// compare element-wise, callables by identity.
    pub fn equals(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Undefined, Undefined) => true,
            (ObjectPtr(p), o) => p.get().equals(o),
            (s, ObjectPtr(p)) => s.equals(&p.get()),
            (a, b) if a.is_numeric() && b.is_numeric() => numeric_eq(a, b),
            (String(a), String(b)) => a == b,
            (String(a), Bytes(b)) => a.as_bytes() == b.borrow().as_slice(),
            (Bytes(a), String(b)) => a.borrow().as_slice() == b.as_bytes(),
            (Bytes(a), Bytes(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Array(a), Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Map(a), Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                map_eq(&a.borrow(), &b.borrow())
            }
            (SyncMap(a), SyncMap(b)) => {
                Arc::ptr_eq(a, b) || map_eq(&read_sync(a), &read_sync(b))
            }
            (Map(a), SyncMap(b)) => map_eq(&a.borrow(), &read_sync(b)),
            (SyncMap(a), Map(b)) => map_eq(&read_sync(a), &b.borrow()),
            (Error(a), Error(b)) => a.name == b.name && a.message == b.message,
            (RuntimeError(a), RuntimeError(b)) => a.error == b.error,
            (Function(a), Function(b)) => Rc::ptr_eq(a, b),
            (BuiltinFunction(a), BuiltinFunction(b)) => std::ptr::eq(*a, *b),
            (CompiledFunction(a), CompiledFunction(b)) => Rc::ptr_eq(a, b),
            (Foreign(a), Foreign(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether this variant belongs to the numeric coercion set.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Bool(_) | Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Char(_)
        )
    }
}

fn numeric_eq(a: &Value, b: &Value) -> bool {
    // Floats force float comparison; otherwise compare exactly in i128
    // space so u64::MAX does not collide with -1.
    if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
        a.as_f64_lossy() == b.as_f64_lossy()
    } else {
        a.as_i128() == b.as_i128()
    }
}

fn map_eq(a: &MapData, b: &MapData) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| v.equals(other)))
}

impl Value {
    /// Numeric view as i128 for exact integer comparison; only meaningful
    /// for the non-float members of the coercion set.
    pub(crate) fn as_i128(&self) -> i128 {
        match self {
            Value::Bool(b) => *b as i128,
            Value::Int(i) => *i as i128,
            Value::Uint(u) => *u as i128,
            Value::Char(c) => *c as u32 as i128,
            Value::Float(f) => *f as i128,
            _ => 0,
        }
    }

    /// Numeric view as f64, lossy for large integers.
    pub(crate) fn as_f64_lossy(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as u8 as f64,
            Value::Int(i) => *i as f64,
            Value::Uint(u) => *u as f64,
            Value::Char(c) => *c as u32 as f64,
            Value::Float(f) => *f,
            _ => f64::NAN,
        }
    }
}

/// Read a sync map, surviving lock poisoning (a panicking writer leaves
/// the data as-is for a scripting runtime).
pub(crate) fn read_sync(m: &Arc<RwLock<MapData>>) -> std::sync::RwLockReadGuard<'_, MapData> {
    m.read().unwrap_or_else(|e| e.into_inner())
}

/// Write a sync map, surviving lock poisoning.
pub(crate) fn write_sync(m: &Arc<RwLock<MapData>>) -> std::sync::RwLockWriteGuard<'_, MapData> {
    m.write().unwrap_or_else(|e| e.into_inner())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl fmt::Display for Value {
    /// Plain stringification: what `string(v)` and map-key conversion use.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Char(c) => write!(f, "{}", c),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => {
                // Lossy UTF-8 view, matching string(bytes) conversion.
                f.write_str(&String::from_utf8_lossy(&b.borrow()))
            }
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, v) in a.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_element(f, v)?;
                }
                f.write_str("]")
            }
            Value::Map(m) => write_map(f, &m.borrow()),
            Value::SyncMap(m) => write_map(f, &read_sync(m)),
            Value::Error(e) => write!(f, "{}", e),
            Value::RuntimeError(e) => write!(f, "{}", e),
            Value::Function(func) => write!(f, "<function:{}>", func.name),
            Value::BuiltinFunction(d) => write!(f, "<builtin-function:{}>", d.name),
            Value::CompiledFunction(func) => match &func.name {
                Some(name) => write!(f, "<compiled-function:{}>", name),
                None => f.write_str("<compiled-function>"),
            },
            Value::ObjectPtr(p) => write!(f, "{}", p.get()),
            Value::Iterator(_) => f.write_str("<iterator>"),
            Value::Foreign(obj) => f.write_str(&obj.to_display()),
        }
    }
}

/// Element rendering inside containers: strings and chars are quoted so
/// nested output stays readable.
fn write_element(f: &mut fmt::Formatter<'_>, v: &Value) -> fmt::Result {
    match v {
        Value::String(s) => write!(f, "{:?}", s.as_str()),
        Value::Char(c) => write!(f, "{:?}", c),
        other => write!(f, "{}", other),
    }
}

fn write_map(f: &mut fmt::Formatter<'_>, m: &MapData) -> fmt::Result {
    f.write_str("{")?;
    for (i, (k, v)) in m.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}: ", k)?;
        write_element(f, v)?;
    }
    f.write_str("}")
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "String({:?})", s.as_str()),
            Value::Char(c) => write!(f, "Char({:?})", c),
            Value::ObjectPtr(p) => write!(f, "{:?}", p),
            other => write!(f, "{}({})", other.type_name(), other),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

impl From<ErrorValue> for Value {
    fn from(v: ErrorValue) -> Self {
        Value::error(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsiness_table() {
        assert!(UNDEFINED.is_falsy());
        assert!(Value::Bool(false).is_falsy());
        assert!(!Value::Bool(true).is_falsy());
        assert!(Value::Int(0).is_falsy());
        assert!(Value::Uint(0).is_falsy());
        assert!(Value::Float(f64::NAN).is_falsy());
        assert!(!Value::Float(0.0).is_falsy());
        assert!(Value::Char('\0').is_falsy());
        assert!(Value::string("").is_falsy());
        assert!(!Value::string("x").is_falsy());
        assert!(Value::array(vec![]).is_falsy());
        assert!(Value::error_kind(ErrorKind::Type).is_falsy());
        assert!(!Value::array(vec![UNDEFINED]).is_falsy());
    }

    #[test]
    fn test_numeric_cross_variant_equality() {
        assert!(Value::Int(1).equals(&Value::Uint(1)));
        assert!(Value::Int(1).equals(&Value::Bool(true)));
        assert!(Value::Int(0).equals(&Value::Bool(false)));
        assert!(Value::Float(2.0).equals(&Value::Int(2)));
        assert!(Value::Char('a').equals(&Value::Int(97)));
        // u64::MAX must not collide with -1 in integer space.
        assert!(!Value::Uint(u64::MAX).equals(&Value::Int(-1)));
        // Heterogeneous non-numeric pairs are unequal, not an error.
        assert!(!Value::Int(1).equals(&Value::string("1")));
    }

    #[test]
    fn test_string_bytes_equality() {
        assert!(Value::string("ab").equals(&Value::bytes(*b"ab")));
        assert!(!Value::string("ab").equals(&Value::bytes(*b"ac")));
    }

    #[test]
    fn test_container_aliasing_and_copy() {
        let a = Value::array(vec![Value::Int(1)]);
        let alias = a.clone();
        if let Value::Array(items) = &a {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(alias.len(), Some(2));

        let copy = a.copy_value();
        if let Value::Array(items) = &a {
            items.borrow_mut().push(Value::Int(3));
        }
        assert_eq!(copy.len(), Some(2));
        assert!(copy.equals(&alias) == false);
    }

    #[test]
    fn test_object_ptr_shares_and_derefs() {
        let cell = ObjectPtr::new(Value::Int(1));
        let a = Value::ObjectPtr(cell.clone());
        cell.set(Value::Int(5));
        assert!(a.equals(&Value::Int(5)));
        assert!(!a.is_falsy());
        cell.set(UNDEFINED);
        assert!(a.is_falsy());
    }

    #[test]
    fn test_display_stringification() {
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::string("hi").to_string(), "hi");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::string("a")]).to_string(),
            "[1, \"a\"]"
        );
        assert_eq!(UNDEFINED.key_string(), "undefined");
        assert_eq!(Value::Float(1.5).key_string(), "1.5");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::sync_map(MapData::new()).type_name(), "sync-map");
        assert_eq!(Value::bytes(vec![]).type_name(), "bytes");
        assert_eq!(UNDEFINED.type_name(), "undefined");
    }
}
