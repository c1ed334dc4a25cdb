//! Error taxonomy: script-level error values, runtime errors with source
//! traces, and aggregated compile-time diagnostics.
//!
//! Script errors are plain values (`ErrorValue`) so that scripts can throw,
//! catch, and derive them. A `RuntimeError` is an `ErrorValue` plus the
//! positions collected while unwinding; it is what the VM returns to the
//! host. Compile-time problems never reach the VM: they aggregate into a
//! [`CompileError`] and are returned from [`crate::api::compile`].

use std::fmt;
use std::rc::Rc;

use ecow::EcoString;

use crate::source::{FileSet, Pos, Position, NO_POS};

/// Stable runtime error kinds. Each kind has a sentinel [`ErrorValue`]
/// exposed through the builtin registry so scripts can compare against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SymbolLimit,
    StackOverflow,
    VMAborted,
    WrongNumArguments,
    InvalidOperator,
    IndexOutOfBounds,
    InvalidIndex,
    NotIterable,
    NotIndexable,
    NotIndexAssignable,
    NotCallable,
    NotImplemented,
    ZeroDivision,
    Type,
}

impl ErrorKind {
    /// The sentinel name scripts see (`typeName`-style identity).
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::SymbolLimit => "SymbolLimitError",
            ErrorKind::StackOverflow => "StackOverflowError",
            ErrorKind::VMAborted => "VMAbortedError",
            ErrorKind::WrongNumArguments => "WrongNumArgumentsError",
            ErrorKind::InvalidOperator => "InvalidOperatorError",
            ErrorKind::IndexOutOfBounds => "IndexOutOfBoundsError",
            ErrorKind::InvalidIndex => "InvalidIndexError",
            ErrorKind::NotIterable => "NotIterableError",
            ErrorKind::NotIndexable => "NotIndexableError",
            ErrorKind::NotIndexAssignable => "NotIndexAssignableError",
            ErrorKind::NotCallable => "NotCallableError",
            ErrorKind::NotImplemented => "NotImplementedError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Type => "TypeError",
        }
    }

    /// The default message used when a sentinel is raised bare.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::SymbolLimit => "too many local symbols",
            ErrorKind::StackOverflow => "stack overflow",
            ErrorKind::VMAborted => "VM aborted",
            ErrorKind::WrongNumArguments => "wrong number of arguments",
            ErrorKind::InvalidOperator => "invalid operator",
            ErrorKind::IndexOutOfBounds => "index out of bounds",
            ErrorKind::InvalidIndex => "invalid index",
            ErrorKind::NotIterable => "not iterable",
            ErrorKind::NotIndexable => "not indexable",
            ErrorKind::NotIndexAssignable => "not index assignable",
            ErrorKind::NotCallable => "not callable",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::ZeroDivision => "division by zero",
            ErrorKind::Type => "invalid type",
        }
    }
}

/// A script-level error: `{name, message, cause}`.
///
/// Deriving an error (`err.New(msg)` in script code, [`ErrorValue::derive`]
/// here) keeps the original as `cause` and inherits its name, so sentinel
/// identity survives wrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub name: EcoString,
    pub message: EcoString,
    pub cause: Option<Rc<ErrorValue>>,
}

impl ErrorValue {
    pub fn new(message: impl Into<EcoString>) -> Self {
        ErrorValue {
            name: "error".into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn named(name: impl Into<EcoString>, message: impl Into<EcoString>) -> Self {
        ErrorValue {
            name: name.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// The sentinel value for a kind, carrying its default message.
    pub fn kind(kind: ErrorKind) -> Self {
        ErrorValue::named(kind.name(), kind.default_message())
    }

    /// A kind sentinel with a specific message.
    pub fn with_message(kind: ErrorKind, message: impl Into<EcoString>) -> Self {
        ErrorValue::named(kind.name(), message)
    }

    /// Derive a new error from this one: same name, new message, `self`
    /// becomes the cause.
    pub fn derive(self: &Rc<Self>, message: impl Into<EcoString>) -> Self {
        ErrorValue {
            name: self.name.clone(),
            message: message.into(),
            cause: Some(self.clone()),
        }
    }

    /// Sentinel identity test: true when `self` or any link of its cause
    /// chain carries `target`'s name.
    pub fn is_a(&self, target: &ErrorValue) -> bool {
        let mut cur = Some(self);
        while let Some(e) = cur {
            if e.name == target.name {
                return true;
            }
            cur = e.cause.as_deref();
        }
        false
    }

    /// Whether this error carries the given kind's sentinel name, directly
    /// or through its cause chain.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        let mut cur = Some(self);
        while let Some(e) = cur {
            if e.name == kind.name() {
                return true;
            }
            cur = e.cause.as_deref();
        }
        false
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() || self.name == "error" {
            write!(f, "error: {}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// A runtime error: the error value plus the source positions collected
/// while unwinding, one per frame boundary crossed.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub error: ErrorValue,
    pub trace: Vec<Pos>,
    file_set: Option<Rc<FileSet>>,
}

impl RuntimeError {
    pub fn new(error: ErrorValue) -> Self {
        RuntimeError {
            error,
            trace: Vec::new(),
            file_set: None,
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        RuntimeError::new(ErrorValue::kind(kind))
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<EcoString>) -> Self {
        RuntimeError::new(ErrorValue::with_message(kind, message))
    }

    /// Append a trace position, skipping `NO_POS` and immediate repeats.
    pub fn push_trace(&mut self, pos: Pos) {
        if pos != NO_POS && self.trace.last() != Some(&pos) {
            self.trace.push(pos);
        }
    }

    pub fn set_file_set(&mut self, file_set: Rc<FileSet>) {
        self.file_set = Some(file_set);
    }

    pub fn file_set(&self) -> Option<&Rc<FileSet>> {
        self.file_set.as_ref()
    }

    /// Trace entries resolved through the file set, oldest frame last.
    pub fn positions(&self) -> Vec<Position> {
        let Some(fs) = &self.file_set else {
            return Vec::new();
        };
        self.trace.iter().filter_map(|&p| fs.position(p)).collect()
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.error.is_kind(kind)
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        self.error == other.error
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        for p in self.positions() {
            write!(f, "\n\tat {}", p)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<ErrorValue> for RuntimeError {
    fn from(error: ErrorValue) -> Self {
        RuntimeError::new(error)
    }
}

/// A single compile-time problem with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub pos: Pos,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, pos: Pos) -> Self {
        Diagnostic {
            message: message.into(),
            pos,
        }
    }
}

/// All compile-time problems of one compilation, aggregated, with the file
/// set needed to render positions.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
    pub file_set: Rc<FileSet>,
}

impl CompileError {
    pub fn new(diagnostics: Vec<Diagnostic>, file_set: Rc<FileSet>) -> Self {
        debug_assert!(!diagnostics.is_empty());
        CompileError {
            diagnostics,
            file_set,
        }
    }

    pub fn single(message: impl Into<String>, pos: Pos, file_set: Rc<FileSet>) -> Self {
        CompileError::new(vec![Diagnostic::new(message, pos)], file_set)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match self.file_set.position(d.pos) {
                Some(p) => write!(f, "{}: {}", p, d.message)?,
                None => write!(f, "{}", d.message)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_identity_through_cause_chain() {
        let base = Rc::new(ErrorValue::kind(ErrorKind::ZeroDivision));
        let derived = Rc::new(base.derive("in reducer"));
        let twice = derived.derive("at top level");

        assert!(twice.is_kind(ErrorKind::ZeroDivision));
        assert!(twice.is_a(&ErrorValue::kind(ErrorKind::ZeroDivision)));
        assert!(!twice.is_kind(ErrorKind::IndexOutOfBounds));
        assert_eq!(twice.message, "at top level");
        assert_eq!(twice.name, "ZeroDivisionError");
    }

    #[test]
    fn test_runtime_error_trace_dedup() {
        let mut err = RuntimeError::from_kind(ErrorKind::Type);
        err.push_trace(5);
        err.push_trace(5);
        err.push_trace(NO_POS);
        err.push_trace(9);
        assert_eq!(err.trace, vec![5, 9]);
    }

    #[test]
    fn test_display_with_positions() {
        let mut fs = FileSet::new();
        let base = fs.add_file("t.ugo", "a\nbb\n").base;
        let fs = Rc::new(fs);

        let mut err = RuntimeError::with_message(ErrorKind::ZeroDivision, "5 / 0");
        err.push_trace(base + 2);
        err.set_file_set(fs);
        let text = err.to_string();
        assert!(text.contains("ZeroDivisionError: 5 / 0"));
        assert!(text.contains("t.ugo:2:1"));
    }

    #[test]
    fn test_compile_error_display() {
        let mut fs = FileSet::new();
        let base = fs.add_file("m.ugo", "param x\n").base;
        let err = CompileError::single("\"x\" redeclared in this block", base, Rc::new(fs));
        assert_eq!(
            err.to_string(),
            "m.ugo:1:1: \"x\" redeclared in this block"
        );
    }
}
