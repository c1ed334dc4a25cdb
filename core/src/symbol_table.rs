//! Scoped symbol resolution for the compiler.
//!
//! Scopes stack in two flavors: block scopes (an `if`/`for` body, a bare
//! block) and function scopes (a function literal's body, or the main
//! function). Locals are numbered per function; a name referenced from an
//! inner function is recorded as a free variable in every function
//! boundary it crosses, producing the capture chain `MakeClosure` needs.
//!
//! Lookup order: local scopes innermost-out, then globals, then builtins.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::builtins::BuiltinId;

/// Per-function local slot ceiling.
pub const MAX_LOCALS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Builtin,
    Global,
    Local,
    Free,
}

/// A resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: EcoString,
    pub scope: SymbolScope,
    /// Local slot, free index, builtin id, or global ordinal depending on
    /// `scope`.
    pub index: usize,
    /// For locals: whether the binding is a `const`.
    pub constant: bool,
}

/// Where a captured variable's cell comes from in the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOrigin {
    /// A local slot of the enclosing function.
    Local(usize),
    /// A free variable of the enclosing function (transitive capture).
    Free(usize),
}

/// One captured variable of a function, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSymbol {
    pub name: EcoString,
    pub origin: FreeOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    Redeclared(EcoString),
    TooManyLocals,
}

impl std::fmt::Display for SymbolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolError::Redeclared(name) => {
                write!(f, "\"{name}\" redeclared in this block")
            }
            SymbolError::TooManyLocals => {
                write!(f, "too many local symbols (max {MAX_LOCALS})")
            }
        }
    }
}

struct Frame {
    /// Whether this frame is a function boundary.
    is_function: bool,
    store: HashMap<EcoString, Symbol>,
    /// Function frames only: captures recorded for this function.
    free: Vec<FreeSymbol>,
    /// Function frames only: next local slot.
    num_locals: usize,
    /// Function frames only: high-water mark of live locals.
    max_locals: usize,
}

impl Frame {
    fn new(is_function: bool) -> Self {
        Frame {
            is_function,
            store: HashMap::new(),
            free: Vec::new(),
            num_locals: 0,
            max_locals: 0,
        }
    }
}

/// What [`SymbolTable::leave_function`] hands back to the compiler.
#[derive(Debug)]
pub struct FunctionScope {
    pub free: Vec<FreeSymbol>,
    pub max_locals: usize,
}

pub struct SymbolTable {
    frames: Vec<Frame>,
    num_globals: usize,
}

impl SymbolTable {
    /// A fresh table with the main function's scope open.
    pub fn new() -> Self {
        SymbolTable {
            frames: vec![Frame::new(true)],
            num_globals: 0,
        }
    }

    /// Open a block scope (if/for bodies, bare blocks).
    pub fn enter_block(&mut self) {
        self.frames.push(Frame::new(false));
    }

    /// Close a block scope. Locals defined in it release their slots for
    /// reuse by sibling blocks; the function's high-water mark stays.
    pub fn leave_block(&mut self) {
        let frame = self.frames.pop().expect("unbalanced scopes");
        debug_assert!(!frame.is_function, "leave_block on a function scope");
        let released = frame
            .store
            .values()
            .filter(|s| s.scope == SymbolScope::Local)
            .count();
        let func = self.current_function_mut();
        func.num_locals -= released;
    }

    /// Open a function scope (a function literal's body).
    pub fn enter_function(&mut self) {
        self.frames.push(Frame::new(true));
    }

    /// Close a function scope, yielding its captures and local count.
    pub fn leave_function(&mut self) -> FunctionScope {
        let frame = self.frames.pop().expect("unbalanced scopes");
        debug_assert!(frame.is_function, "leave_function on a block scope");
        FunctionScope {
            free: frame.free,
            max_locals: frame.max_locals,
        }
    }

    /// Whether the current scope is a function's own top level (where
    /// `param` and `global` declarations are legal).
    pub fn at_function_scope(&self) -> bool {
        self.frames.last().is_some_and(|f| f.is_function)
    }

    /// High-water mark of locals in the current function.
    pub fn max_symbols(&self) -> usize {
        self.current_function().max_locals
    }

    fn current_function(&self) -> &Frame {
        self.frames
            .iter()
            .rev()
            .find(|f| f.is_function)
            .expect("no function frame")
    }

    fn current_function_mut(&mut self) -> &mut Frame {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.is_function)
            .expect("no function frame")
    }

    /// Define a local in the current block.
    pub fn define(&mut self, name: impl Into<EcoString>) -> Result<Symbol, SymbolError> {
        self.define_local(name.into(), false)
    }

    /// Define a `const` local in the current block.
    pub fn define_const(&mut self, name: impl Into<EcoString>) -> Result<Symbol, SymbolError> {
        self.define_local(name.into(), true)
    }

    /// Define a function parameter (a local in slot order).
    pub fn define_param(&mut self, name: impl Into<EcoString>) -> Result<Symbol, SymbolError> {
        self.define_local(name.into(), false)
    }

    fn define_local(&mut self, name: EcoString, constant: bool) -> Result<Symbol, SymbolError> {
        if self
            .frames
            .last()
            .expect("no scope")
            .store
            .contains_key(&name)
        {
            return Err(SymbolError::Redeclared(name));
        }
        let func = self.current_function_mut();
        let index = func.num_locals;
        if index >= MAX_LOCALS {
            return Err(SymbolError::TooManyLocals);
        }
        func.num_locals += 1;
        func.max_locals = func.max_locals.max(func.num_locals);
        let symbol = Symbol {
            name: name.clone(),
            scope: SymbolScope::Local,
            index,
            constant,
        };
        self.frames
            .last_mut()
            .expect("no scope")
            .store
            .insert(name, symbol.clone());
        Ok(symbol)
    }

    /// Declare a name as resolving through the globals object.
    pub fn define_global(&mut self, name: impl Into<EcoString>) -> Result<Symbol, SymbolError> {
        let name = name.into();
        if self
            .frames
            .last()
            .expect("no scope")
            .store
            .contains_key(&name)
        {
            return Err(SymbolError::Redeclared(name));
        }
        let symbol = Symbol {
            name: name.clone(),
            scope: SymbolScope::Global,
            index: self.num_globals,
            constant: false,
        };
        self.num_globals += 1;
        self.frames
            .last_mut()
            .expect("no scope")
            .store
            .insert(name, symbol.clone());
        Ok(symbol)
    }

    /// Whether `name` is already defined in the current block (drives the
    /// "no new variable on the left side" rule for `:=`).
    pub fn defined_in_current_block(&self, name: &str) -> bool {
        self.frames
            .last()
            .is_some_and(|f| f.store.contains_key(name))
    }

    /// Resolve a name, recording free-variable captures for every
    /// function boundary crossed. Returns `None` for unresolved names.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        // Find the frame holding the name, counting function boundaries
        // between it and the current scope.
        let mut holder: Option<(usize, Symbol)> = None;
        for idx in (0..self.frames.len()).rev() {
            if let Some(sym) = self.frames[idx].store.get(name) {
                holder = Some((idx, sym.clone()));
                break;
            }
        }

        let Some((holder_idx, symbol)) = holder else {
            // Unresolved locally: try the builtin registry.
            return BuiltinId::lookup(name).map(|id| Symbol {
                name: name.into(),
                scope: SymbolScope::Builtin,
                index: id as usize,
                constant: true,
            });
        };

        match symbol.scope {
            SymbolScope::Global | SymbolScope::Builtin | SymbolScope::Free => Some(symbol),
            SymbolScope::Local => {
                // Function frames strictly above the holder's frame are
                // the boundaries this reference crosses.
                let crossed: Vec<usize> = (holder_idx + 1..self.frames.len())
                    .filter(|&i| self.frames[i].is_function)
                    .collect();
                if crossed.is_empty() {
                    return Some(symbol);
                }
                // Thread the capture through each crossed function.
                let mut origin = FreeOrigin::Local(symbol.index);
                let mut free_index = 0;
                for &frame_idx in &crossed {
                    free_index = self.intern_free(frame_idx, name, origin);
                    origin = FreeOrigin::Free(free_index);
                }
                Some(Symbol {
                    name: name.into(),
                    scope: SymbolScope::Free,
                    index: free_index,
                    constant: symbol.constant,
                })
            }
        }
    }

    fn intern_free(&mut self, frame_idx: usize, name: &str, origin: FreeOrigin) -> usize {
        let frame = &mut self.frames[frame_idx];
        if let Some(i) = frame.free.iter().position(|f| f.name == name) {
            return i;
        }
        frame.free.push(FreeSymbol {
            name: name.into(),
            origin,
        });
        frame.free.len() - 1
    }

    /// Captures recorded so far for the current function, in order.
    pub fn current_free(&self) -> &[FreeSymbol] {
        &self.current_function().free
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_resolve_local() {
        let mut t = SymbolTable::new();
        let a = t.define("a").unwrap();
        assert_eq!(a.scope, SymbolScope::Local);
        assert_eq!(a.index, 0);
        assert_eq!(t.resolve("a").unwrap(), a);
    }

    #[test]
    fn test_redeclaration_same_block() {
        let mut t = SymbolTable::new();
        t.define("x").unwrap();
        match t.define("x") {
            Err(SymbolError::Redeclared(name)) => assert_eq!(name, "x"),
            other => panic!("expected redeclaration error, got {other:?}"),
        }
        // Shadowing in a nested block is fine.
        t.enter_block();
        t.define("x").unwrap();
        t.leave_block();
    }

    #[test]
    fn test_block_slot_reuse_keeps_high_water() {
        let mut t = SymbolTable::new();
        t.define("a").unwrap();
        t.enter_block();
        let b = t.define("b").unwrap();
        assert_eq!(b.index, 1);
        t.leave_block();
        t.enter_block();
        let c = t.define("c").unwrap();
        assert_eq!(c.index, 1, "sibling blocks reuse released slots");
        t.leave_block();
        assert_eq!(t.max_symbols(), 2);
    }

    #[test]
    fn test_free_variable_capture() {
        let mut t = SymbolTable::new();
        t.define("outer").unwrap();
        t.enter_function();
        let sym = t.resolve("outer").unwrap();
        assert_eq!(sym.scope, SymbolScope::Free);
        assert_eq!(sym.index, 0);
        let scope = t.leave_function();
        assert_eq!(scope.free.len(), 1);
        assert_eq!(scope.free[0].origin, FreeOrigin::Local(0));
    }

    #[test]
    fn test_transitive_capture_chain() {
        let mut t = SymbolTable::new();
        t.define("x").unwrap();
        t.enter_function(); // f1
        t.enter_function(); // f2
        let sym = t.resolve("x").unwrap();
        assert_eq!(sym.scope, SymbolScope::Free);

        let inner = t.leave_function();
        assert_eq!(inner.free[0].origin, FreeOrigin::Free(0));
        let middle = t.leave_function();
        assert_eq!(middle.free[0].origin, FreeOrigin::Local(0));
    }

    #[test]
    fn test_capture_dedup() {
        let mut t = SymbolTable::new();
        t.define("x").unwrap();
        t.enter_function();
        let a = t.resolve("x").unwrap();
        let b = t.resolve("x").unwrap();
        assert_eq!(a, b);
        assert_eq!(t.leave_function().free.len(), 1);
    }

    #[test]
    fn test_globals_and_builtins() {
        let mut t = SymbolTable::new();
        let g = t.define_global("shared").unwrap();
        assert_eq!(g.scope, SymbolScope::Global);
        // Builtins resolve last, by registry name.
        let b = t.resolve("len").unwrap();
        assert_eq!(b.scope, SymbolScope::Builtin);
        assert_eq!(b.index, BuiltinId::Len as usize);
        // A local shadows the builtin.
        t.define("len").unwrap();
        assert_eq!(t.resolve("len").unwrap().scope, SymbolScope::Local);
        assert!(t.resolve("nothing_here").is_none());
    }

    #[test]
    fn test_local_limit() {
        let mut t = SymbolTable::new();
        for i in 0..MAX_LOCALS {
            t.define(format!("v{i}").as_str()).unwrap();
        }
        assert_eq!(t.define("overflow"), Err(SymbolError::TooManyLocals));
    }

    #[test]
    fn test_at_function_scope() {
        let mut t = SymbolTable::new();
        assert!(t.at_function_scope());
        t.enter_block();
        assert!(!t.at_function_scope());
        t.leave_block();
        t.enter_function();
        assert!(t.at_function_scope());
    }
}
