//! AST → bytecode.
//!
//! The compiler walks statements emitting into a stack of function states
//! (one per function literal being compiled), resolving names through the
//! [`SymbolTable`], interning constants with deduplication, and patching
//! forward jumps once targets are known. Problems are collected as
//! diagnostics; a compilation either yields a complete main function or
//! the full list of errors.
//!
//! Emission notes:
//! - Closure captures: for each free variable of a compiled function
//!   literal, a `GetLocalPtr`/`GetFreePtr` is emitted in the enclosing
//!   function right before `MakeClosure`, pairing the closure with shared
//!   cells.
//! - Destructuring runs through the hidden `:makeArray` builtin so the
//!   right-hand side always produces exactly as many values as targets.
//! - `return f(args)` with a plain identifier callee outside any `try`
//!   marks the call as a tail call; the VM reuses the frame when the
//!   callee turns out to be a compiled function.
//! - Peepholes: statements after a terminal statement are not emitted,
//!   constant conditions collapse their conditional jumps, and
//!   jump-to-jump chains are threaded after each function is assembled.

use std::rc::Rc;

use ecow::EcoString;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::api::CompileOptions;
use crate::ast::{CatchClause, Decl, Expr, FuncLit, Ident, Stmt};
use crate::builtins::BuiltinId;
use crate::bytecode::opcode::{self, Opcode, CALL_FLAG_SPREAD, CALL_FLAG_TAIL, NO_TARGET};
use crate::bytecode::{CompiledFunction, SourceMap};
use crate::errors::Diagnostic;
use crate::modules::ModuleProvider;
use crate::optimizer::Optimizer;
use crate::parser;
use crate::source::{FileSet, Pos, NO_POS};
use crate::symbol_table::{FreeOrigin, Symbol, SymbolScope, SymbolTable};
use crate::token::Token;
use crate::value::Value;

/// The output of [`Compiler::compile_main`].
pub struct CompiledProgram {
    pub main: Rc<CompiledFunction>,
    pub constants: Vec<Value>,
    pub num_modules: usize,
}

struct LoopState {
    /// Operand offsets of `Jump`/`Defer` targets to patch to the loop end.
    break_patches: Vec<usize>,
    /// Same, patched to the loop's post/continue label.
    continue_patches: Vec<usize>,
    /// Try nesting when the loop was entered; breaks unwind the delta.
    try_depth: usize,
}

struct FunctionState {
    instructions: Vec<u8>,
    source_map: SourceMap,
    num_params: usize,
    variadic: bool,
    name: Option<EcoString>,
    loops: Vec<LoopState>,
    try_depth: usize,
    last_op: Option<Opcode>,
}

impl FunctionState {
    fn new(name: Option<EcoString>) -> Self {
        FunctionState {
            instructions: Vec::new(),
            source_map: SourceMap::new(),
            num_params: 0,
            variadic: false,
            name,
            loops: Vec::new(),
            try_depth: 0,
            last_op: None,
        }
    }
}

pub struct Compiler<'a> {
    options: &'a CompileOptions,
    file_set: &'a mut FileSet,
    constants: Vec<Value>,
    constant_keys: HashMap<String, usize>,
    symbols: SymbolTable,
    funcs: Vec<FunctionState>,
    errors: Vec<Diagnostic>,
    /// name → (constant index, module index, is_native)
    modules: HashMap<EcoString, (usize, usize, bool)>,
    /// Source modules currently being compiled, for cycle detection.
    module_stack: Vec<EcoString>,
    num_modules: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(options: &'a CompileOptions, file_set: &'a mut FileSet) -> Self {
        Compiler {
            options,
            file_set,
            constants: Vec::new(),
            constant_keys: HashMap::new(),
            symbols: SymbolTable::new(),
            funcs: vec![FunctionState::new(Some("main".into()))],
            errors: Vec::new(),
            modules: HashMap::new(),
            module_stack: Vec::new(),
            num_modules: 0,
        }
    }

    /// Compile a parsed program into its main function and constant pool.
    pub fn compile_main(mut self, stmts: &[Stmt]) -> Result<CompiledProgram, Vec<Diagnostic>> {
        self.compile_stmts(stmts);
        let mut main = self.finish_function();
        main.num_locals = self.symbols.max_symbols();
        if self.errors.is_empty() {
            if self.options.trace_compiler {
                tracing::debug!(
                    constants = self.constants.len(),
                    modules = self.num_modules,
                    "compilation finished"
                );
            }
            Ok(CompiledProgram {
                main: Rc::new(main),
                constants: self.constants,
                num_modules: self.num_modules,
            })
        } else {
            self.errors.sort_by_key(|d| d.pos);
            Err(self.errors)
        }
    }

    // === emission ===

    fn cur(&mut self) -> &mut FunctionState {
        self.funcs.last_mut().expect("no function being compiled")
    }

    fn offset(&self) -> usize {
        self.funcs
            .last()
            .expect("no function being compiled")
            .instructions
            .len()
    }

    fn emit(&mut self, pos: Pos, op: Opcode, operands: &[u32]) -> usize {
        let trace = self.options.trace_compiler;
        let state = self.cur();
        let at = state.instructions.len();
        opcode::make(&mut state.instructions, op, operands);
        if pos != NO_POS {
            state.source_map.insert(at as u32, pos);
        }
        state.last_op = Some(op);
        if trace {
            tracing::trace!(offset = at, ?op, ?operands, "emit");
        }
        at
    }

    /// Patch a u32 operand in the current function.
    fn patch_u32(&mut self, operand_offset: usize, value: u32) {
        let state = self.cur();
        state.instructions[operand_offset..operand_offset + 4]
            .copy_from_slice(&value.to_le_bytes());
    }

    fn error_at(&mut self, pos: Pos, message: impl Into<String>) {
        self.errors.push(Diagnostic::new(message, pos));
    }

    fn add_constant(&mut self, value: Value) -> usize {
        // Scalars and strings dedup by typed key; everything else (maps,
        // functions) is appended as-is.
        let key = match &value {
            Value::Int(_)
            | Value::Uint(_)
            | Value::Float(_)
            | Value::Char(_)
            | Value::Bool(_)
            | Value::String(_) => Some(format!("{}|{}", value.type_name(), value)),
            _ => None,
        };
        if let Some(key) = &key {
            if let Some(&idx) = self.constant_keys.get(key) {
                return idx;
            }
        }
        let idx = self.constants.len();
        self.constants.push(value);
        if let Some(key) = key {
            self.constant_keys.insert(key, idx);
        }
        idx
    }

    fn finish_function(&mut self) -> CompiledFunction {
        // Fall off the end of a function: return undefined.
        if !matches!(
            self.cur().last_op,
            Some(Opcode::Return | Opcode::ReturnUndefined)
        ) {
            self.emit(NO_POS, Opcode::ReturnUndefined, &[]);
        }
        let state = self.funcs.pop().expect("no function being compiled");
        let mut instructions = state.instructions;
        thread_jumps(&mut instructions);
        CompiledFunction {
            instructions: instructions.into(),
            num_params: state.num_params,
            num_locals: 0, // patched by callers that know the scope
            variadic: state.variadic,
            name: state.name,
            source_map: Rc::new(state.source_map),
            free: SmallVec::new(),
        }
    }

    // === statements ===

    fn compile_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.compile_stmt(stmt);
            // Unreachable statements after a terminal one are dropped.
            if stmt.is_terminal() {
                break;
            }
        }
    }

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr);
                self.emit(expr.pos(), Opcode::Pop, &[]);
            }
            Stmt::Block { stmts, .. } => {
                self.symbols.enter_block();
                self.compile_stmts(stmts);
                self.symbols.leave_block();
            }
            Stmt::Decl(decl) => self.compile_decl(decl),
            Stmt::Assign { op, lhs, rhs, pos } => self.compile_assign(*op, lhs, rhs, *pos),
            Stmt::IncDec { op, target, pos } => {
                let base = if *op == Token::Inc {
                    Token::Add
                } else {
                    Token::Sub
                };
                let one = Expr::Int {
                    value: 1,
                    pos: *pos,
                };
                self.compile_compound_assign(base, target, &one, *pos);
            }
            Stmt::If {
                init,
                cond,
                body,
                alt,
                pos,
            } => self.compile_if(init.as_deref(), cond, body, alt.as_deref(), *pos),
            Stmt::For {
                init,
                cond,
                post,
                body,
                pos,
            } => self.compile_for(init.as_deref(), cond.as_ref(), post.as_deref(), body, *pos),
            Stmt::ForIn {
                key,
                value,
                iterable,
                body,
                pos,
            } => self.compile_for_in(key, value.as_ref(), iterable, body, *pos),
            Stmt::Break { pos } => self.compile_loop_exit(*pos, true),
            Stmt::Continue { pos } => self.compile_loop_exit(*pos, false),
            Stmt::Return { value, pos } => self.compile_return(value.as_ref(), *pos),
            Stmt::Throw { value, pos } => {
                self.compile_expr(value);
                self.emit(*pos, Opcode::Throw, &[1]);
            }
            Stmt::Try {
                body,
                catch,
                finally,
                pos,
            } => self.compile_try(body, catch.as_ref(), finally.as_deref(), *pos),
        }
    }

    fn compile_decl(&mut self, decl: &Decl) {
        match decl {
            Decl::Var { specs, .. } => {
                for spec in specs {
                    self.define_and_init(&spec.name, spec.value.as_ref(), false);
                }
            }
            Decl::Const { specs, .. } => {
                for spec in specs {
                    self.define_and_init(&spec.name, spec.value.as_ref(), true);
                }
            }
            Decl::Param {
                names,
                variadic,
                pos,
            } => {
                if self.funcs.len() > 1 {
                    self.error_at(*pos, "param declaration is only allowed in the main function");
                    return;
                }
                if !self.symbols.at_function_scope() {
                    self.error_at(*pos, "param declaration is not allowed in this block");
                    return;
                }
                if self.symbols.max_symbols() != self.cur().num_params {
                    self.error_at(*pos, "param declarations must come first");
                    return;
                }
                for name in names {
                    match self.symbols.define_param(name.name.clone()) {
                        Ok(_) => self.cur().num_params += 1,
                        Err(e) => self.error_at(name.pos, e.to_string()),
                    }
                }
                self.cur().variadic = *variadic;
            }
            Decl::Global { names, pos } => {
                if !self.symbols.at_function_scope() {
                    self.error_at(*pos, "global declaration is not allowed in this block");
                    return;
                }
                for name in names {
                    if let Err(e) = self.symbols.define_global(name.name.clone()) {
                        self.error_at(name.pos, e.to_string());
                    }
                }
            }
        }
    }

    fn define_and_init(&mut self, name: &Ident, value: Option<&Expr>, constant: bool) {
        let defined = if constant {
            self.symbols.define_const(name.name.clone())
        } else {
            self.symbols.define(name.name.clone())
        };
        let symbol = match defined {
            Ok(s) => s,
            Err(e) => {
                self.error_at(name.pos, e.to_string());
                return;
            }
        };
        match value {
            // Functions bound by declaration pick up the binding's name.
            Some(Expr::Func(func)) => self.compile_func_literal(func, Some(name.name.clone())),
            Some(expr) => self.compile_expr(expr),
            None => {
                self.emit(name.pos, Opcode::Undefined, &[]);
            }
        }
        self.emit(name.pos, Opcode::DefineLocal, &[symbol.index as u32]);
    }

    // === assignment ===

    fn compile_assign(&mut self, op: Token, lhs: &[Expr], rhs: &[Expr], pos: Pos) {
        if let Some(base) = op.compound_base() {
            debug_assert_eq!(lhs.len(), 1);
            debug_assert_eq!(rhs.len(), 1);
            self.compile_compound_assign(base, &lhs[0], &rhs[0], pos);
            return;
        }

        // `:=` defines its new identifier targets before the right-hand
        // side is compiled, so closures can refer to themselves.
        let mut fresh: Vec<EcoString> = Vec::new();
        if op == Token::Define {
            let mut any_new = false;
            for target in lhs {
                let Expr::Ident(ident) = target else {
                    // The parser already rejected this.
                    continue;
                };
                if ident.is_blank() {
                    any_new = true;
                    continue;
                }
                if !self.symbols.defined_in_current_block(&ident.name) {
                    match self.symbols.define(ident.name.clone()) {
                        Ok(_) => {
                            fresh.push(ident.name.clone());
                            any_new = true;
                        }
                        Err(e) => self.error_at(ident.pos, e.to_string()),
                    }
                }
            }
            if !any_new {
                self.error_at(pos, "no new variable on the left side of ':='");
                return;
            }
        }

        if lhs.len() == 1 && rhs.len() == 1 {
            self.compile_expr(&rhs[0]);
            self.store_target(&lhs[0], &fresh);
            return;
        }

        // Destructuring: arrange the right-hand side into exactly
        // lhs.len() values via the hidden :makeArray builtin.
        self.emit(pos, Opcode::GetBuiltin, &[BuiltinId::MakeArray as u32]);
        let count = self.add_constant(Value::Int(lhs.len() as i64));
        self.emit(pos, Opcode::Constant, &[count as u32]);
        if rhs.len() == 1 {
            self.compile_expr(&rhs[0]);
        } else {
            for expr in rhs {
                self.compile_expr(expr);
            }
            self.emit(pos, Opcode::MakeArray, &[rhs.len() as u32]);
        }
        self.emit(pos, Opcode::Call, &[2, 0]);

        // The arranged array is on the stack; pick each element out.
        for (i, target) in lhs.iter().enumerate() {
            self.emit(target.pos(), Opcode::Dup, &[]);
            let idx = self.add_constant(Value::Int(i as i64));
            self.emit(target.pos(), Opcode::Constant, &[idx as u32]);
            self.emit(target.pos(), Opcode::IndexGet, &[]);
            self.store_target(target, &fresh);
        }
        self.emit(pos, Opcode::Pop, &[]);
    }

    /// Store the top of stack into an assignment target.
    fn store_target(&mut self, target: &Expr, fresh: &[EcoString]) {
        match target {
            Expr::Ident(ident) if ident.is_blank() => {
                self.emit(ident.pos, Opcode::Pop, &[]);
            }
            Expr::Ident(ident) => {
                let Some(symbol) = self.symbols.resolve(&ident.name) else {
                    self.error_at(ident.pos, format!("unresolved reference \"{}\"", ident.name));
                    return;
                };
                self.store_symbol(&symbol, ident.pos, fresh.contains(&ident.name));
            }
            Expr::Index { target, index, pos } => {
                self.compile_expr(target);
                self.compile_expr(index);
                self.emit(*pos, Opcode::IndexSet, &[]);
            }
            Expr::Selector { target, field } => {
                self.compile_expr(target);
                let idx = self.add_constant(Value::String(field.name.clone()));
                self.emit(field.pos, Opcode::Constant, &[idx as u32]);
                self.emit(field.pos, Opcode::IndexSet, &[]);
            }
            other => {
                self.error_at(other.pos(), "cannot assign to this expression");
            }
        }
    }

    fn store_symbol(&mut self, symbol: &Symbol, pos: Pos, newly_defined: bool) {
        match symbol.scope {
            SymbolScope::Local => {
                if symbol.constant && !newly_defined {
                    self.error_at(pos, format!("assignment to constant \"{}\"", symbol.name));
                    return;
                }
                let op = if newly_defined {
                    Opcode::DefineLocal
                } else {
                    Opcode::SetLocal
                };
                self.emit(pos, op, &[symbol.index as u32]);
            }
            SymbolScope::Free => {
                if symbol.constant {
                    self.error_at(pos, format!("assignment to constant \"{}\"", symbol.name));
                    return;
                }
                self.emit(pos, Opcode::SetFree, &[symbol.index as u32]);
            }
            SymbolScope::Global => {
                let idx = self.add_constant(Value::String(symbol.name.clone()));
                self.emit(pos, Opcode::SetGlobal, &[idx as u32]);
            }
            SymbolScope::Builtin => {
                self.error_at(pos, format!("cannot assign to builtin \"{}\"", symbol.name));
            }
        }
    }

    fn compile_compound_assign(&mut self, base: Token, target: &Expr, rhs: &Expr, pos: Pos) {
        match target {
            // Index/selector targets evaluate twice (read, then store);
            // side effects included.
            Expr::Ident(_) | Expr::Index { .. } | Expr::Selector { .. } => {
                self.compile_expr(target);
                self.compile_expr(rhs);
                self.emit(pos, Opcode::BinaryOp, &[base as u32]);
                self.store_target(target, &[]);
            }
            other => {
                self.error_at(other.pos(), "cannot assign to this expression");
            }
        }
    }

    // === control flow ===

    fn compile_if(
        &mut self,
        init: Option<&Stmt>,
        cond: &Expr,
        body: &[Stmt],
        alt: Option<&Stmt>,
        pos: Pos,
    ) {
        self.symbols.enter_block();
        if let Some(init) = init {
            self.compile_stmt(init);
        }

        // Constant conditions skip the dead branch entirely.
        if let Some(konst) = const_truthiness(cond) {
            if konst {
                self.symbols.enter_block();
                self.compile_stmts(body);
                self.symbols.leave_block();
            } else if let Some(alt) = alt {
                self.compile_stmt(alt);
            }
            self.symbols.leave_block();
            return;
        }

        self.compile_expr(cond);
        let falsy_jump = self.emit(pos, Opcode::JumpFalsy, &[0]);

        self.symbols.enter_block();
        self.compile_stmts(body);
        self.symbols.leave_block();

        if let Some(alt) = alt {
            let end_jump = self.emit(pos, Opcode::Jump, &[0]);
            let alt_target = self.offset() as u32;
            self.patch_u32(falsy_jump + 1, alt_target);
            self.compile_stmt(alt);
            let end = self.offset() as u32;
            self.patch_u32(end_jump + 1, end);
        } else {
            let end = self.offset() as u32;
            self.patch_u32(falsy_jump + 1, end);
        }
        self.symbols.leave_block();
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &[Stmt],
        pos: Pos,
    ) {
        self.symbols.enter_block();
        if let Some(init) = init {
            self.compile_stmt(init);
        }

        let start = self.offset() as u32;
        let cond_jump = match cond {
            // Constant-true conditions need no test at all.
            Some(cond) if const_truthiness(cond) != Some(true) => {
                self.compile_expr(cond);
                Some(self.emit(pos, Opcode::JumpFalsy, &[0]))
            }
            _ => None,
        };

        let try_depth = self.cur().try_depth;
        self.cur().loops.push(LoopState {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            try_depth,
        });

        self.symbols.enter_block();
        self.compile_stmts(body);
        self.symbols.leave_block();

        // Continue lands on the post statement (or the back edge).
        let continue_target = self.offset() as u32;
        if let Some(post) = post {
            self.compile_stmt(post);
        }
        self.emit(pos, Opcode::Jump, &[start]);

        let end = self.offset() as u32;
        if let Some(jump) = cond_jump {
            self.patch_u32(jump + 1, end);
        }
        let loop_state = self.cur().loops.pop().expect("loop state");
        for patch in loop_state.break_patches {
            self.patch_u32(patch, end);
        }
        for patch in loop_state.continue_patches {
            self.patch_u32(patch, continue_target);
        }
        self.symbols.leave_block();
    }

    fn compile_for_in(
        &mut self,
        key: &Ident,
        value: Option<&Ident>,
        iterable: &Expr,
        body: &[Stmt],
        pos: Pos,
    ) {
        self.symbols.enter_block();

        // The live iterator sits in a hidden local; its name cannot be
        // written as an identifier.
        self.compile_expr(iterable);
        self.emit(pos, Opcode::IterInit, &[]);
        let it = match self.symbols.define(":it") {
            Ok(s) => s,
            Err(e) => {
                self.error_at(pos, e.to_string());
                self.symbols.leave_block();
                return;
            }
        };
        self.emit(pos, Opcode::DefineLocal, &[it.index as u32]);

        let start = self.offset() as u32;
        self.emit(pos, Opcode::GetLocal, &[it.index as u32]);
        self.emit(pos, Opcode::IterNext, &[]);
        let exit_jump = self.emit(pos, Opcode::JumpFalsy, &[0]);

        let try_depth = self.cur().try_depth;
        self.cur().loops.push(LoopState {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            try_depth,
        });

        self.symbols.enter_block();
        if !key.is_blank() {
            match self.symbols.define(key.name.clone()) {
                Ok(sym) => {
                    self.emit(key.pos, Opcode::GetLocal, &[it.index as u32]);
                    self.emit(key.pos, Opcode::IterKey, &[]);
                    self.emit(key.pos, Opcode::DefineLocal, &[sym.index as u32]);
                }
                Err(e) => self.error_at(key.pos, e.to_string()),
            }
        }
        if let Some(value) = value {
            if !value.is_blank() {
                match self.symbols.define(value.name.clone()) {
                    Ok(sym) => {
                        self.emit(value.pos, Opcode::GetLocal, &[it.index as u32]);
                        self.emit(value.pos, Opcode::IterValue, &[]);
                        self.emit(value.pos, Opcode::DefineLocal, &[sym.index as u32]);
                    }
                    Err(e) => self.error_at(value.pos, e.to_string()),
                }
            }
        }
        self.compile_stmts(body);
        self.symbols.leave_block();

        self.emit(pos, Opcode::Jump, &[start]);
        let end = self.offset() as u32;
        self.patch_u32(exit_jump + 1, end);

        let loop_state = self.cur().loops.pop().expect("loop state");
        for patch in loop_state.break_patches {
            self.patch_u32(patch, end);
        }
        for patch in loop_state.continue_patches {
            self.patch_u32(patch, start);
        }
        self.symbols.leave_block();
    }

    fn compile_loop_exit(&mut self, pos: Pos, is_break: bool) {
        let state = self.funcs.last().expect("no function being compiled");
        let Some(loop_state) = state.loops.last() else {
            let what = if is_break { "break" } else { "continue" };
            self.error_at(pos, format!("{what} not allowed outside a loop"));
            return;
        };
        let unwind = state.try_depth - loop_state.try_depth;
        let patch_at = if unwind == 0 {
            self.emit(pos, Opcode::Jump, &[0]) + 1
        } else {
            // Route through the enclosing finally blocks first.
            self.emit(pos, Opcode::Defer, &[0, unwind as u32]) + 1
        };
        let loop_state = self.cur().loops.last_mut().expect("loop state");
        if is_break {
            loop_state.break_patches.push(patch_at);
        } else {
            loop_state.continue_patches.push(patch_at);
        }
    }

    fn compile_return(&mut self, value: Option<&Expr>, pos: Pos) {
        match value {
            None => {
                self.emit(pos, Opcode::ReturnUndefined, &[]);
            }
            Some(expr) => {
                // Tail position: `return f(args)` with a plain callee,
                // outside any try region (finally must still run).
                let tail = self.cur().try_depth == 0
                    && matches!(
                        expr,
                        Expr::Call { callee, spread: false, .. } if matches!(**callee, Expr::Ident(_))
                    );
                if let (true, Expr::Call { callee, args, spread, pos: cpos }) = (tail, expr) {
                    self.compile_call(callee, args, *spread, true, *cpos);
                } else {
                    self.compile_expr(expr);
                }
                self.emit(pos, Opcode::Return, &[]);
            }
        }
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        catch: Option<&CatchClause>,
        finally: Option<&[Stmt]>,
        pos: Pos,
    ) {
        let setup = self.emit(pos, Opcode::SetupTry, &[NO_TARGET, 0]);
        self.cur().try_depth += 1;

        self.symbols.enter_block();
        self.compile_stmts(body);
        self.symbols.leave_block();
        self.emit(pos, Opcode::Finalizer, &[]);

        if let Some(clause) = catch {
            let catch_ip = self.offset() as u32;
            self.patch_u32(setup + 1, catch_ip);

            self.symbols.enter_block();
            // The VM pushes the caught error before jumping here.
            match &clause.ident {
                Some(ident) => match self.symbols.define(ident.name.clone()) {
                    Ok(sym) => {
                        self.emit(ident.pos, Opcode::DefineLocal, &[sym.index as u32]);
                    }
                    Err(e) => self.error_at(ident.pos, e.to_string()),
                },
                None => {
                    self.emit(clause.pos, Opcode::Pop, &[]);
                }
            }
            self.compile_stmts(&clause.body);
            self.symbols.leave_block();
            self.emit(clause.pos, Opcode::Finalizer, &[]);
        }

        let finally_ip = self.offset() as u32;
        self.patch_u32(setup + 5, finally_ip);
        if let Some(stmts) = finally {
            self.symbols.enter_block();
            self.compile_stmts(stmts);
            self.symbols.leave_block();
        }
        self.emit(pos, Opcode::EndTry, &[]);
        self.cur().try_depth -= 1;
    }

    // === expressions ===

    fn compile_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Ident(ident) => self.compile_ident(ident),
            Expr::Int { value, pos } => {
                let idx = self.add_constant(Value::Int(*value));
                self.emit(*pos, Opcode::Constant, &[idx as u32]);
            }
            Expr::Uint { value, pos } => {
                let idx = self.add_constant(Value::Uint(*value));
                self.emit(*pos, Opcode::Constant, &[idx as u32]);
            }
            Expr::Float { value, pos } => {
                let idx = self.add_constant(Value::Float(*value));
                self.emit(*pos, Opcode::Constant, &[idx as u32]);
            }
            Expr::Char { value, pos } => {
                let idx = self.add_constant(Value::Char(*value));
                self.emit(*pos, Opcode::Constant, &[idx as u32]);
            }
            Expr::Str { value, pos } => {
                let idx = self.add_constant(Value::String(value.clone()));
                self.emit(*pos, Opcode::Constant, &[idx as u32]);
            }
            Expr::Bool { value, pos } => {
                let op = if *value { Opcode::True } else { Opcode::False };
                self.emit(*pos, op, &[]);
            }
            Expr::Undefined { pos } => {
                self.emit(*pos, Opcode::Undefined, &[]);
            }
            Expr::Array { elements, pos } => {
                for e in elements {
                    self.compile_expr(e);
                }
                self.emit(*pos, Opcode::MakeArray, &[elements.len() as u32]);
            }
            Expr::Map { entries, pos } => {
                for entry in entries {
                    let idx = self.add_constant(Value::String(entry.key.clone()));
                    self.emit(entry.key_pos, Opcode::Constant, &[idx as u32]);
                    self.compile_expr(&entry.value);
                }
                self.emit(*pos, Opcode::MakeMap, &[entries.len() as u32]);
            }
            Expr::Func(func) => self.compile_func_literal(func, None),
            Expr::Binary { op, lhs, rhs, pos } => match op {
                Token::LAnd => {
                    self.compile_expr(lhs);
                    let short = self.emit(*pos, Opcode::AndJump, &[0]);
                    self.compile_expr(rhs);
                    let end = self.offset() as u32;
                    self.patch_u32(short + 1, end);
                }
                Token::LOr => {
                    self.compile_expr(lhs);
                    let short = self.emit(*pos, Opcode::OrJump, &[0]);
                    self.compile_expr(rhs);
                    let end = self.offset() as u32;
                    self.patch_u32(short + 1, end);
                }
                _ => {
                    self.compile_expr(lhs);
                    self.compile_expr(rhs);
                    self.emit(*pos, Opcode::BinaryOp, &[*op as u32]);
                }
            },
            Expr::Unary { op, operand, pos } => {
                self.compile_expr(operand);
                self.emit(*pos, Opcode::UnaryOp, &[*op as u32]);
            }
            Expr::Cond {
                cond, then, alt, pos,
            } => {
                if let Some(konst) = const_truthiness(cond) {
                    self.compile_expr(if konst { then } else { alt });
                    return;
                }
                self.compile_expr(cond);
                let falsy = self.emit(*pos, Opcode::JumpFalsy, &[0]);
                self.compile_expr(then);
                let end_jump = self.emit(*pos, Opcode::Jump, &[0]);
                let alt_target = self.offset() as u32;
                self.patch_u32(falsy + 1, alt_target);
                self.compile_expr(alt);
                let end = self.offset() as u32;
                self.patch_u32(end_jump + 1, end);
            }
            Expr::Call {
                callee,
                args,
                spread,
                pos,
            } => self.compile_call(callee, args, *spread, false, *pos),
            Expr::Index { target, index, pos } => {
                self.compile_expr(target);
                self.compile_expr(index);
                self.emit(*pos, Opcode::IndexGet, &[]);
            }
            Expr::Selector { target, field } => {
                self.compile_expr(target);
                let idx = self.add_constant(Value::String(field.name.clone()));
                self.emit(field.pos, Opcode::Constant, &[idx as u32]);
                self.emit(field.pos, Opcode::IndexGet, &[]);
            }
            Expr::Slice {
                target,
                low,
                high,
                pos,
            } => {
                self.compile_expr(target);
                match low {
                    Some(low) => self.compile_expr(low),
                    None => {
                        self.emit(*pos, Opcode::Undefined, &[]);
                    }
                }
                match high {
                    Some(high) => self.compile_expr(high),
                    None => {
                        self.emit(*pos, Opcode::Undefined, &[]);
                    }
                }
                self.emit(*pos, Opcode::SliceIndex, &[]);
            }
            Expr::Import { module, pos } => self.compile_import(module, *pos),
        }
    }

    fn compile_ident(&mut self, ident: &Ident) {
        let Some(symbol) = self.symbols.resolve(&ident.name) else {
            self.error_at(ident.pos, format!("unresolved reference \"{}\"", ident.name));
            return;
        };
        match symbol.scope {
            SymbolScope::Local => {
                self.emit(ident.pos, Opcode::GetLocal, &[symbol.index as u32]);
            }
            SymbolScope::Free => {
                self.emit(ident.pos, Opcode::GetFree, &[symbol.index as u32]);
            }
            SymbolScope::Global => {
                let idx = self.add_constant(Value::String(symbol.name.clone()));
                self.emit(ident.pos, Opcode::GetGlobal, &[idx as u32]);
            }
            SymbolScope::Builtin => {
                self.emit(ident.pos, Opcode::GetBuiltin, &[symbol.index as u32]);
            }
        }
    }

    fn compile_func_literal(&mut self, func: &FuncLit, name: Option<EcoString>) {
        self.symbols.enter_function();
        let mut state = FunctionState::new(name);
        state.num_params = func.params.len();
        state.variadic = func.variadic;
        self.funcs.push(state);

        for param in &func.params {
            if let Err(e) = self.symbols.define_param(param.name.clone()) {
                self.error_at(param.pos, e.to_string());
            }
        }
        self.compile_stmts(&func.body);

        let mut compiled = self.finish_function();
        let scope = self.symbols.leave_function();
        compiled.num_locals = scope.max_locals;

        let const_idx = self.constants.len();
        self.constants.push(Value::CompiledFunction(Rc::new(compiled)));

        // Pair the closure with its captured cells, in capture order.
        for free in &scope.free {
            match free.origin {
                FreeOrigin::Local(slot) => {
                    self.emit(func.pos, Opcode::GetLocalPtr, &[slot as u32]);
                }
                FreeOrigin::Free(idx) => {
                    self.emit(func.pos, Opcode::GetFreePtr, &[idx as u32]);
                }
            }
        }
        self.emit(
            func.pos,
            Opcode::MakeClosure,
            &[const_idx as u32, scope.free.len() as u32],
        );
    }

    fn compile_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        spread: bool,
        tail: bool,
        pos: Pos,
    ) {
        self.compile_expr(callee);
        for arg in args {
            self.compile_expr(arg);
        }
        let mut flags = 0u32;
        if spread {
            flags |= CALL_FLAG_SPREAD as u32;
        }
        if tail {
            flags |= CALL_FLAG_TAIL as u32;
        }
        self.emit(pos, Opcode::Call, &[args.len() as u32, flags]);
    }

    // === modules ===

    fn compile_import(&mut self, name: &EcoString, pos: Pos) {
        if let Some(&(const_idx, module_idx, native)) = self.modules.get(name) {
            self.emit_module_load(const_idx, module_idx, native, pos);
            return;
        }

        let Some(provider) = self.options.module_map.get(name) else {
            self.error_at(pos, format!("module \"{name}\" is not defined"));
            return;
        };

        match provider.clone() {
            ModuleProvider::Native(value) => {
                let const_idx = self.constants.len();
                self.constants.push(value);
                let module_idx = self.num_modules;
                self.num_modules += 1;
                self.modules
                    .insert(name.clone(), (const_idx, module_idx, true));
                self.emit_module_load(const_idx, module_idx, true, pos);
            }
            ModuleProvider::Source(src) => {
                if self.module_stack.contains(name) {
                    let chain: Vec<&str> =
                        self.module_stack.iter().map(|n| n.as_str()).collect();
                    self.error_at(
                        pos,
                        format!(
                            "cyclic import of module \"{name}\" (import chain: {})",
                            chain.join(" -> ")
                        ),
                    );
                    return;
                }
                self.module_stack.push(name.clone());
                let const_idx = self.compile_source_module(name, &src, pos);
                self.module_stack.pop();

                let Some(const_idx) = const_idx else { return };
                let module_idx = self.num_modules;
                self.num_modules += 1;
                self.modules
                    .insert(name.clone(), (const_idx, module_idx, false));
                self.emit_module_load(const_idx, module_idx, false, pos);
            }
        }
    }

    /// Compile a source module into a zero-parameter function constant.
    /// The module body gets a fresh symbol context: it shares builtins and
    /// the globals object, never the importer's locals.
    fn compile_source_module(&mut self, name: &str, src: &str, pos: Pos) -> Option<usize> {
        let stmts = match parser::parse(self.file_set, name, src, self.options.trace_parser) {
            Ok(stmts) => stmts,
            Err(errors) => {
                self.errors.extend(errors);
                return None;
            }
        };
        let mut stmts = stmts;
        if self.options.optimize() {
            Optimizer::new(
                self.options.optimizer_max_cycles,
                self.options.trace_optimizer,
            )
            .with_flags(
                self.options.optimize_constants,
                self.options.optimize_expressions,
            )
            .optimize(&mut stmts);
        }

        let saved_symbols = std::mem::take(&mut self.symbols);
        self.funcs.push(FunctionState::new(Some(name.into())));
        self.compile_stmts(&stmts);
        let mut compiled = self.finish_function();
        let module_scope = self.symbols.max_symbols();
        compiled.num_locals = module_scope;
        self.symbols = saved_symbols;

        if compiled.num_params != 0 {
            // `param` inside a module was already rejected above; keep the
            // invariant anyway.
            self.error_at(pos, format!("module \"{name}\" cannot declare params"));
            return None;
        }
        let const_idx = self.constants.len();
        self.constants.push(Value::CompiledFunction(Rc::new(compiled)));
        Some(const_idx)
    }

    fn emit_module_load(&mut self, const_idx: usize, module_idx: usize, native: bool, pos: Pos) {
        self.emit(
            pos,
            Opcode::LoadModule,
            &[const_idx as u32, module_idx as u32],
        );
        let cached_jump = self.emit(pos, Opcode::JumpTruthy, &[0]);
        if !native {
            self.emit(pos, Opcode::Call, &[0, 0]);
        }
        self.emit(pos, Opcode::StoreModule, &[module_idx as u32]);
        let done = self.offset() as u32;
        self.patch_u32(cached_jump + 1, done);
    }
}

/// The compile-time truthiness of a literal expression, if constant.
fn const_truthiness(expr: &Expr) -> Option<bool> {
    Some(match expr {
        Expr::Bool { value, .. } => *value,
        Expr::Int { value, .. } => *value != 0,
        Expr::Uint { value, .. } => *value != 0,
        Expr::Float { value, .. } => !value.is_nan(),
        Expr::Char { value, .. } => *value != '\0',
        Expr::Str { value, .. } => !value.is_empty(),
        Expr::Undefined { .. } => false,
        _ => return None,
    })
}

/// Thread jump chains: a jump whose target is an unconditional `Jump`
/// lands directly on the final destination.
fn thread_jumps(instructions: &mut [u8]) {
    let mut offset = 0;
    while offset < instructions.len() {
        let Ok(op) = Opcode::from_u8(instructions[offset]) else {
            return;
        };
        if matches!(
            op,
            Opcode::Jump | Opcode::JumpFalsy | Opcode::JumpTruthy | Opcode::AndJump | Opcode::OrJump
        ) {
            let mut target = opcode::read_u32(instructions, offset + 1) as usize;
            let mut hops = 0;
            while hops < 16
                && target < instructions.len()
                && instructions[target] == Opcode::Jump as u8
            {
                let next = opcode::read_u32(instructions, target + 1) as usize;
                if next == target {
                    break;
                }
                target = next;
                hops += 1;
            }
            instructions[offset + 1..offset + 5].copy_from_slice(&(target as u32).to_le_bytes());
        }
        offset += op.instruction_len();
    }
}
