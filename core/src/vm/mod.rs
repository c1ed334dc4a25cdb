//! The stack virtual machine.
//!
//! One growable value stack is shared by temporaries and locals; each
//! active call owns a [`Frame`] whose `base` points at its first local
//! slot. Structured exceptions run through a stack of try records: a
//! record remembers where its `catch` and `finally` live, and carries a
//! pending action (`return`, re-raise, or a `break`/`continue` jump)
//! across the `finally` body, resolved at `EndTry`.
//!
//! Closure captures are shared cells: `GetLocalPtr` promotes a local slot
//! to a cell in place, so the frame and every closure that captured the
//! binding observe the same storage. Tail-flagged calls to compiled
//! functions reuse the current frame, keeping properly-shaped recursion
//! at constant stack depth.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::builtins::{BuiltinId, Call};
use crate::bytecode::opcode::{self, Opcode, CALL_FLAG_SPREAD, CALL_FLAG_TAIL, NO_TARGET};
use crate::bytecode::{Bytecode, CompiledFunction};
use crate::errors::{ErrorKind, ErrorValue, RuntimeError};
use crate::source::{Pos, NO_POS};
use crate::token::Token;
use crate::value::iter::ValueIterator;
use crate::value::{index, ops, MapData, ObjectPtr, Value, UNDEFINED};

/// Initial stack size in slots; the stack grows on demand up to
/// [`MAX_STACK`].
pub const INITIAL_STACK: usize = 2048;

/// Hard ceiling for the value stack.
pub const MAX_STACK: usize = 1 << 18;

/// Hard ceiling for active frames.
pub const MAX_FRAMES: usize = 1024;

/// A cloneable handle that lets another thread abort a running VM.
#[derive(Clone)]
pub struct VmAbortHandle(Arc<AtomicBool>);

impl VmAbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A cloneable in-memory print sink, handy for capturing script output.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        SharedBuffer::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn take_string(&self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut *self.0.borrow_mut())).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Frame {
    func: Rc<CompiledFunction>,
    /// Resume offset into `func.instructions`.
    ip: usize,
    /// Stack index of local slot 0; the callee value sits at `base - 1`.
    base: usize,
    /// Source position of the call site, for unwind traces.
    call_pos: Pos,
}

enum Pending {
    None,
    Error(RuntimeError),
    Return(Value),
    Jump { dest: u32, remaining: u32 },
}

struct TryRecord {
    frame: usize,
    catch_ip: Option<u32>,
    finally_ip: u32,
    /// Stack height at `SetupTry`; restored on any transfer into the
    /// record's handlers.
    sp: usize,
    in_catch: bool,
    finally_entered: bool,
    pending: Pending,
}

/// Signals from helpers back into the dispatch loop.
enum Flow {
    /// Keep executing; the current frame's `ip` has been updated.
    Continue,
    /// The outermost frame returned this value.
    Done(Value),
}

pub struct Vm {
    bytecode: Bytecode,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    try_stack: Vec<TryRecord>,
    globals: Value,
    module_cache: Vec<Option<Value>>,
    aborted: Arc<AtomicBool>,
    sink: Box<dyn io::Write>,
    recover_panics: bool,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        let module_cache = vec![None; bytecode.num_modules];
        Vm {
            bytecode,
            stack: Vec::with_capacity(INITIAL_STACK),
            frames: Vec::new(),
            try_stack: Vec::new(),
            globals: UNDEFINED,
            module_cache,
            aborted: Arc::new(AtomicBool::new(false)),
            sink: Box::new(io::stdout()),
            recover_panics: false,
        }
    }

    /// Redirect `printf`/`println` output.
    pub fn with_print_writer(mut self, sink: impl io::Write + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn set_print_writer(&mut self, sink: impl io::Write + 'static) {
        self.sink = Box::new(sink);
    }

    /// Coerce panics from host builtins into runtime errors instead of
    /// letting them propagate.
    pub fn set_recover_panics(&mut self, recover: bool) {
        self.recover_panics = recover;
    }

    /// Request prompt termination; checked on jumps and calls.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// A handle other threads can use to abort this VM.
    pub fn abort_handle(&self) -> VmAbortHandle {
        VmAbortHandle(self.aborted.clone())
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Run the main function with the given globals and arguments.
    ///
    /// `globals` is typically a `Map` or `SyncMap`; `Undefined` gets an
    /// empty map so `global` declarations still work.
    pub fn run(&mut self, globals: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let main = self.bytecode.main.clone();
        self.execute(main, globals, args)
    }

    /// Run an arbitrary compiled function (for example a callback a
    /// script returned to the host) against this VM's bytecode.
    pub fn run_compiled_function(
        &mut self,
        func: &Rc<CompiledFunction>,
        globals: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.execute(func.clone(), globals, args)
    }

    fn execute(
        &mut self,
        func: Rc<CompiledFunction>,
        globals: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.try_stack.clear();
        self.module_cache = vec![None; self.bytecode.num_modules];
        self.aborted.store(false, Ordering::Relaxed);
        self.globals = match globals {
            Value::Undefined => Value::map(MapData::new()),
            other => other,
        };

        // Bind arguments like a regular call.
        if let Err(e) = arity_check(&func, args.len()) {
            return Err(self.finish_error(RuntimeError::new(e)));
        }
        if func.variadic {
            let fixed = func.num_params - 1;
            self.stack.extend(args[..fixed].iter().cloned());
            self.stack.push(Value::array(args[fixed..].to_vec()));
        } else {
            self.stack.extend(args.iter().cloned());
        }
        while self.stack.len() < func.num_locals {
            self.stack.push(UNDEFINED);
        }
        self.frames.push(Frame {
            func,
            ip: 0,
            base: 0,
            call_pos: NO_POS,
        });

        let result = self.run_loop();
        result.map_err(|e| self.finish_error(e))
    }

    fn finish_error(&self, mut err: RuntimeError) -> RuntimeError {
        err.set_file_set(self.bytecode.file_set.clone());
        err
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= MAX_STACK {
            return Err(RuntimeError::from_kind(ErrorKind::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    // === the dispatch loop ===

    fn run_loop(&mut self) -> Result<Value, RuntimeError> {
        'frame: loop {
            let frame_idx = self.frames.len() - 1;
            let func = self.frames[frame_idx].func.clone();
            let code = func.instructions.clone();
            let base = self.frames[frame_idx].base;
            let mut ip = self.frames[frame_idx].ip;

            macro_rules! raise {
                ($err:expr, $op_start:expr) => {{
                    self.frames.last_mut().expect("frame").ip = ip;
                    let pos = func.source_pos($op_start as u32);
                    match self.raise(RuntimeError::from($err), pos)? {
                        Flow::Continue => continue 'frame,
                        Flow::Done(v) => return Ok(v),
                    }
                }};
            }

            loop {
                let op_start = ip;
                let op = match Opcode::from_u8(code[ip]) {
                    Ok(op) => op,
                    Err(bad) => {
                        raise!(
                            ErrorValue::with_message(ErrorKind::Type, bad.to_string()),
                            op_start
                        );
                    }
                };
                ip += 1;

                match op {
                    Opcode::Constant => {
                        let idx = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let value = self.bytecode.constants[idx].clone();
                        if let Err(e) = self.push(value) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::Undefined => {
                        if let Err(e) = self.push(UNDEFINED) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::True => {
                        if let Err(e) = self.push(Value::Bool(true)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::False => {
                        if let Err(e) = self.push(Value::Bool(false)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::Pop => {
                        self.pop();
                    }
                    Opcode::Dup => {
                        let top = self.stack.last().expect("stack underflow").clone();
                        if let Err(e) = self.push(top) {
                            raise!(e.error, op_start);
                        }
                    }

                    Opcode::GetLocal => {
                        let slot = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let v = match &self.stack[base + slot] {
                            Value::ObjectPtr(cell) => cell.get(),
                            other => other.clone(),
                        };
                        if let Err(e) = self.push(v) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::SetLocal => {
                        let slot = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let v = self.pop();
                        match &self.stack[base + slot] {
                            Value::ObjectPtr(cell) => cell.set(v),
                            _ => self.stack[base + slot] = v,
                        }
                    }
                    Opcode::DefineLocal => {
                        let slot = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let v = self.pop();
                        // A fresh binding: never writes through an old cell.
                        self.stack[base + slot] = v;
                    }
                    Opcode::GetLocalPtr => {
                        let slot = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let cell = match &self.stack[base + slot] {
                            Value::ObjectPtr(cell) => cell.clone(),
                            other => {
                                let cell = ObjectPtr::new(other.clone());
                                self.stack[base + slot] = Value::ObjectPtr(cell.clone());
                                cell
                            }
                        };
                        if let Err(e) = self.push(Value::ObjectPtr(cell)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::GetFree => {
                        let idx = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let v = func.free[idx].get();
                        if let Err(e) = self.push(v) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::SetFree => {
                        let idx = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let v = self.pop();
                        func.free[idx].set(v);
                    }
                    Opcode::GetFreePtr => {
                        let idx = opcode::read_u8(&code, ip) as usize;
                        ip += 1;
                        let cell = func.free[idx].clone();
                        if let Err(e) = self.push(Value::ObjectPtr(cell)) {
                            raise!(e.error, op_start);
                        }
                    }

                    Opcode::GetGlobal => {
                        let idx = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let name = self.bytecode.constants[idx].clone();
                        match index::index_get(&self.globals, &name) {
                            Ok(v) => {
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }
                    Opcode::SetGlobal => {
                        let idx = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let name = self.bytecode.constants[idx].clone();
                        let v = self.pop();
                        if let Err(e) = index::index_set(&self.globals, &name, v) {
                            raise!(e, op_start);
                        }
                    }
                    Opcode::GetBuiltin => {
                        let id = opcode::read_u8(&code, ip) as u8;
                        ip += 1;
                        let value = BuiltinId::from_u8(id)
                            .map(BuiltinId::value)
                            .unwrap_or(UNDEFINED);
                        if let Err(e) = self.push(value) {
                            raise!(e.error, op_start);
                        }
                    }

                    Opcode::BinaryOp => {
                        let token = Token::from_u8(opcode::read_u8(&code, ip) as u8)
                            .expect("bad operator token in bytecode");
                        ip += 1;
                        let rhs = self.pop();
                        let lhs = self.pop();
                        match ops::binary_op(token, &lhs, &rhs) {
                            Ok(v) => {
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }
                    Opcode::UnaryOp => {
                        let token = Token::from_u8(opcode::read_u8(&code, ip) as u8)
                            .expect("bad operator token in bytecode");
                        ip += 1;
                        let v = self.pop();
                        match ops::unary_op(token, &v) {
                            Ok(v) => {
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }

                    Opcode::Jump => {
                        if self.aborted.load(Ordering::Relaxed) {
                            return Err(self.aborted_error(&func, op_start));
                        }
                        ip = opcode::read_u32(&code, ip) as usize;
                    }
                    Opcode::JumpFalsy => {
                        let dest = opcode::read_u32(&code, ip) as usize;
                        ip += 4;
                        if self.pop().is_falsy() {
                            ip = dest;
                        }
                    }
                    Opcode::JumpTruthy => {
                        let dest = opcode::read_u32(&code, ip) as usize;
                        ip += 4;
                        if !self.pop().is_falsy() {
                            ip = dest;
                        }
                    }
                    Opcode::AndJump => {
                        let dest = opcode::read_u32(&code, ip) as usize;
                        ip += 4;
                        if self.stack.last().expect("stack underflow").is_falsy() {
                            ip = dest;
                        } else {
                            self.pop();
                        }
                    }
                    Opcode::OrJump => {
                        let dest = opcode::read_u32(&code, ip) as usize;
                        ip += 4;
                        if self.stack.last().expect("stack underflow").is_falsy() {
                            self.pop();
                        } else {
                            ip = dest;
                        }
                    }

                    Opcode::MakeArray => {
                        let n = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let items = self.stack.split_off(self.stack.len() - n);
                        if let Err(e) = self.push(Value::array(items)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::MakeMap => {
                        let n = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let mut data = MapData::with_capacity(n);
                        let entries = self.stack.split_off(self.stack.len() - n * 2);
                        let mut it = entries.into_iter();
                        while let (Some(k), Some(v)) = (it.next(), it.next()) {
                            data.insert(k.key_string(), v);
                        }
                        if let Err(e) = self.push(Value::map(data)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::MakeClosure => {
                        let const_idx = opcode::read_u16(&code, ip) as usize;
                        let n = opcode::read_u8(&code, ip + 2) as usize;
                        ip += 3;
                        let cells = self.stack.split_off(self.stack.len() - n);
                        let mut free: SmallVec<[ObjectPtr; 4]> = SmallVec::new();
                        for cell in cells {
                            match cell {
                                Value::ObjectPtr(ptr) => free.push(ptr),
                                other => {
                                    // Defensive slot for a non-cell value.
                                    free.push(ObjectPtr::new(other));
                                }
                            }
                        }
                        let template = match &self.bytecode.constants[const_idx] {
                            Value::CompiledFunction(f) => f.clone(),
                            other => {
                                raise!(
                                    ErrorValue::with_message(
                                        ErrorKind::Type,
                                        format!(
                                            "closure constant is '{}', not a function",
                                            other.type_name()
                                        ),
                                    ),
                                    op_start
                                );
                            }
                        };
                        let closure = template.with_free(free);
                        if let Err(e) = self.push(Value::CompiledFunction(Rc::new(closure))) {
                            raise!(e.error, op_start);
                        }
                    }

                    Opcode::IndexGet => {
                        let idx = self.pop();
                        let target = self.pop();
                        match index::index_get(&target, &idx) {
                            Ok(v) => {
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }
                    Opcode::IndexSet => {
                        let idx = self.pop();
                        let target = self.pop();
                        let value = self.pop();
                        if let Err(e) = index::index_set(&target, &idx, value) {
                            raise!(e, op_start);
                        }
                    }
                    Opcode::SliceIndex => {
                        let high = self.pop();
                        let low = self.pop();
                        let target = self.pop();
                        match index::slice(&target, &low, &high) {
                            Ok(v) => {
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }

                    Opcode::IterInit => {
                        let target = self.pop();
                        match ValueIterator::new(&target) {
                            Ok(it) => {
                                let v = Value::Iterator(Rc::new(RefCell::new(it)));
                                if let Err(e) = self.push(v) {
                                    raise!(e.error, op_start);
                                }
                            }
                            Err(e) => raise!(e, op_start),
                        }
                    }
                    Opcode::IterNext => {
                        let it = self.pop();
                        let Value::Iterator(it) = it else {
                            raise!(
                                ErrorValue::with_message(ErrorKind::Type, "not an iterator"),
                                op_start
                            );
                        };
                        let more = it.borrow_mut().next();
                        if let Err(e) = self.push(Value::Bool(more)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::IterKey => {
                        let it = self.pop();
                        let Value::Iterator(it) = it else {
                            raise!(
                                ErrorValue::with_message(ErrorKind::Type, "not an iterator"),
                                op_start
                            );
                        };
                        let key = it.borrow().key();
                        if let Err(e) = self.push(key) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::IterValue => {
                        let it = self.pop();
                        let Value::Iterator(it) = it else {
                            raise!(
                                ErrorValue::with_message(ErrorKind::Type, "not an iterator"),
                                op_start
                            );
                        };
                        let value = it.borrow().value();
                        if let Err(e) = self.push(value) {
                            raise!(e.error, op_start);
                        }
                    }

                    Opcode::Call => {
                        let argc = opcode::read_u8(&code, ip) as usize;
                        let flags = opcode::read_u8(&code, ip + 1) as u8;
                        ip += 2;
                        if self.aborted.load(Ordering::Relaxed) {
                            return Err(self.aborted_error(&func, op_start));
                        }
                        self.frames.last_mut().expect("frame").ip = ip;
                        let call_pos = func.source_pos(op_start as u32);
                        match self.dispatch_call(argc, flags, call_pos) {
                            Ok(CallOutcome::FramePushed | CallOutcome::FrameReused) => {
                                continue 'frame;
                            }
                            Ok(CallOutcome::Returned) => {
                                // Builtin/host result already pushed.
                            }
                            Err(e) => {
                                let pos = func.source_pos(op_start as u32);
                                match self.raise(e, pos)? {
                                    Flow::Continue => continue 'frame,
                                    Flow::Done(v) => return Ok(v),
                                }
                            }
                        }
                    }
                    Opcode::Return => {
                        let v = self.pop();
                        self.frames.last_mut().expect("frame").ip = ip;
                        match self.unwind_return(v)? {
                            Flow::Continue => continue 'frame,
                            Flow::Done(v) => return Ok(v),
                        }
                    }
                    Opcode::ReturnUndefined => {
                        self.frames.last_mut().expect("frame").ip = ip;
                        match self.unwind_return(UNDEFINED)? {
                            Flow::Continue => continue 'frame,
                            Flow::Done(v) => return Ok(v),
                        }
                    }

                    Opcode::SetupTry => {
                        let catch_ip = opcode::read_u32(&code, ip);
                        let finally_ip = opcode::read_u32(&code, ip + 4);
                        ip += 8;
                        self.try_stack.push(TryRecord {
                            frame: frame_idx,
                            catch_ip: (catch_ip != NO_TARGET).then_some(catch_ip),
                            finally_ip,
                            sp: self.stack.len(),
                            in_catch: false,
                            finally_entered: false,
                            pending: Pending::None,
                        });
                    }
                    Opcode::Throw => {
                        ip += 1; // operand reserved
                        let v = self.pop();
                        let err = match v {
                            Value::RuntimeError(e) => *e,
                            other => RuntimeError::new(ops::to_error_value(&other)),
                        };
                        self.frames.last_mut().expect("frame").ip = ip;
                        let pos = func.source_pos(op_start as u32);
                        match self.raise(err, pos)? {
                            Flow::Continue => continue 'frame,
                            Flow::Done(v) => return Ok(v),
                        }
                    }
                    Opcode::Finalizer => {
                        let rec = self.try_stack.last_mut().expect("no try record");
                        debug_assert_eq!(rec.frame, frame_idx);
                        debug_assert!(!rec.finally_entered);
                        rec.finally_entered = true;
                        self.stack.truncate(rec.sp);
                        ip = rec.finally_ip as usize;
                    }
                    Opcode::EndTry => {
                        self.frames.last_mut().expect("frame").ip = ip;
                        match self.end_try()? {
                            Flow::Continue => continue 'frame,
                            Flow::Done(v) => return Ok(v),
                        }
                    }
                    Opcode::Defer => {
                        let dest = opcode::read_u32(&code, ip);
                        let depth = opcode::read_u8(&code, ip + 4);
                        ip += 5;
                        self.frames.last_mut().expect("frame").ip = ip;
                        self.defer_jump(dest, depth as u32);
                        continue 'frame;
                    }

                    Opcode::LoadModule => {
                        let const_idx = opcode::read_u16(&code, ip) as usize;
                        let module_idx = opcode::read_u16(&code, ip + 2) as usize;
                        ip += 4;
                        let (value, cached) = match &self.module_cache[module_idx] {
                            Some(v) => (v.clone(), true),
                            // First import of a native container gets a
                            // per-run copy, so runs stay isolated.
                            None => (self.bytecode.constants[const_idx].copy_value(), false),
                        };
                        if let Err(e) = self.push(value) {
                            raise!(e.error, op_start);
                        }
                        if let Err(e) = self.push(Value::Bool(cached)) {
                            raise!(e.error, op_start);
                        }
                    }
                    Opcode::StoreModule => {
                        let module_idx = opcode::read_u16(&code, ip) as usize;
                        ip += 2;
                        let value = self.stack.last().expect("stack underflow").clone();
                        self.module_cache[module_idx] = Some(value);
                    }

                    Opcode::NoOp => {}
                }
            }
        }
    }

    fn aborted_error(&self, func: &CompiledFunction, op_start: usize) -> RuntimeError {
        let mut err = RuntimeError::from_kind(ErrorKind::VMAborted);
        err.push_trace(func.source_pos(op_start as u32));
        err
    }

    // === calls ===

    fn dispatch_call(
        &mut self,
        argc: usize,
        flags: u8,
        call_pos: Pos,
    ) -> Result<CallOutcome, RuntimeError> {
        let mut argc = argc;

        // Spread: the last argument must be an array; splice it in.
        if flags & CALL_FLAG_SPREAD != 0 {
            let last = self.pop();
            let Value::Array(items) = last else {
                return Err(RuntimeError::with_message(
                    ErrorKind::Type,
                    format!("spread argument must be array, got '{}'", last.type_name()),
                ));
            };
            let items = items.borrow();
            argc = argc - 1 + items.len();
            if self.stack.len() + items.len() >= MAX_STACK {
                return Err(RuntimeError::from_kind(ErrorKind::StackOverflow));
            }
            self.stack.extend(items.iter().cloned());
        }

        let callee_at = self.stack.len() - argc - 1;
        let callee = self.stack[callee_at].clone();
        let callee = match callee {
            Value::ObjectPtr(cell) => cell.get(),
            other => other,
        };

        match callee {
            Value::CompiledFunction(target) => {
                self.call_compiled(target, argc, flags, call_pos)
            }
            Value::BuiltinFunction(desc) => {
                let result = self.invoke_host(|call| (desc.func)(call), argc)?;
                self.stack.truncate(callee_at);
                self.stack.push(result);
                Ok(CallOutcome::Returned)
            }
            Value::Function(host) => {
                let result = self.invoke_host(|call| host.invoke(call), argc)?;
                self.stack.truncate(callee_at);
                self.stack.push(result);
                Ok(CallOutcome::Returned)
            }
            Value::Foreign(obj) if obj.is_callable() => {
                let result = self.invoke_host(|call| obj.call(call), argc)?;
                self.stack.truncate(callee_at);
                self.stack.push(result);
                Ok(CallOutcome::Returned)
            }
            other => Err(RuntimeError::with_message(
                ErrorKind::NotCallable,
                format!("'{}' is not callable", other.type_name()),
            )),
        }
    }

    fn call_compiled(
        &mut self,
        target: Rc<CompiledFunction>,
        argc: usize,
        flags: u8,
        call_pos: Pos,
    ) -> Result<CallOutcome, RuntimeError> {
        arity_check(&target, argc).map_err(RuntimeError::new)?;

        let args_at = self.stack.len() - argc;

        // Collect the variadic tail into an array.
        if target.variadic {
            let fixed = target.num_params - 1;
            let rest: Vec<Value> = self.stack.split_off(args_at + fixed);
            self.stack.push(Value::array(rest));
        }

        // Tail call: reuse the current frame when no try record is live
        // for it (the compiler only flags calls outside try regions).
        let reusable = flags & CALL_FLAG_TAIL != 0
            && self
                .try_stack
                .last()
                .is_none_or(|rec| rec.frame != self.frames.len() - 1);
        if reusable {
            let frame = self.frames.last_mut().expect("frame");
            let base = frame.base;
            // Move [callee-slot is at args_at-1] the prepared args down
            // into the local slots of the reused frame.
            for i in 0..target.num_params {
                self.stack[base + i] = self.stack[args_at + i].clone();
            }
            self.stack.truncate(base + target.num_params);
            while self.stack.len() < base + target.num_locals {
                self.stack.push(UNDEFINED);
            }
            frame.func = target;
            frame.ip = 0;
            return Ok(CallOutcome::FrameReused);
        }

        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::with_message(
                ErrorKind::StackOverflow,
                "call stack exhausted",
            ));
        }
        if self.stack.len() + target.num_locals >= MAX_STACK {
            return Err(RuntimeError::from_kind(ErrorKind::StackOverflow));
        }
        // Remaining locals start undefined.
        for _ in target.num_params..target.num_locals {
            self.stack.push(UNDEFINED);
        }
        self.frames.push(Frame {
            func: target,
            ip: 0,
            base: args_at,
            call_pos,
        });
        Ok(CallOutcome::FramePushed)
    }

    /// Invoke a builtin/host callable with the top `argc` stack values as
    /// arguments. The arguments stay on the stack during the call.
    fn invoke_host(
        &mut self,
        f: impl Fn(&mut Call<'_>) -> Result<Value, ErrorValue>,
        argc: usize,
    ) -> Result<Value, RuntimeError> {
        let args_at = self.stack.len() - argc;
        let mut call = Call {
            args: &self.stack[args_at..],
            named: None,
            globals: &self.globals,
            sink: &mut *self.sink,
        };
        let outcome = if self.recover_panics {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&mut call))) {
                Ok(result) => result,
                Err(panic) => {
                    let text = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "host panic".to_string());
                    Err(ErrorValue::new(format!("panic: {text}")))
                }
            }
        } else {
            f(&mut call)
        };
        outcome.map_err(RuntimeError::new)
    }

    // === returns, throws, finally ===

    /// Perform a `return`, routing through any live `finally` blocks of
    /// the current frame first.
    fn unwind_return(&mut self, value: Value) -> Result<Flow, RuntimeError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            if let Some(rec) = self.try_stack.last_mut() {
                if rec.frame == frame_idx {
                    if !rec.finally_entered {
                        rec.finally_entered = true;
                        rec.pending = Pending::Return(value);
                        let (sp, finally_ip) = (rec.sp, rec.finally_ip);
                        self.stack.truncate(sp);
                        self.frames[frame_idx].ip = finally_ip as usize;
                        return Ok(Flow::Continue);
                    }
                    // Returning from inside a finally overrides whatever
                    // was pending for this record.
                    self.try_stack.pop();
                    continue;
                }
            }

            let frame = self.frames.pop().expect("frame");
            if self.frames.is_empty() {
                return Ok(Flow::Done(value));
            }
            // Drop the callee value along with the callee's stack region.
            self.stack.truncate(frame.base - 1);
            self.stack.push(value);
            return Ok(Flow::Continue);
        }
    }

    /// Raise an error at `pos`: find a handler, running finally blocks
    /// and unwinding frames as needed. `Err` means no handler exists.
    fn raise(&mut self, mut err: RuntimeError, pos: Pos) -> Result<Flow, RuntimeError> {
        err.push_trace(pos);
        loop {
            let Some(rec) = self.try_stack.last_mut() else {
                // Unwind completely, collecting the trace.
                while let Some(frame) = self.frames.pop() {
                    err.push_trace(frame.call_pos);
                }
                return Err(err);
            };

            // Pop frames above the handler's frame.
            while self.frames.len() - 1 > rec.frame {
                let frame = self.frames.pop().expect("frame");
                err.push_trace(frame.call_pos);
            }

            if rec.catch_ip.is_some() && !rec.in_catch && !rec.finally_entered {
                rec.in_catch = true;
                let (sp, catch_ip) = (rec.sp, rec.catch_ip.expect("catch"));
                self.stack.truncate(sp);
                // Bind the error value for the catch clause; the cause
                // chain on the inner error is preserved.
                self.stack.push(Value::Error(Rc::new(err.error.clone())));
                let frame_idx = self.frames.len() - 1;
                self.frames[frame_idx].ip = catch_ip as usize;
                return Ok(Flow::Continue);
            }

            if !rec.finally_entered {
                rec.finally_entered = true;
                rec.pending = Pending::Error(err);
                let (sp, finally_ip) = (rec.sp, rec.finally_ip);
                self.stack.truncate(sp);
                let frame_idx = self.frames.len() - 1;
                self.frames[frame_idx].ip = finally_ip as usize;
                return Ok(Flow::Continue);
            }

            // The error was raised from inside this record's finally (or
            // its catch after finally ran): discard it and look outward.
            self.try_stack.pop();
        }
    }

    /// Close the innermost try record and resolve its pending action.
    fn end_try(&mut self) -> Result<Flow, RuntimeError> {
        let rec = self.try_stack.pop().expect("no try record at EndTry");
        match rec.pending {
            Pending::None => Ok(Flow::Continue),
            Pending::Return(v) => self.unwind_return(v),
            Pending::Error(err) => {
                // Re-raise outward; position was already recorded.
                self.raise(err, NO_POS)
            }
            Pending::Jump { dest, remaining } => {
                if remaining == 0 {
                    let frame_idx = self.frames.len() - 1;
                    self.frames[frame_idx].ip = dest as usize;
                    Ok(Flow::Continue)
                } else {
                    self.defer_jump(dest, remaining);
                    Ok(Flow::Continue)
                }
            }
        }
    }

    /// A `break`/`continue` leaving `depth` try regions: run each
    /// region's finally on the way out, then jump.
    fn defer_jump(&mut self, dest: u32, depth: u32) {
        let mut remaining = depth;
        let frame_idx = self.frames.len() - 1;
        loop {
            debug_assert!(remaining > 0);
            let rec = self
                .try_stack
                .last_mut()
                .expect("defer without try record");
            debug_assert_eq!(rec.frame, frame_idx);
            if !rec.finally_entered {
                rec.finally_entered = true;
                rec.pending = Pending::Jump {
                    dest,
                    remaining: remaining - 1,
                };
                let (sp, finally_ip) = (rec.sp, rec.finally_ip);
                self.stack.truncate(sp);
                self.frames[frame_idx].ip = finally_ip as usize;
                return;
            }
            // Jumping out of this record's own finally: whatever was
            // pending is overridden, the record is done.
            self.try_stack.pop();
            remaining -= 1;
            if remaining == 0 {
                self.frames[frame_idx].ip = dest as usize;
                return;
            }
        }
    }
}

enum CallOutcome {
    FramePushed,
    FrameReused,
    Returned,
}

fn arity_check(func: &CompiledFunction, argc: usize) -> Result<(), ErrorValue> {
    if func.variadic {
        if argc + 1 < func.num_params {
            return Err(ErrorValue::with_message(
                ErrorKind::WrongNumArguments,
                format!("want>={} got={}", func.num_params - 1, argc),
            ));
        }
    } else if argc != func.num_params {
        return Err(ErrorValue::with_message(
            ErrorKind::WrongNumArguments,
            format!("want={} got={}", func.num_params, argc),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{compile, CompileOptions};
    use crate::value::HostFunction;

    fn run_src(src: &str) -> Result<Value, RuntimeError> {
        run_with(src, UNDEFINED, &[])
    }

    fn run_with(src: &str, globals: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let bc = compile(src, &CompileOptions::default()).expect("compile failed");
        Vm::new(bc).run(globals, args)
    }

    fn expect_value(src: &str, expected: Value) {
        let got = run_src(src).expect("run failed");
        assert!(got.equals(&expected), "got {got:?}, want {expected:?}");
    }

    #[test]
    fn test_arithmetic_and_return() {
        expect_value("return 1 + 2 * 3", Value::Int(7));
        expect_value("return", UNDEFINED);
        expect_value("x := 10\nx -= 4\nreturn x", Value::Int(6));
    }

    #[test]
    fn test_fibonacci_scenario() {
        let src = "param n\nvar f\nf = func(x) { if x < 2 { return x }\nreturn f(x-1) + f(x-2) }\nreturn f(n)";
        let got = run_with(src, UNDEFINED, &[Value::Int(15)]).unwrap();
        assert_eq!(got, Value::Int(610));
    }

    #[test]
    fn test_closure_counter_scenario() {
        let src = "var c = 0\ninc := func() { c++\nreturn c }\nreturn [inc(), inc(), inc()]";
        expect_value(
            src,
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
    }

    #[test]
    fn test_try_finally_scenario() {
        let sink = SharedBuffer::new();
        let src = "try { throw error(\"x\") } catch e { return e.Message } finally { println(\"f\") }";
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let mut vm = Vm::new(bc).with_print_writer(sink.clone());
        let got = vm.run(UNDEFINED, &[]).unwrap();
        assert_eq!(got, Value::string("x"));
        assert_eq!(sink.contents(), b"f\n");
    }

    #[test]
    fn test_map_iteration_scenario() {
        let src = "m := {a: 1, b: 2}\ns := 0\nfor _, v in m { s += v }\nreturn s";
        expect_value(src, Value::Int(3));
    }

    #[test]
    fn test_variadic_spread_scenario() {
        let src = "f := func(a, ...b) { return b }\nreturn f(1, [2, 3, 4]...)";
        expect_value(
            src,
            Value::array(vec![Value::Int(2), Value::Int(3), Value::Int(4)]),
        );
    }

    #[test]
    fn test_tail_loop_scenario() {
        let src = "var it\nit = func(n, m) { if n == m { return n }\nreturn it(n+1, m) }\nreturn it(0, 9999)";
        expect_value(src, Value::Int(9999));
    }

    #[test]
    fn test_variadic_accepts_empty_tail() {
        expect_value("f := func(a, ...b) { return b }\nreturn f(1)", Value::array(vec![]));
        let err = run_src("f := func(a, ...b) { return 0 }\nreturn f()").unwrap_err();
        assert!(err.is_kind(ErrorKind::WrongNumArguments));
    }

    #[test]
    fn test_short_circuit_laws() {
        // The right side must not evaluate, or boom() would be called.
        expect_value("boom := func() { throw error(\"boom\") }\nreturn false && boom()", Value::Bool(false));
        expect_value("boom := func() { throw error(\"boom\") }\nreturn true || boom()", Value::Bool(true));
        // The decisive operand is the value of the expression.
        expect_value("return 0 && 5", Value::Int(0));
        expect_value("return 2 && 5", Value::Int(5));
        expect_value("return 3 || 9", Value::Int(3));
        expect_value("return 0 || 9", Value::Int(9));
    }

    #[test]
    fn test_boundary_behaviors() {
        let err = run_src("return \"x\"[1]").unwrap_err();
        assert!(err.is_kind(ErrorKind::IndexOutOfBounds));

        let err = run_src("a := [1]\nreturn a[-1]").unwrap_err();
        assert!(err.is_kind(ErrorKind::IndexOutOfBounds));

        let err = run_src("a := [1, 2]\nreturn a[2:1]").unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidIndex));

        let err = run_src("return 5 / 0").unwrap_err();
        assert!(err.is_kind(ErrorKind::ZeroDivision));

        expect_value("return undefined.a.b", UNDEFINED);
        expect_value("return undefined[0]", UNDEFINED);
    }

    #[test]
    fn test_runtime_error_trace_positions() {
        let src = "f := func() { return 1 / 0 }\ng := func() { return f() }\nreturn g()";
        let err = run_src(src).unwrap_err();
        assert!(err.is_kind(ErrorKind::ZeroDivision));
        let positions = err.positions();
        assert!(
            positions.len() >= 2,
            "expected a multi-frame trace, got {positions:?}"
        );
        // Deepest position first: the division inside f on line 1.
        assert_eq!(positions[0].line, 1);
    }

    #[test]
    fn test_closures_share_bindings() {
        let src = "\
counter := func() {
    n := 0
    bump := func() { n++\nreturn n }
    read := func() { return n }
    return [bump, read]
}
pair := counter()
bump := pair[0]
read := pair[1]
bump()
bump()
return read()";
        expect_value(src, Value::Int(2));
    }

    #[test]
    fn test_catch_without_binding_and_rethrow() {
        expect_value(
            "x := 0\ntry { throw error(\"a\") } catch { x = 1 }\nreturn x",
            Value::Int(1),
        );
        let err = run_src("try { throw error(\"inner\") } catch e { throw e }").unwrap_err();
        assert_eq!(err.error.message, "inner");
    }

    #[test]
    fn test_finally_runs_on_every_path() {
        // Normal completion, catch completion, and return all run finally
        // exactly once.
        let src = "\
global log
log = 0
f := func() {
    try {
        return 1
    } finally {
        log += 10
    }
}
try { throw error(\"x\") } catch { log += 1 } finally { log += 100 }
r := f()
return [r, log]";
        let globals = Value::map(MapData::new());
        let got = run_with(src, globals, &[]).unwrap();
        assert_eq!(
            got,
            Value::array(vec![Value::Int(1), Value::Int(111)])
        );
    }

    #[test]
    fn test_unhandled_throw_after_finally_rethrows() {
        let src = "global log\nlog = 0\ntry { throw error(\"boom\") } finally { log = 7 }";
        let globals = Value::map(MapData::new());
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let err = Vm::new(bc).run(globals.clone(), &[]).unwrap_err();
        assert_eq!(err.error.message, "boom");
        assert_eq!(
            index::index_get(&globals, &Value::string("log")).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn test_break_and_continue_through_finally() {
        let src = "\
out := 0
for i := 0; i < 3; i++ {
    try {
        if i == 1 { continue }
        out += 10
    } finally {
        out++
    }
}
return out";
        expect_value(src, Value::Int(23));

        let src = "\
out := 0
for {
    try { break } finally { out = 5 }
}
return out";
        expect_value(src, Value::Int(5));
    }

    #[test]
    fn test_throw_across_frames_caught_in_caller() {
        let src = "\
f := func() { throw error(\"deep\") }
try {
    f()
} catch e {
    return e.Message
}";
        expect_value(src, Value::string("deep"));
    }

    #[test]
    fn test_globals_roundtrip() {
        let globals = Value::map(MapData::new());
        let got = run_with("global x\nx = 5\nreturn x + 1", globals.clone(), &[]).unwrap();
        assert_eq!(got, Value::Int(6));
        assert_eq!(
            index::index_get(&globals, &Value::string("x")).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn test_sync_map_globals() {
        let globals = Value::sync_map(MapData::new());
        let src = "global n\nn = 1\ns := 0\nfor _, v in globals() { s += v }\nreturn s";
        let got = run_with(src, globals, &[]).unwrap();
        assert_eq!(got, Value::Int(1));
    }

    #[test]
    fn test_module_evaluated_once() {
        let mut options = CompileOptions::default();
        options
            .module_map
            .add_source("counter", "global n\nn += 1\nreturn n");
        let src = "a := import(\"counter\")\nb := import(\"counter\")\nreturn [a, b]";
        let bc = compile(src, &options).unwrap();
        let globals = Value::map({
            let mut m = MapData::new();
            m.insert("n".into(), Value::Int(0));
            m
        });
        let got = Vm::new(bc).run(globals, &[]).unwrap();
        // One evaluation, cached for the second import.
        assert_eq!(got, Value::array(vec![Value::Int(1), Value::Int(1)]));
    }

    #[test]
    fn test_native_module() {
        let mut options = CompileOptions::default();
        let mut map = crate::modules::ModuleMap::new();
        map.add_native_exports("math", [("two", Value::Int(2))]);
        options.module_map = map;
        let bc = compile("m := import(\"math\")\nreturn m.two + 1", &options).unwrap();
        let got = Vm::new(bc).run(UNDEFINED, &[]).unwrap();
        assert_eq!(got, Value::Int(3));
    }

    #[test]
    fn test_host_function_and_call_convention() {
        let src = "param add\nreturn add(2, 3)";
        let add = Value::Function(Rc::new(HostFunction::positional("add", |args| {
            match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                _ => Err(ErrorValue::kind(ErrorKind::Type)),
            }
        })));
        let got = run_with(src, UNDEFINED, &[add]).unwrap();
        assert_eq!(got, Value::Int(5));
    }

    #[test]
    fn test_not_callable() {
        let err = run_src("x := 1\nreturn x()").unwrap_err();
        assert!(err.is_kind(ErrorKind::NotCallable));
    }

    #[test]
    fn test_abort_is_prompt() {
        let src = "param f\nf()\nfor i := 0; i < 1000000; i++ { }\nreturn 1";
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let mut vm = Vm::new(bc);
        let handle = vm.abort_handle();
        let f = Value::Function(Rc::new(HostFunction::new("aborter", move |_call| {
            handle.abort();
            Ok(UNDEFINED)
        })));
        let err = vm.run(UNDEFINED, &[f]).unwrap_err();
        assert!(err.is_kind(ErrorKind::VMAborted));
    }

    #[test]
    fn test_abort_bypasses_try() {
        let src = "param f\ntry { f()\nfor { } } catch { return \"caught\" }\nreturn 2";
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let mut vm = Vm::new(bc);
        let handle = vm.abort_handle();
        let f = Value::Function(Rc::new(HostFunction::new("aborter", move |_call| {
            handle.abort();
            Ok(UNDEFINED)
        })));
        let err = vm.run(UNDEFINED, &[f]).unwrap_err();
        assert!(err.is_kind(ErrorKind::VMAborted));
    }

    #[test]
    fn test_panic_recovery() {
        let src = "param f\nreturn f()";
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let panicking = Value::Function(Rc::new(HostFunction::new("explode", |_call| {
            panic!("kaboom");
        })));

        let mut vm = Vm::new(bc);
        vm.set_recover_panics(true);
        let err = vm.run(UNDEFINED, &[panicking]).unwrap_err();
        assert!(err.error.message.contains("kaboom"));
    }

    #[test]
    fn test_string_iteration_yields_chars() {
        let src = "s := 0\nfor _, c in \"ab\" { s += int(c) }\nreturn s";
        expect_value(src, Value::Int(195));
    }

    #[test]
    fn test_for_in_over_bytes() {
        let src = "s := 0\nfor _, b in bytes(\"ab\") { s += b }\nreturn s";
        expect_value(src, Value::Int(195));
    }

    #[test]
    fn test_destructuring_runtime() {
        expect_value(
            "a, b := [1, 2, 3]\nreturn [a, b]",
            Value::array(vec![Value::Int(1), Value::Int(2)]),
        );
        expect_value(
            "a, b, c := [1]\nreturn [a, b, c]",
            Value::array(vec![Value::Int(1), UNDEFINED, UNDEFINED]),
        );
        expect_value(
            "a, b := 1, 2\nreturn [b, a]",
            Value::array(vec![Value::Int(2), Value::Int(1)]),
        );
        // Swap through an existing binding.
        expect_value(
            "a := 1\nb := 2\na, b = [b, a]\nreturn [a, b]",
            Value::array(vec![Value::Int(2), Value::Int(1)]),
        );
    }

    #[test]
    fn test_run_compiled_function() {
        let src = "return func(x) { return x * 2 }";
        let bc = compile(src, &CompileOptions::default()).unwrap();
        let mut vm = Vm::new(bc);
        let returned = vm.run(UNDEFINED, &[]).unwrap();
        let Value::CompiledFunction(f) = returned else {
            panic!("expected a function, got {returned:?}");
        };
        let got = vm
            .run_compiled_function(&f, UNDEFINED, &[Value::Int(21)])
            .unwrap();
        assert_eq!(got, Value::Int(42));
    }

    #[test]
    fn test_selector_and_index_assignment() {
        expect_value(
            "m := {a: 1}\nm.a = 2\nm[\"b\"] = 3\nm.a += 10\nreturn m.a + m.b",
            Value::Int(15),
        );
        expect_value(
            "a := [1, 2]\na[0] = 9\na[1] += 1\nreturn a",
            Value::array(vec![Value::Int(9), Value::Int(3)]),
        );
    }

    #[test]
    fn test_conditional_expression() {
        expect_value("x := 5\nreturn x > 3 ? \"big\" : \"small\"", Value::string("big"));
    }

    #[test]
    fn test_nested_loops_with_break() {
        let src = "\
total := 0
for i := 0; i < 3; i++ {
    for j := 0; j < 3; j++ {
        if j == 2 { break }
        total += 1
    }
}
return total";
        expect_value(src, Value::Int(6));
    }

    #[test]
    fn test_frame_overflow_is_stack_overflow() {
        let src = "var f\nf = func(n) { return 1 + f(n + 1) }\nreturn f(0)";
        let err = run_src(src).unwrap_err();
        assert!(err.is_kind(ErrorKind::StackOverflow));
    }
}
