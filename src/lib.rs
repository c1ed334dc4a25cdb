//! uGO — an embeddable, dynamically-typed scripting language.
//!
//! This crate is the convenience surface over [`ugo_core`]: it re-exports
//! the embedding API and adds one-call helpers for the common
//! compile-then-run flow.
//!
//! ```no_run
//! use ugo::{run_source, CompileOptions, Value, UNDEFINED};
//!
//! let out = run_source(
//!     "param n\nreturn n * n",
//!     &CompileOptions::default(),
//!     UNDEFINED,
//!     &[Value::Int(9)],
//! )?;
//! assert_eq!(out, Value::Int(81));
//! # Ok::<(), ugo::RunError>(())
//! ```

pub use ugo_core::{
    compile, compile_named, Bytecode, CompileError, CompileOptions, ErrorKind, ErrorValue,
    ForeignObject, HostFunction, ModuleMap, ModuleProvider, RuntimeError, SharedBuffer, Value,
    Vm, VmAbortHandle, UNDEFINED,
};

/// Everything that can go wrong in a compile-then-run flow.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Compile `source` and run it in a fresh VM.
pub fn run_source(
    source: &str,
    options: &CompileOptions,
    globals: Value,
    args: &[Value],
) -> Result<Value, RunError> {
    let bytecode = compile(source, options)?;
    let mut vm = Vm::new(bytecode);
    Ok(vm.run(globals, args)?)
}

/// Compile `source` and run it with output captured into the returned
/// string alongside the result.
pub fn run_source_captured(
    source: &str,
    options: &CompileOptions,
    globals: Value,
    args: &[Value],
) -> Result<(Value, String), RunError> {
    let bytecode = compile(source, options)?;
    let sink = SharedBuffer::new();
    let mut vm = Vm::new(bytecode).with_print_writer(sink.clone());
    let value = vm.run(globals, args)?;
    Ok((value, sink.take_string()))
}
