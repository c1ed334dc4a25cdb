//! uGO core: an embeddable, dynamically-typed scripting language.
//!
//! A host compiles source to a compact [`Bytecode`] artifact with
//! [`compile`], then runs it on a stack-based [`Vm`], passing globals and
//! arguments and receiving a [`Value`] or a [`RuntimeError`] with a
//! source-position trace.
//!
//! ```no_run
//! use ugo_core::{compile, CompileOptions, Value, Vm, UNDEFINED};
//!
//! let bytecode = compile("param n\nreturn n * 2", &CompileOptions::default())?;
//! let mut vm = Vm::new(bytecode);
//! let result = vm.run(UNDEFINED, &[Value::Int(21)])?;
//! assert_eq!(result, Value::Int(42));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod api;
pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod modules;
pub mod optimizer;
pub mod parser;
pub mod source;
pub mod symbol_table;
pub mod token;
pub mod value;
pub mod vm;

pub use api::{compile, compile_named, CompileOptions};
pub use bytecode::Bytecode;
pub use errors::{CompileError, ErrorKind, ErrorValue, RuntimeError};
pub use modules::{ModuleMap, ModuleProvider};
pub use value::{ForeignObject, HostFunction, Value, UNDEFINED};
pub use vm::{SharedBuffer, Vm, VmAbortHandle};

/// Test utilities for enabling logging in tests.
#[cfg(test)]
pub mod test_utils {
    /// Initialize a tracing subscriber for tests; call at the start of a
    /// test to see `trace_compiler`-style output.
    pub fn init_test_logging() {
        use tracing_subscriber::{fmt, EnvFilter};

        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }
}
