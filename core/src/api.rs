//! The host embedding surface: compile options and the `compile`
//! entry point. Execution lives in [`crate::vm::Vm`].

use std::rc::Rc;

use crate::bytecode::Bytecode;
use crate::compiler::Compiler;
use crate::errors::CompileError;
use crate::modules::ModuleMap;
use crate::optimizer::Optimizer;
use crate::parser;
use crate::source::FileSet;

/// Options for one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Modules resolvable through `import("name")`.
    pub module_map: ModuleMap,
    /// Fold pure constant expressions at the AST level.
    pub optimize_constants: bool,
    /// Eliminate branches with constant tests at the AST level.
    pub optimize_expressions: bool,
    /// Upper bound on optimizer passes.
    pub optimizer_max_cycles: usize,
    /// Emit `tracing` events from the parser.
    pub trace_parser: bool,
    /// Emit `tracing` events from the compiler.
    pub trace_compiler: bool,
    /// Emit `tracing` events from the optimizer.
    pub trace_optimizer: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            module_map: ModuleMap::new(),
            optimize_constants: true,
            optimize_expressions: true,
            optimizer_max_cycles: 100,
            trace_parser: false,
            trace_compiler: false,
            trace_optimizer: false,
        }
    }
}

impl CompileOptions {
    /// Whether any optimizer pass should run.
    pub fn optimize(&self) -> bool {
        self.optimize_constants || self.optimize_expressions
    }
}

/// Compile uGO source to bytecode.
///
/// All parse and compile problems are aggregated into the returned
/// [`CompileError`]; none of them ever reach VM execution.
pub fn compile(source: &str, options: &CompileOptions) -> Result<Bytecode, CompileError> {
    compile_named(source, "(main)", options)
}

/// [`compile`] with an explicit file name for diagnostics.
pub fn compile_named(
    source: &str,
    filename: &str,
    options: &CompileOptions,
) -> Result<Bytecode, CompileError> {
    let mut file_set = FileSet::new();
    let mut stmts = match parser::parse(&mut file_set, filename, source, options.trace_parser) {
        Ok(stmts) => stmts,
        Err(diagnostics) => {
            return Err(CompileError::new(diagnostics, Rc::new(file_set)));
        }
    };

    if options.optimize() {
        Optimizer::new(options.optimizer_max_cycles, options.trace_optimizer)
            .with_flags(options.optimize_constants, options.optimize_expressions)
            .optimize(&mut stmts);
    }

    let program = match Compiler::new(options, &mut file_set).compile_main(&stmts) {
        Ok(program) => program,
        Err(diagnostics) => {
            return Err(CompileError::new(diagnostics, Rc::new(file_set)));
        }
    };

    Ok(Bytecode {
        main: program.main,
        constants: program.constants,
        num_modules: program.num_modules,
        file_set: Rc::new(file_set),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_ok() {
        let bc = compile("x := 1\nreturn x + 2", &CompileOptions::default()).unwrap();
        assert_eq!(bc.num_modules, 0);
        assert_eq!(bc.file_set.files().len(), 1);
    }

    #[test]
    fn test_compile_error_carries_positions() {
        let err = compile("x := )\n", &CompileOptions::default()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("(main):1:"), "got: {text}");
    }

    #[test]
    fn test_optimizer_respects_flags() {
        let mut options = CompileOptions::default();
        options.optimize_constants = false;
        options.optimize_expressions = false;
        let bc = compile("return 1 + 2", &options).unwrap();
        // Unoptimized: both literals in the pool.
        assert!(bc.constants.len() >= 2);

        let bc = compile("return 1 + 2", &CompileOptions::default()).unwrap();
        assert_eq!(bc.constants.len(), 1);
    }
}
