//! The `ugo` command: run a script file, or start a REPL.

use std::path::PathBuf;
use std::process::ExitCode;

use ariadne::{Label, Report, ReportKind, Source};
use clap::Parser;
use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use ugo::{compile_named, CompileError, CompileOptions, Value, Vm, UNDEFINED};

/// uGO — an embeddable, dynamically-typed scripting language
#[derive(Parser, Debug)]
#[command(name = "ugo")]
#[command(about = "Run uGO scripts", long_about = None)]
struct Args {
    /// Script file to run (starts a REPL when omitted)
    file: Option<PathBuf>,

    /// Arguments passed to the script's `param` declarations
    script_args: Vec<String>,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    dump_bytecode: bool,

    /// Disable the AST optimizer
    #[arg(long)]
    no_optimize: bool,

    /// Emit parser trace events
    #[arg(long)]
    trace_parser: bool,

    /// Emit compiler trace events
    #[arg(long)]
    trace_compiler: bool,

    /// Emit optimizer trace events
    #[arg(long)]
    trace_optimizer: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let mut options = CompileOptions::default();
    options.optimize_constants = !args.no_optimize;
    options.optimize_expressions = !args.no_optimize;
    options.trace_parser = args.trace_parser;
    options.trace_compiler = args.trace_compiler;
    options.trace_optimizer = args.trace_optimizer;

    match &args.file {
        Some(path) => run_file(path, &args, &options),
        None => repl(&options),
    }
}

fn run_file(path: &PathBuf, args: &Args, options: &CompileOptions) -> ExitCode {
    let filename = path.display().to_string();
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("ugo: cannot read {filename}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bytecode = match compile_named(&source, &filename, options) {
        Ok(bytecode) => bytecode,
        Err(err) => {
            render_compile_error(&err, &filename, &source);
            return ExitCode::FAILURE;
        }
    };

    if args.dump_bytecode {
        println!("{bytecode:?}");
        return ExitCode::SUCCESS;
    }

    let script_args: Vec<Value> = args.script_args.iter().map(|s| parse_arg(s)).collect();
    let mut vm = Vm::new(bytecode);
    match vm.run(UNDEFINED, &script_args) {
        Ok(Value::Undefined) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Script arguments: integers when they parse, strings otherwise.
fn parse_arg(text: &str) -> Value {
    match text.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::string(text),
    }
}

/// Labeled source reports for the main file; diagnostics pointing into
/// module sources fall back to the plain rendering.
fn render_compile_error(err: &CompileError, filename: &str, source: &str) {
    for diagnostic in &err.diagnostics {
        let in_main = err
            .file_set
            .file_for(diagnostic.pos)
            .is_some_and(|f| f.name == filename);
        if !in_main {
            match err.file_set.position(diagnostic.pos) {
                Some(p) => eprintln!("{p}: {}", diagnostic.message),
                None => eprintln!("{}", diagnostic.message),
            }
            continue;
        }
        let offset = err
            .file_set
            .file_for(diagnostic.pos)
            .map(|f| (diagnostic.pos - f.base) as usize)
            .unwrap_or(0);
        let span = offset..(offset + 1).min(source.len().max(1));
        let _ = Report::build(ReportKind::Error, (filename, span.clone()))
            .with_message(&diagnostic.message)
            .with_label(Label::new((filename, span)).with_message(&diagnostic.message))
            .finish()
            .eprint((filename, Source::from(source)));
    }
}

fn repl(options: &CompileOptions) -> ExitCode {
    let mut editor = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("ugo".into()),
        DefaultPromptSegment::Empty,
    );

    // One globals map for the whole session: bind REPL state with
    // `global x` to keep it across lines.
    let globals = Value::map(Default::default());
    println!("uGO REPL — use `global name` to keep bindings across lines; Ctrl-D exits.");

    loop {
        match editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                eval_line(line, options, &globals);
            }
            Ok(Signal::CtrlC) => continue,
            Ok(Signal::CtrlD) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("ugo: readline error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn eval_line(line: &str, options: &CompileOptions, globals: &Value) {
    // Expression lines echo their value: try `return <line>` first, then
    // fall back to compiling the line as statements.
    let as_expr = format!("return {line}");
    let bytecode = match compile_named(&as_expr, "(repl)", options) {
        Ok(bytecode) => Ok(bytecode),
        Err(_) => compile_named(line, "(repl)", options),
    };
    match bytecode {
        Ok(bytecode) => {
            let mut vm = Vm::new(bytecode);
            match vm.run(globals.clone(), &[]) {
                Ok(Value::Undefined) => {}
                Ok(value) => println!("{value}"),
                Err(err) => eprintln!("{err}"),
            }
        }
        Err(err) => eprintln!("{err}"),
    }
}
