//! Error taxonomy and exception-handling behaviors.

use indoc::indoc;
use pretty_assertions::assert_eq;
use ugo::{run_source, CompileOptions, ErrorKind, RunError, Value, UNDEFINED};

fn run(src: &str) -> Value {
    run_source(src, &CompileOptions::default(), UNDEFINED, &[])
        .unwrap_or_else(|e| panic!("run failed: {e}"))
}

fn run_err(src: &str) -> RunError {
    run_source(src, &CompileOptions::default(), UNDEFINED, &[])
        .err()
        .expect("expected failure")
}

#[test]
fn sentinels_are_matchable_with_is_error() {
    let src = indoc! {r#"
        try {
            _ = 5 / 0
        } catch e {
            return [isError(e), isError(e, ZeroDivisionError), isError(e, TypeError)]
        }
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::Bool(true), Value::Bool(false)])
    );
}

#[test]
fn derived_errors_keep_sentinel_identity() {
    // An error caught and rewrapped by script code still matches its
    // sentinel through the cause chain.
    let src = indoc! {r#"
        inner := func() {
            _ = [1][5]
        }
        try {
            inner()
        } catch e {
            try {
                throw e
            } catch outer {
                return [isError(outer, IndexOutOfBoundsError), outer.Message != ""]
            }
        }
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::Bool(true)])
    );
}

#[test]
fn error_fields() {
    let src = indoc! {r#"
        e := error("went wrong")
        return [e.Name, e.Message, e.Cause]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::string("error"),
            Value::string("went wrong"),
            UNDEFINED
        ])
    );
}

#[test]
fn new_derives_with_cause_chain() {
    let src = indoc! {r#"
        try {
            _ = 5 / 0
        } catch e {
            wrapped := e.New("while computing totals")
            return [
                wrapped.Message,
                wrapped.Cause.Message,
                isError(wrapped, ZeroDivisionError),
            ]
        }
    "#};
    let got = run(src);
    let expected = Value::array(vec![
        Value::string("while computing totals"),
        Value::string("division by zero"),
        Value::Bool(true),
    ]);
    assert!(got.equals(&expected), "got {got:?}");
}

#[test]
fn runtime_errors_carry_traces() {
    let src = "f := func() { return [1][3] }\nreturn f()";
    let RunError::Runtime(err) = run_err(src) else {
        panic!("expected runtime error");
    };
    assert!(err.is_kind(ErrorKind::IndexOutOfBounds));
    let rendered = err.to_string();
    assert!(
        rendered.contains("(main):1:"),
        "trace should name the file and line: {rendered}"
    );
}

#[test]
fn compile_errors_never_reach_the_vm() {
    let RunError::Compile(err) = run_err("x := ") else {
        panic!("expected compile error");
    };
    assert!(!err.diagnostics.is_empty());

    let RunError::Compile(err) = run_err("return y") else {
        panic!("expected compile error");
    };
    assert!(err.to_string().contains("unresolved reference"));
}

#[test]
fn multiple_diagnostics_are_aggregated() {
    let RunError::Compile(err) = run_err("return a + b") else {
        panic!("expected compile error");
    };
    assert!(err.diagnostics.len() >= 2, "got {:?}", err.diagnostics);
}

#[test]
fn throw_arbitrary_values_becomes_errors() {
    let src = indoc! {r#"
        try {
            throw "plain text"
        } catch e {
            return [isError(e), e.Message]
        }
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::string("plain text")])
    );
}

#[test]
fn finally_runs_exactly_once_per_path() {
    let src = indoc! {r#"
        runs := 0
        r1 := 0
        try { r1 = 1 } finally { runs++ }
        try { throw error("x") } catch { r1 = 2 } finally { runs++ }
        f := func() {
            try { return 3 } finally { runs++ }
        }
        r2 := f()
        return [r1, r2, runs]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Int(2), Value::Int(3), Value::Int(3)])
    );
}

#[test]
fn nested_finallys_unwind_in_order() {
    let src = indoc! {r#"
        order := []
        f := func() {
            try {
                try {
                    return "v"
                } finally {
                    order = append(order, 1)
                }
            } finally {
                order = append(order, 2)
            }
        }
        r := f()
        return [r, order]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::string("v"),
            Value::array(vec![Value::Int(1), Value::Int(2)]),
        ])
    );
}

#[test]
fn error_in_finally_replaces_pending_error() {
    let src = indoc! {r#"
        try {
            try {
                throw error("first")
            } finally {
                throw error("second")
            }
        } catch e {
            return e.Message
        }
    "#};
    assert_eq!(run(src), Value::string("second"));
}

#[test]
fn invalid_operator_reports_both_types() {
    let RunError::Runtime(err) = run_err("return \"a\" - 1") else {
        panic!("expected runtime error");
    };
    assert!(err.is_kind(ErrorKind::InvalidOperator));
    assert!(err.error.message.contains("string"));
    assert!(err.error.message.contains("int"));
}

#[test]
fn wrong_num_arguments_message() {
    let RunError::Runtime(err) = run_err("f := func(a, b) { return a }\nreturn f(1)") else {
        panic!("expected runtime error");
    };
    assert!(err.is_kind(ErrorKind::WrongNumArguments));
    assert!(err.error.message.contains("want=2"));
    assert!(err.error.message.contains("got=1"));
}
