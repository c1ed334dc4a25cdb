//! End-to-end scenarios: literal program in, literal value out.

use indoc::indoc;
use pretty_assertions::assert_eq;
use ugo::{
    run_source, run_source_captured, CompileOptions, Value, UNDEFINED,
};

fn run(src: &str, args: &[Value]) -> Value {
    run_source(src, &CompileOptions::default(), UNDEFINED, args)
        .unwrap_or_else(|e| panic!("run failed: {e}"))
}

#[test]
fn fibonacci() {
    let src = indoc! {r#"
        param n
        var f
        f = func(x) {
            if x < 2 { return x }
            return f(x-1) + f(x-2)
        }
        return f(n)
    "#};
    assert_eq!(run(src, &[Value::Int(15)]), Value::Int(610));
}

#[test]
fn closure_counter() {
    let src = indoc! {r#"
        var c = 0
        inc := func() {
            c++
            return c
        }
        return [inc(), inc(), inc()]
    "#};
    assert_eq!(
        run(src, &[]),
        Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
}

#[test]
fn try_finally_ordering() {
    let src = indoc! {r#"
        try {
            throw error("x")
        } catch e {
            return e.Message
        } finally {
            println("f")
        }
    "#};
    let (value, output) =
        run_source_captured(src, &CompileOptions::default(), UNDEFINED, &[]).unwrap();
    assert_eq!(value, Value::string("x"));
    assert_eq!(output, "f\n");
}

#[test]
fn map_iteration_sums_values() {
    let src = indoc! {r#"
        m := {a: 1, b: 2}
        s := 0
        for _, v in m { s += v }
        return s
    "#};
    assert_eq!(run(src, &[]), Value::Int(3));
}

#[test]
fn variadic_and_spread() {
    let src = indoc! {r#"
        f := func(a, ...b) { return b }
        return f(1, [2, 3, 4]...)
    "#};
    assert_eq!(
        run(src, &[]),
        Value::array(vec![Value::Int(2), Value::Int(3), Value::Int(4)])
    );
}

#[test]
fn tail_recursion_runs_in_constant_stack() {
    let src = indoc! {r#"
        var it
        it = func(n, m) {
            if n == m { return n }
            return it(n+1, m)
        }
        return it(0, 9999)
    "#};
    assert_eq!(run(src, &[]), Value::Int(9999));
}

#[test]
fn printf_formats_into_sink() {
    let src = indoc! {r#"
        printf("%d %s %v\n", 7, "items", true)
    "#};
    let (_, output) =
        run_source_captured(src, &CompileOptions::default(), UNDEFINED, &[]).unwrap();
    assert_eq!(output, "7 items true\n");
}
