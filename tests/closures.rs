//! Closure capture, shared bindings, and recursion shapes.

use indoc::indoc;
use pretty_assertions::assert_eq;
use ugo::{run_source, CompileOptions, Value, UNDEFINED};

fn run(src: &str) -> Value {
    run_source(src, &CompileOptions::default(), UNDEFINED, &[])
        .unwrap_or_else(|e| panic!("run failed: {e}"))
}

#[test]
fn two_closures_share_one_binding() {
    let src = indoc! {r#"
        make := func() {
            n := 0
            return [func() { n += 1; return n }, func() { n += 10; return n }]
        }
        fns := make()
        a := fns[0]
        b := fns[1]
        return [a(), b(), a()]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Int(1), Value::Int(11), Value::Int(12)])
    );
}

#[test]
fn capture_survives_the_defining_frame() {
    let src = indoc! {r#"
        make := func(start) {
            return func() {
                start += 1
                return start
            }
        }
        c := make(100)
        c()
        return c()
    "#};
    assert_eq!(run(src), Value::Int(102));
}

#[test]
fn transitive_capture_through_two_levels() {
    let src = indoc! {r#"
        outer := func() {
            x := 1
            mid := func() {
                inner := func() { x += 1; return x }
                return inner
            }
            return mid()
        }
        f := outer()
        f()
        return f()
    "#};
    assert_eq!(run(src), Value::Int(3));
}

#[test]
fn loop_variable_is_one_shared_binding() {
    // All closures capture the same `i` cell, Go-style.
    let src = indoc! {r#"
        fns := []
        for i := 0; i < 3; i++ {
            fns = append(fns, func() { return i })
        }
        f := fns[0]
        g := fns[2]
        return [f(), g()]
    "#};
    assert_eq!(run(src), Value::array(vec![Value::Int(3), Value::Int(3)]));
}

#[test]
fn self_reference_through_define() {
    let src = indoc! {r#"
        fact := func(n) {
            if n <= 1 { return 1 }
            return n * fact(n - 1)
        }
        return fact(6)
    "#};
    assert_eq!(run(src), Value::Int(720));
}

#[test]
fn mutual_recursion_via_var() {
    let src = indoc! {r#"
        var odd
        var even
        odd = func(n) {
            if n == 0 { return false }
            return even(n - 1)
        }
        even = func(n) {
            if n == 0 { return true }
            return odd(n - 1)
        }
        return [even(10), odd(7)]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::Bool(true)])
    );
}

#[test]
fn deep_mutual_tail_recursion_stays_flat() {
    // Both calls are in tail position, so the frame is reused and the
    // depth stays constant even for a long chain.
    let src = indoc! {r#"
        var ping
        var pong
        ping = func(n) {
            if n == 0 { return "ping" }
            return pong(n - 1)
        }
        pong = func(n) {
            if n == 0 { return "pong" }
            return ping(n - 1)
        }
        return ping(100001)
    "#};
    assert_eq!(run(src), Value::string("pong"));
}

#[test]
fn closures_as_map_values() {
    let src = indoc! {r#"
        counter := 0
        handlers := {
            add: func(n) { counter += n },
            get: func() { return counter },
        }
        handlers.add(5)
        handlers.add(2)
        return handlers.get()
    "#};
    assert_eq!(run(src), Value::Int(7));
}
