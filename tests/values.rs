//! Value-model invariants exercised from script code.

use indoc::indoc;
use pretty_assertions::assert_eq;
use ugo::{run_source, CompileOptions, Value, UNDEFINED};

fn run(src: &str) -> Value {
    run_source(src, &CompileOptions::default(), UNDEFINED, &[])
        .unwrap_or_else(|e| panic!("run failed: {e}"))
}

#[test]
fn is_predicates_match_exactly_one_variant() {
    let src = indoc! {r#"
        checks := func(v) {
            n := 0
            if isInt(v) { n++ }
            if isUint(v) { n++ }
            if isFloat(v) { n++ }
            if isChar(v) { n++ }
            if isBool(v) { n++ }
            if isString(v) { n++ }
            if isBytes(v) { n++ }
            if isMap(v) { n++ }
            if isArray(v) { n++ }
            if isUndefined(v) { n++ }
            if isError(v) { n++ }
            return n
        }
        values := [1, 2u, 1.5, 'a', true, "s", bytes("b"), {}, [], undefined, error("e")]
        total := 0
        for _, v in values { total += checks(v) }
        return total
    "#};
    assert_eq!(run(src), Value::Int(11));
}

#[test]
fn copy_preserves_equality_and_independence() {
    let src = indoc! {r#"
        a := [1, {x: 2}, "s"]
        b := copy(a)
        same := a == b
        a[0] = 99
        changed := a == b
        return [same, changed, b[0]]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::Bool(false), Value::Int(1)])
    );
}

#[test]
fn len_matches_iteration_steps() {
    let src = indoc! {r#"
        steps := func(v) {
            n := 0
            for _ in v { n++ }
            return n
        }
        vals := [[1, 2, 3], {a: 1, b: 2}, "abc", bytes("xyz")]
        for _, v in vals {
            if len(v) != steps(v) { return false }
            if cap(v) < len(v) { return false }
        }
        return true
    "#};
    assert_eq!(run(src), Value::Bool(true));
}

#[test]
fn numeric_equality_coerces_across_variants() {
    let src = indoc! {r#"
        return [
            1 == 1u,
            1 == 1.0,
            true == 1,
            false == 0,
            'a' == 97,
            "1" == 1,
            "ab" == bytes("ab"),
        ]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
        ])
    );
}

#[test]
fn undefined_sorts_below_everything() {
    let src = indoc! {r#"
        return [
            undefined < 0,
            undefined <= "",
            0 < undefined,
            0 > undefined,
            undefined < undefined,
            undefined <= undefined,
        ]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::Bool(true),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
        ])
    );
}

#[test]
fn containers_alias_by_reference() {
    let src = indoc! {r#"
        a := [1]
        b := a
        b[0] = 5
        m := {k: 1}
        n := m
        n.k = 9
        return [a[0], m.k]
    "#};
    assert_eq!(run(src), Value::array(vec![Value::Int(5), Value::Int(9)]));
}

#[test]
fn string_and_bytes_roundtrips() {
    let src = indoc! {r#"
        b := bytes("héllo")
        s := int(string(12345))
        return [bytes(string(b)) == b, s == 12345, int("0b101") == 5]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::Bool(true), Value::Bool(true), Value::Bool(true)])
    );
}

#[test]
fn falsiness_table() {
    let src = indoc! {r#"
        truthy := func(v) { return v ? true : false }
        return [
            truthy(0), truthy(1),
            truthy(""), truthy("x"),
            truthy([]), truthy([0]),
            truthy({}), truthy(undefined),
            truthy(error("e")), truthy(0.0),
        ]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(false),
            Value::Bool(false),
            Value::Bool(true),
        ])
    );
}

#[test]
fn type_names() {
    let src = indoc! {r#"
        return [
            typeName(1), typeName(1u), typeName(1.0), typeName('a'),
            typeName("s"), typeName([]), typeName({}), typeName(undefined),
            typeName(len), typeName(func(){}),
        ]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::string("int"),
            Value::string("uint"),
            Value::string("float"),
            Value::string("char"),
            Value::string("string"),
            Value::string("array"),
            Value::string("map"),
            Value::string("undefined"),
            Value::string("builtin-function"),
            Value::string("compiled-function"),
        ])
    );
}

#[test]
fn slices_and_concat() {
    let src = indoc! {r#"
        a := [1, 2, 3, 4]
        s := "hello"
        return [a[1:3], s[1:4], a[:2] + a[2:], s[:0]]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::array(vec![Value::Int(2), Value::Int(3)]),
            Value::string("ell"),
            Value::array(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4)
            ]),
            Value::string(""),
        ])
    );
}

#[test]
fn map_keys_are_stringified() {
    let src = indoc! {r#"
        m := {}
        m[1] = "one"
        m[true] = "yes"
        return [m["1"], m["true"]]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![Value::string("one"), Value::string("yes")])
    );
}

#[test]
fn sort_and_contains_and_repeat() {
    let src = indoc! {r#"
        a := sort([3, 1, 2])
        d := sortReverse([1, 3, 2])
        return [a, d, contains("abc", "bc"), contains([1, 2], 3), repeat("ab", 2)]
    "#};
    assert_eq!(
        run(src),
        Value::array(vec![
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            Value::array(vec![Value::Int(3), Value::Int(2), Value::Int(1)]),
            Value::Bool(true),
            Value::Bool(false),
            Value::string("abab"),
        ])
    );
}
