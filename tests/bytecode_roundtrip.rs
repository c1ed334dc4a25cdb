//! Bytecode persistence: encode, decode, and run the decoded artifact.

use indoc::indoc;
use pretty_assertions::assert_eq;
use ugo::{compile, CompileOptions, Value, Vm, UNDEFINED};
use ugo_core::bytecode::{constants_equal, Bytecode};

const PROGRAM: &str = indoc! {r#"
    param n
    var f
    f = func(x) {
        if x < 2 { return x }
        return f(x-1) + f(x-2)
    }
    msg := "fib of " + string(n)
    _ = msg
    return f(n)
"#};

#[test]
fn roundtrip_preserves_everything() {
    let bc = compile(PROGRAM, &CompileOptions::default()).unwrap();
    let bytes = bc.encode().unwrap();
    let decoded = Bytecode::decode(&bytes).unwrap();

    assert_eq!(decoded.num_modules, bc.num_modules);
    assert_eq!(decoded.file_set.files(), bc.file_set.files());
    assert!(decoded.main.same_code(&bc.main));
    assert_eq!(decoded.constants.len(), bc.constants.len());
    for (a, b) in decoded.constants.iter().zip(&bc.constants) {
        assert!(constants_equal(a, b), "constant mismatch: {a:?} vs {b:?}");
    }
}

#[test]
fn decoded_bytecode_runs_identically() {
    let bc = compile(PROGRAM, &CompileOptions::default()).unwrap();
    let decoded = Bytecode::decode(&bc.encode().unwrap()).unwrap();

    let args = [Value::Int(12)];
    let direct = Vm::new(bc).run(UNDEFINED, &args).unwrap();
    let revived = Vm::new(decoded).run(UNDEFINED, &args).unwrap();
    assert_eq!(direct, Value::Int(144));
    assert_eq!(direct, revived);
}

#[test]
fn decoded_errors_keep_positions() {
    let bc = compile("f := func() { return 1 / 0 }\nreturn f()", &CompileOptions::default())
        .unwrap();
    let decoded = Bytecode::decode(&bc.encode().unwrap()).unwrap();
    let err = Vm::new(decoded).run(UNDEFINED, &[]).unwrap_err();
    assert!(err.to_string().contains("(main):1:"), "got: {err}");
}

#[test]
fn decoding_garbage_fails_cleanly() {
    assert!(Bytecode::decode(b"not bytecode").is_err());
    assert!(Bytecode::decode(&[]).is_err());
}
