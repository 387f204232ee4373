// Integration tests for the Falcon interpreter.
//
// Each test compiles and runs a complete Falcon program end-to-end through
// `Compiler::compile` + `Vm::interpret`, capturing the REPL-mode return
// value (the last bare-expression result) to assert on.

use falcon::compiler::Compiler;
use falcon::natives;
use falcon::value::Value;
use falcon::vm::Vm;

/// Runs `source` to completion and returns the display string of the final
/// bare-expression value (REPL mode), or the error's rendered text on
/// failure. `stress_gc` forces a collection on every single allocation
/// (`Heap::should_collect`), rather than `FALCON_GC_STRESS=1`, so that
/// tests running concurrently on other threads don't fight over process
/// environment state.
fn run_impl(source: &str, stress_gc: bool) -> Result<Option<String>, String> {
    let mut vm = Vm::new("<test>", true);
    vm.heap.stress_gc = stress_gc;
    natives::register_all(&mut vm);
    let function = Compiler::compile(source, "<test>", &mut vm.heap, true)
        .map_err(|errs| errs.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))?;
    match vm.interpret(function) {
        Ok(Some(v)) => Ok(Some(vm.heap.to_display_string(v))),
        Ok(None) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

fn run(source: &str) -> Result<Option<String>, String> {
    run_impl(source, false)
}

fn expect_ok(source: &str) -> String {
    run(source).unwrap_or_else(|e| panic!("expected success, got error:\n{e}")).unwrap_or_default()
}

fn expect_err(source: &str) -> String {
    run(source).err().unwrap_or_else(|| panic!("expected an error, got success"))
}

/// Runs every case in `run_impl`'s caller set twice — once as-is and once
/// with a collection forced before each allocation — and asserts the two
/// runs agree. This is spec property 5 ("GC safety"): output must be
/// byte-identical whether or not the collector runs eagerly.
fn expect_gc_stable(source: &str, expected: &str) {
    let relaxed = run_impl(source, false)
        .unwrap_or_else(|e| panic!("expected success, got error:\n{e}"))
        .unwrap_or_default();
    assert_eq!(relaxed, expected, "relaxed-GC run diverged from expected output");
    let stressed = run_impl(source, true)
        .unwrap_or_else(|e| panic!("expected success under GC stress, got error:\n{e}"))
        .unwrap_or_default();
    assert_eq!(stressed, expected, "GC-stress run diverged from the relaxed run");
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(expect_ok("1 + 2 * 3;"), "7");
    assert_eq!(expect_ok("(1 + 2) * 3;"), "9");
    assert_eq!(expect_ok("2 ^ 10;"), "1024");
    assert_eq!(expect_ok("7 % 3;"), "1");
}

#[test]
fn string_concatenation() {
    assert_eq!(expect_ok("\"foo\" + \"bar\";"), "foobar");
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let err = expect_err("1 / 0;");
    assert!(err.contains("division by zero"), "got: {err}");
}

#[test]
fn closures_capture_upvalues_by_reference() {
    let out = expect_ok(
        r#"
        function make() {
            var n = 0;
            function inc() {
                n = n + 1;
                return n;
            }
            return inc;
        }
        var f = make();
        f();
        f();
        f();
        "#,
    );
    assert_eq!(out, "3");
}

#[test]
fn single_inheritance_and_super_calls() {
    let out = expect_ok(
        r#"
        class A {
            greet() { return "A"; }
        }
        class B extends A {
            greet() { return super.greet() + "B"; }
        }
        B().greet();
        "#,
    );
    assert_eq!(out, "AB");
}

#[test]
fn list_subscript_assignment() {
    let out = expect_ok(
        r#"
        var xs = [1, 2, 3];
        xs[1] = 9;
        xs;
        "#,
    );
    assert_eq!(out, "[ 1, 9, 3 ]");
}

#[test]
fn map_literal_and_subscript_get() {
    let out = expect_ok(r#"var m = { "a": 1, "b": 2 }; m["b"];"#);
    assert_eq!(out, "2");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let err = expect_err("print(missing_name);");
    assert!(err.contains("Undefined variable"), "got: {err}");
}

#[test]
fn redeclaring_a_global_is_a_runtime_error() {
    let err = expect_err("var x = 1; var x = 2;");
    assert!(err.contains("already defined"), "got: {err}");
}

#[test]
fn redeclaring_a_local_in_the_same_scope_is_a_compile_error() {
    let err = expect_err("function f() { var x = 1; var x = 2; }");
    assert!(err.contains("CompilerError"), "got: {err}");
}

#[test]
fn classes_support_bound_methods_as_values() {
    let out = expect_ok(
        r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        var bound = c.bump;
        bound();
        bound();
        "#,
    );
    assert_eq!(out, "2");
}

#[test]
fn ternary_and_logical_operators_short_circuit() {
    assert_eq!(expect_ok("true and false or true;"), "true");
    assert_eq!(expect_ok("1 < 2 ? \"yes\" : \"no\";"), "yes");
}

#[test]
fn compound_assignment_on_subscript() {
    let out = expect_ok("var xs = [1, 2]; xs[0] += 10; xs;");
    assert_eq!(out, "[ 11, 2 ]");
}

#[test]
fn native_math_and_type_helpers() {
    assert_eq!(expect_ok("sqrt(16);"), "4");
    assert_eq!(expect_ok("type(1);"), "num");
    assert_eq!(expect_ok("str(1);"), "1");
    assert_eq!(expect_ok("num(\"42\");"), "42");
    assert_eq!(expect_ok("len([1, 2, 3]);"), "3");
}

#[test]
fn falsiness_follows_spec_rules() {
    assert_eq!(expect_ok("!0;"), "true");
    assert_eq!(expect_ok("![];"), "true");
    assert_eq!(expect_ok("![1];"), "false");
    assert_eq!(expect_ok("!\"\";"), "true");
}

#[test]
fn inline_interpret_sentinel_value_is_err() {
    // num() on an unparseable string must report via native_error, not panic.
    let err = expect_err("num(\"not a number\");");
    assert!(err.contains("RuntimeError"), "got: {err}");
}

#[test]
fn string_concat_survives_gc_stress() {
    // add()'s string branch allocates the joined string after popping its
    // operands; under stress GC, a collection lands between the pop and the
    // dereference unless both operands stay rooted until after it fires.
    expect_gc_stable(r#""foo" + "bar";"#, "foobar");
    expect_gc_stable(
        r#"
        var a = "hello, ";
        var b = "world";
        a + b + "!";
        "#,
        "hello, world!",
    );
}

#[test]
fn list_literal_survives_gc_stress() {
    // Each element is a freshly allocated instance; OP_LIST must keep them
    // rooted on the stack across the collection point preceding the
    // allocation of the list object itself.
    expect_gc_stable(
        r#"
        class A { tag() { return "a"; } }
        var xs = [A(), A(), A()];
        xs[0].tag() + xs[1].tag() + xs[2].tag();
        "#,
        "aaa",
    );
}

#[test]
fn map_literal_survives_gc_stress() {
    expect_gc_stable(
        r#"
        class A { tag() { return "a"; } }
        var m = { "x": A(), "y": A() };
        m["x"].tag() + m["y"].tag();
        "#,
        "aa",
    );
}

#[test]
fn bound_method_survives_gc_stress() {
    // Binding a method on a receiver with no other live reference must not
    // let the receiver be collected between popping it off the stack and
    // building the bound-method object.
    expect_gc_stable(
        r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        class Base {
            greet() { return "base"; }
        }
        class Child extends Base {
            greet() { return super.greet() + "-child"; }
        }
        var bound = Counter().bump;
        bound();
        bound();
        Child().greet();
        "#,
        "base-child",
    );
}

#[test]
fn closures_and_inheritance_survive_gc_stress() {
    expect_gc_stable(
        r#"
        function make() {
            var n = 0;
            function inc() {
                n = n + 1;
                return n;
            }
            return inc;
        }
        var f = make();
        f();
        f();
        f();
        "#,
        "3",
    );
}
