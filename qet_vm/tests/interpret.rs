//! End-to-end interpreter tests against the live collector.
//!
//! The collector thread runs with an eager safepoint interval, so these
//! programs cross many handshakes; results are asserted through the
//! globals table rather than captured output.

use qet_core::Value;
use qet_gc as gc;
use qet_vm::{InterpretError, Vm};
use std::sync::Once;

static INIT: Once = Once::new();

fn with_vm<R>(f: impl FnOnce(&mut Vm) -> R) -> R {
    INIT.call_once(|| {
        gc::configure(gc::GcConfig::eager());
        gc::collector::spawn();
    });
    gc::enter();
    let mut vm = Vm::new();
    let result = f(&mut vm);
    drop(vm);
    gc::leave();
    result
}

fn global_int(vm: &Vm, name: &str) -> Option<i64> {
    vm.global(name).and_then(Value::as_int)
}

fn global_str(vm: &Vm, name: &str) -> Option<String> {
    vm.global(name)
        .and_then(qet_runtime::as_string)
        .map(|s| s.to_string())
}

#[test]
fn test_arithmetic_and_globals() {
    with_vm(|vm| {
        vm.interpret("var a = 1 + 2 * 3 - 8 / 2;").expect("runs");
        assert_eq!(global_int(vm, "a"), Some(3));

        vm.interpret("var b = -(a + 1) * 10;").expect("runs");
        assert_eq!(global_int(vm, "b"), Some(-40));

        vm.interpret("var truthy = !nil == true and 1 < 2;").expect("runs");
        assert_eq!(vm.global("truthy"), Some(Value::TRUE));
    });
}

#[test]
fn test_string_concatenation_interns() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            var hello = "hello, " + "world";
            var again = "hello, world";
            var same = hello == again;
            "#,
        )
        .expect("runs");
        assert_eq!(global_str(vm, "hello").as_deref(), Some("hello, world"));
        // Concatenation goes through the intern set, so equal strings
        // are one object and == is pointer equality.
        assert_eq!(vm.global("same"), Some(Value::TRUE));
    });
}

#[test]
fn test_control_flow() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            var sum = 0;
            for (var i = 0; i < 10; i = i + 1) {
                if (i == 3 or i == 5) {
                    sum = sum + 100;
                } else {
                    sum = sum + i;
                }
            }
            var spins = 0;
            while (spins < 4) { spins = spins + 1; }
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "sum"), Some(237));
        assert_eq!(global_int(vm, "spins"), Some(4));
    });
}

#[test]
fn test_functions_and_recursion() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 2) + fib(n - 1);
            }
            var answer = fib(15);
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "answer"), Some(610));
    });
}

#[test]
fn test_closures_capture_and_close() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            fun make_counter() {
                var n = 0;
                fun bump() {
                    n = n + 1;
                    return n;
                }
                return bump;
            }
            var counter = make_counter();
            counter();
            counter();
            var third = counter();
            var fresh = make_counter()();
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "third"), Some(3));
        assert_eq!(global_int(vm, "fresh"), Some(1));
    });
}

#[test]
fn test_classes_fields_methods_inheritance() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            class Counter {
                init(start) {
                    this.n = start;
                }
                bump() {
                    this.n = this.n + 1;
                    return this.n;
                }
                read() { return this.n; }
            }
            class Double < Counter {
                bump() {
                    super.bump();
                    return super.bump();
                }
            }

            var plain = Counter(5);
            plain.bump();
            var plain_value = plain.read();

            var double = Double(0);
            double.bump();
            var double_value = double.read();

            var bound = plain.bump;
            bound();
            var after_bound = plain.read();
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "plain_value"), Some(6));
        assert_eq!(global_int(vm, "double_value"), Some(2));
        assert_eq!(global_int(vm, "after_bound"), Some(7));
    });
}

#[test]
fn test_field_shadows_method_and_shadowed_methods() {
    with_vm(|vm| {
        vm.interpret(
            r#"
            class Base { tag() { return 1; } }
            class Derived < Base { tag() { return 2; } }
            var base_tag = Base().tag();
            var derived_tag = Derived().tag();

            class Holder { init() { this.of = 99; } }
            var holder_field = Holder().of;
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "base_tag"), Some(1));
        assert_eq!(global_int(vm, "derived_tag"), Some(2));
        assert_eq!(global_int(vm, "holder_field"), Some(99));
    });
}

#[test]
fn test_native_clock_is_callable() {
    with_vm(|vm| {
        vm.interpret("var t = clock(); var ok = t >= 0;").expect("runs");
        assert_eq!(vm.global("ok"), Some(Value::TRUE));
    });
}

#[test]
fn test_gc_churn_under_interpretation() {
    with_vm(|vm| {
        // Build and discard thousands of strings and instances across
        // many safepoints; the program's answer must be unaffected by
        // concurrent collection.
        vm.interpret(
            r#"
            class Box { init(v) { this.v = v; } }
            var keep = "";
            var total = 0;
            for (var i = 0; i < 2000; i = i + 1) {
                var b = Box(i);
                total = total + b.v;
                keep = "x" + keep;
                if (i - (i / 2) * 2 == 0) {
                    keep = "";
                }
            }
            var kept_len_probe = keep == "x";
            "#,
        )
        .expect("runs");
        assert_eq!(global_int(vm, "total"), Some(1_999_000));
        assert_eq!(vm.global("kept_len_probe"), Some(Value::TRUE));
    });
}

#[test]
fn test_runtime_errors() {
    with_vm(|vm| {
        let err = vm.interpret("print missing;").expect_err("undefined global");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime.message.contains("Undefined variable 'missing'."));

        let err = vm.interpret("var x = 1; x();").expect_err("not callable");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime.message.contains("Can only call functions and classes."));

        let err = vm
            .interpret("fun f(a, b) { return a; } f(1);")
            .expect_err("arity mismatch");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime.message.contains("Expected 2 arguments but got 1."));

        let err = vm.interpret("var z = 1 / 0;").expect_err("division by zero");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime.message.contains("Division by zero."));

        let err = vm
            .interpret("var s = \"a\" + 1;")
            .expect_err("mixed operands");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime
            .message
            .contains("Operands must be two numbers or two strings."));
    });
}

#[test]
fn test_compile_errors_are_compile_errors() {
    with_vm(|vm| {
        let err = vm.interpret("var = 3;").expect_err("bad syntax");
        assert!(matches!(err, InterpretError::Compile(_)));
        // The VM remains usable after a compile error.
        vm.interpret("var ok = 1;").expect("still runs");
        assert_eq!(global_int(vm, "ok"), Some(1));
    });
}

#[test]
fn test_runtime_error_carries_backtrace() {
    with_vm(|vm| {
        let err = vm
            .interpret(
                r#"
                fun inner() { return missing; }
                fun outer() { return inner(); }
                outer();
                "#,
            )
            .expect_err("undefined deep in the stack");
        let InterpretError::Runtime(runtime) = err else {
            panic!("expected runtime error");
        };
        assert!(runtime.trace.len() >= 3);
        assert!(runtime.trace[0].contains("inner()"));
        assert!(runtime.trace.last().expect("non-empty").contains("script"));
    });
}
