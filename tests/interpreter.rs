use loxvm::error::InterpretResult;
use loxvm::vm::Vm;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// A `Write` sink that hands its bytes to a shared buffer the test keeps a
/// handle to, so stdout produced by `print` statements can be asserted on
/// without touching the process's real stdout.
#[derive(Clone)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buffer = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_writer(Box::new(SharedBuffer(Rc::clone(&buffer))));
    let result = vm.interpret(source);
    let stdout = String::from_utf8(buffer.borrow().clone()).expect("output is valid UTF-8");
    (result, stdout)
}

#[test]
fn arithmetic_precedence_prints_seven() {
    let (result, stdout) = run("print 1 + 2 * 3;");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "7\n");
}

#[test]
fn string_concatenation_of_two_globals() {
    let (result, stdout) = run(r#"var a = "hi"; var b = ", world"; print a + b;"#);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "hi, world\n");
}

#[test]
fn while_loop_prints_each_iteration() {
    let (result, stdout) = run("var i = 0; while (i < 3) { print i; i = i + 1; }");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "0\n1\n2\n");
}

#[test]
fn closure_over_mutable_local_survives_scope_exit() {
    let (result, stdout) = run(
        "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
         var c = make(); print c(); print c(); print c();",
    );
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "1\n2\n3\n");
}

#[test]
fn undefined_variable_read_is_a_runtime_error() {
    let (result, stdout) = run("print undefined_var;");
    assert_eq!(stdout, "");
    match result {
        InterpretResult::RuntimeError(err) => {
            assert!(err.message.contains("undefined_var"));
        }
        other => panic!("expected RuntimeError, got {other:?}"),
    }
}

#[test]
fn calling_a_function_with_too_few_arguments_is_a_runtime_error() {
    let (result, stdout) = run("fun f(a, b) { return a + b; } print f(1);");
    assert_eq!(stdout, "");
    match result {
        InterpretResult::RuntimeError(err) => {
            assert!(err.message.contains("Expected 2 arguments but got 1."));
        }
        other => panic!("expected RuntimeError, got {other:?}"),
    }
}

#[test]
fn and_or_short_circuit_with_correct_precedence() {
    let (result, stdout) = run(r#"if (true and false or true) print "ok"; else print "no";"#);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "ok\n");
}

#[test]
fn globals_and_string_table_persist_across_interpret_calls_on_one_vm() {
    let buffer = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::with_writer(Box::new(SharedBuffer(Rc::clone(&buffer))));

    assert!(matches!(vm.interpret("var greeting = \"hi\";"), InterpretResult::Ok));
    assert!(matches!(vm.interpret("print greeting;"), InterpretResult::Ok));

    let stdout = String::from_utf8(buffer.borrow().clone()).unwrap();
    assert_eq!(stdout, "hi\n");
}

#[test]
fn left_associative_subtraction() {
    let (result, stdout) = run("print 10 - 3 - 2;");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "5\n");
}

#[test]
fn clock_native_is_callable_with_zero_arguments() {
    let (result, stdout) = run("print clock() >= 0;");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(stdout, "true\n");
}

#[test]
fn syntax_error_reports_exactly_one_diagnostic_and_keeps_compiling() {
    let (result, _) = run("1 1; print 2;");
    match result {
        InterpretResult::CompileError(errors) => assert_eq!(errors.len(), 1),
        other => panic!("expected CompileError, got {other:?}"),
    }
}
