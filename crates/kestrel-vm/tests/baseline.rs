//! The baseline tier on its own: finally bodies, handler unwinding and
//! throw positions through nested calls.

use std::cell::RefCell;
use std::rc::Rc;

use kestrel_compiler::Compiler;
use kestrel_vm::{BytecodeGenerator, CallContext, Interpreter, NativeFunction, Value, VmError, VmResult};

fn run(source: &str, args: &[Value]) -> VmResult<Value> {
    let structured = Compiler::new(source).compile_function().unwrap();
    let bytecode = BytecodeGenerator::compile(&structured).unwrap();
    Interpreter::call(&bytecode, args, CallContext::root())
}

fn tracer() -> (Value, Rc<RefCell<String>>) {
    let trace = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&trace);
    let log = NativeFunction::new("log", move |args| {
        for arg in args {
            sink.borrow_mut().push_str(&arg.to_js_string());
        }
        Ok(Value::Undefined)
    });
    (log.into_value(), trace)
}

#[test]
fn test_finally_order_on_throw() {
    let (log, trace) = tracer();
    let err = run(
        "(function(log) {
            try {
                try { throw 'x'; } finally { log('1'); }
            } finally { log('2'); }
        })",
        &[log],
    )
    .unwrap_err();
    assert!(matches!(err, VmError::Exception(ref e) if e.value.as_str() == Some("x")));
    assert_eq!(*trace.borrow(), "12");
}

#[test]
fn test_continue_through_finally_in_loop() {
    let (log, trace) = tracer();
    let r = run(
        "(function(log) {
            var i = 0;
            while (i < 3) {
                try { i++; if (i == 2) continue; log(i); } finally { log('f'); }
            }
            return i;
        })",
        &[log],
    )
    .unwrap();
    assert_eq!(r.as_number(), Some(3.0));
    assert_eq!(*trace.borrow(), "1ff3f");
}

#[test]
fn test_rethrow_from_catch_reaches_outer_handler() {
    let r = run(
        "(function() {
            var r = '';
            try {
                try { throw 'a'; } catch (e) { r += e; throw 'b'; }
            } catch (e) { r += e; }
            return r;
        })",
        &[],
    )
    .unwrap();
    assert_eq!(r.as_str(), Some("ab"));
}

#[test]
fn test_native_throw_takes_call_position() {
    let thrower = NativeFunction::new("thrower", |_| Err(Value::string("T"))).into_value();
    let err = run("(function(f) {\n  return 1 + f();\n})", &[thrower]).unwrap_err();
    let VmError::Exception(exception) = err else {
        panic!("expected exception");
    };
    assert_eq!(exception.position.line, 2);
    assert_eq!(exception.position.column, 13);
}
