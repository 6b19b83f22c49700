//! Exception handling and deoptimization through the engine.
//!
//! Every case runs twice: once starting in optimized code and once in the
//! baseline tier only. Both must agree on values and throw positions.

use kestrel_engine::{EngineConfig, FunctionTester, Message, Tier, Value};

fn both_tiers(source: &str) -> Vec<FunctionTester> {
    [Tier::Optimized, Tier::Baseline]
        .into_iter()
        .map(|tier| {
            FunctionTester::with_config(source, EngineConfig::new().with_tier(tier)).unwrap()
        })
        .collect()
}

#[test]
fn test_throw() {
    for t in both_tiers("(function(a,b) { if (a) { throw b; } else { return b; }})") {
        let error = t.new_object("new Error").unwrap();
        let thrown = t.check_throws(&[t.true_value(), error.clone()]);
        assert!(thrown.value.strict_equals(&error));
        t.check_call(t.val(23.0), &[t.false_value(), t.val(23.0)]);
    }
}

#[test]
fn test_throw_source_position() {
    let src = "(function(a, b) {        \n\
               \x20 if (a == 1) throw 1;   \n\
               \x20 if (a == 2) {throw 2}  \n\
               \x20 if (a == 3) {0;throw 3}\n\
               \x20 throw 4;               \n\
               })                       ";
    for t in both_tiers(src) {
        let message = t.check_throws_return_message(&[t.val(1.0), t.undefined()]);
        assert_eq!(
            message,
            Message {
                line_number: 2,
                start_position: 40
            }
        );

        let message = t.check_throws_return_message(&[t.val(2.0), t.undefined()]);
        assert_eq!(message.line_number, 3);
        assert_eq!(message.start_position, 67);

        let message = t.check_throws_return_message(&[t.val(3.0), t.undefined()]);
        assert_eq!(message.line_number, 4);
        assert_eq!(message.start_position, 95);

        let message = t.check_throws_return_message(&[t.val(4.0), t.undefined()]);
        assert_eq!(message.line_number, 5);
    }
}

#[test]
fn test_catch() {
    let src = "(function(a,b) {\
                 var r = '-';\
                 try {\
                   r += 'A-';\
                   throw 'B-';\
                 } catch (e) {\
                   r += e;\
                 }\
                 return r;\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val("-A-B-"), &[]);
    }
}

#[test]
fn test_catch_nested() {
    let src = "(function(a,b) {\
                 var r = '-';\
                 try {\
                   r += 'A-';\
                   throw 'C-';\
                 } catch (e) {\
                   try {\
                     throw 'B-';\
                   } catch (e) {\
                     r += e;\
                   }\
                   r += e;\
                 }\
                 return r;\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val("-A-B-C-"), &[]);
    }
}

#[test]
fn test_catch_break() {
    let src = "(function(a,b) {\
                 var r = '-';\
                 L: try {\
                   r += 'A-';\
                   if (a) break L;\
                   r += 'B-';\
                   throw 'C-';\
                 } catch (e) {\
                   if (b) break L;\
                   r += e;\
                 }\
                 r += 'D-';\
                 return r;\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val("-A-D-"), &[t.true_value(), t.false_value()]);
        t.check_call(t.val("-A-B-D-"), &[t.false_value(), t.true_value()]);
        t.check_call(t.val("-A-B-C-D-"), &[t.false_value(), t.false_value()]);
    }
}

#[test]
fn test_catch_call() {
    let src = "(function(fun) {\
                 var r = '-';\
                 try {\
                   r += 'A-';\
                   return r + 'B-' + fun();\
                 } catch (e) {\
                   r += e;\
                 }\
                 return r;\
               })";
    for mut t in both_tiers(src) {
        t.compile_run("function thrower() { throw 'T-'; }").unwrap();
        let thrower = t.new_function("thrower").unwrap();
        t.check_call(t.val("-A-T-"), &[thrower]);

        t.compile_run("function returner() { return 'R-'; }").unwrap();
        let returner = t.new_function("returner").unwrap();
        t.check_call(t.val("-A-B-R-"), &[returner]);
    }
}

#[test]
fn test_finally() {
    let src = "(function(a,b) {\
                 var r = '-';\
                 try {\
                   r += 'A-';\
                 } finally {\
                   r += 'B-';\
                 }\
                 return r;\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val("-A-B-"), &[]);
    }
}

#[test]
fn test_finally_break() {
    let src = "(function(a,b) {\
                 var r = '-';\
                 L: try {\
                   r += 'A-';\
                   if (a) return r;\
                   r += 'B-';\
                   if (b) break L;\
                   r += 'C-';\
                 } finally {\
                   r += 'D-';\
                 }\
                 return r;\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val("-A-"), &[t.true_value(), t.false_value()]);
        t.check_call(t.val("-A-B-D-"), &[t.false_value(), t.true_value()]);
        t.check_call(t.val("-A-B-C-D-"), &[t.false_value(), t.false_value()]);
    }
}

#[test]
fn test_deopt_try() {
    let src = "(function f(a) {\
                 try {\
                   %DeoptimizeFunction(f);\
                   throw a;\
                 } catch (e) {\
                   return e + 1;\
                 }\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val(2.0), &[t.val(1.0)]);
    }
}

#[test]
fn test_deopt_catch() {
    let src = "(function f(a) {\
                 try {\
                   throw a;\
                 } catch (e) {\
                   %DeoptimizeFunction(f);\
                   return e + 1;\
                 }\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val(2.0), &[t.val(1.0)]);
    }
}

#[test]
fn test_deopt_finally_return() {
    let src = "(function f(a) {\
                 try {\
                   throw a;\
                 } finally {\
                   %DeoptimizeFunction(f);\
                   return a + 1;\
                 }\
               })";
    for t in both_tiers(src) {
        t.check_call(t.val(2.0), &[t.val(1.0)]);
    }
}

#[test]
fn test_deopt_finally_rethrow() {
    let src = "(function f(a) {\
                 try {\
                   throw a;\
                 } finally {\
                   %DeoptimizeFunction(f);\
                 }\
               })";
    let mut positions = Vec::new();
    for t in both_tiers(src) {
        let error = t.new_object("new Error").unwrap();
        let thrown = t.check_throws(&[error.clone()]);
        assert!(thrown.value.strict_equals(&error));
        positions.push(thrown.position);
    }
    assert_eq!(positions[0], positions[1]);
    assert_eq!(positions[0].offset, src.find("throw").unwrap() as u32);
}

#[test]
fn test_deopt_is_counted_per_activation() {
    let t = FunctionTester::new(
        "(function f(a) { try { throw a; } catch (e) { %DeoptimizeFunction(f); return e + 1; } })",
    )
    .unwrap();
    for _ in 0..3 {
        t.check_call(t.val(2.0), &[t.val(1.0)]);
    }
    let stats = t.engine().stats();
    assert_eq!(stats.optimized_entries, 3);
    assert_eq!(stats.lazy_bailouts, 3);
    assert_eq!(stats.deoptimizations, 0);
    assert_eq!(t.function().bailout_count(), 3);
}

#[test]
fn test_guard_failures_eventually_deoptimize() {
    let config = EngineConfig::new().with_deopt_threshold(2);
    let t = FunctionTester::with_config("(function(a) { try { return a - 1; } finally { } })", config)
        .unwrap();
    t.check_call(t.val(4.0), &[t.val("5")]);
    t.check_call(t.val(4.0), &[t.val("5")]);
    assert!(!t.function().is_optimized());
    t.check_call(t.val(4.0), &[t.val(5.0)]);

    let stats = t.engine().stats();
    assert_eq!(stats.eager_bailouts, 2);
    assert_eq!(stats.deoptimizations, 1);
    assert_eq!(stats.baseline_entries, 1);
}

fn finally_tower(depth: usize) -> String {
    let mut body = String::from("a += 0;");
    for _ in 0..depth {
        body = format!(
            "try {{ if (a == 1) return 1; if (a == 2) break L; \
             if (a == 3) {{ a = 0; continue L; }} if (a == 4) throw 4; }} \
             finally {{ {body} }}"
        );
    }
    format!("(function(a) {{ L: for (;;) {{ {body} break L; }} return 2; }})")
}

#[test]
fn test_deep_finally_tower_falls_back_to_baseline() {
    let t = FunctionTester::new(&finally_tower(8)).unwrap();
    assert!(!t.function().is_optimized());
    t.check_call(t.val(2.0), &[t.val(0.0)]);
    t.check_call(t.val(1.0), &[t.val(1.0)]);
    t.check_call(t.val(2.0), &[t.val(2.0)]);
    t.check_call(t.val(2.0), &[t.val(3.0)]);
    let thrown = t.check_throws(&[t.val(4.0)]);
    assert!(thrown.value.strict_equals(&t.val(4.0)));

    let stats = t.engine().stats();
    assert_eq!(stats.jit_fallbacks, 1);
    assert_eq!(stats.optimized_entries, 0);
    assert_eq!(stats.baseline_entries, 5);
}

#[test]
fn test_shallow_finally_tower_stays_optimized() {
    let t = FunctionTester::new(&finally_tower(3)).unwrap();
    assert!(t.function().is_optimized());
    let result = t.check_matches_reference(&[t.val(3.0)]).unwrap();
    assert_eq!(result.as_number(), Some(2.0));
    assert_eq!(t.engine().stats().jit_fallbacks, 0);
}

#[test]
fn test_matches_reference_with_helpers() {
    let mut t = FunctionTester::new(
        "(function(f, n) {\
           var s = 0;\
           for (var i = 0; i < n; i++) {\
             try { s += f(i); } catch (e) { s += 100; continue; } finally { s += 1; }\
           }\
           return s;\
         })",
    )
    .unwrap();
    t.compile_run("function odd(i) { if (i % 2) { throw i; } return i; }").unwrap();
    let odd = t.new_function("odd").unwrap();
    let result = t.check_matches_reference(&[odd, Value::number(4.0)]).unwrap();
    // 0 + 100 + 2 + 100, plus one per iteration
    assert_eq!(result.as_number(), Some(206.0));
}
