//! Generated checks: finally bodies run once per entry, and optimized runs
//! with bailouts agree with the baseline tier.

use std::cell::Cell;
use std::rc::Rc;

use kestrel_engine::{EngineConfig, FunctionTester, NativeFunction, Tier, Value};
use kestrel_vm::{VmError, VmResult};
use proptest::prelude::*;

const EXIT_LOOP: &str = "(function(tick, k, n) {
    var out = 0;
    for (var i = 0; i < n; i++) {
        try {
            if (k == 1 && i == 1) break;
            if (k == 2) continue;
            if (k == 3 && i == 2) return out;
            if (k == 4 && i == 2) throw out;
            out += 1;
        } finally {
            tick();
        }
    }
    return out;
})";

fn counter() -> (Value, Rc<Cell<u32>>) {
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    let tick = NativeFunction::new("tick", move |_| {
        sink.set(sink.get() + 1);
        Ok(Value::Undefined)
    });
    (tick.into_value(), count)
}

/// Loop iterations that enter the try block
fn expected_entries(k: u32, n: u32) -> u32 {
    match k {
        1 => n.min(2),
        3 | 4 => n.min(3),
        _ => n,
    }
}

fn describe(result: &VmResult<Value>) -> String {
    match result {
        Ok(value) => format!("return {value:?}"),
        Err(VmError::Exception(e)) => format!("throw {:?} at {}", e.value, e.position),
        Err(err) => format!("error {err}"),
    }
}

fn tester(source: &str, tier: Tier) -> FunctionTester {
    FunctionTester::with_config(source, EngineConfig::new().with_tier(tier)).unwrap()
}

fn deopt_source(at: u8) -> String {
    let deopt = |slot: u8| if slot == at { "%DeoptimizeFunction(f);" } else { "" };
    format!(
        "(function f(a, b) {{
            var r = 0;
            try {{ {} if (b) throw a; r = a - 1; }}
            catch (e) {{ {} r = e * 2; }}
            finally {{ {} r = r + 1; }}
            return r;
        }})",
        deopt(1),
        deopt(2),
        deopt(3)
    )
}

fn arg() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-100i32..100).prop_map(|n| Value::number(f64::from(n))),
        (0u8..10).prop_map(|n| Value::string(&n.to_string())),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_finally_runs_once_per_entry(k in 0u32..5, n in 0u32..6) {
        for tier in [Tier::Optimized, Tier::Baseline] {
            let t = tester(EXIT_LOOP, tier);
            let (tick, count) = counter();
            let result = t.call(&[tick, t.val(f64::from(k)), t.val(f64::from(n))]);
            prop_assert_eq!(count.get(), expected_entries(k, n), "tier {:?}", tier);
            if k == 4 && n > 2 {
                prop_assert!(matches!(result, Err(VmError::Exception(_))));
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }

    #[test]
    fn prop_deopt_matches_baseline(at in 0u8..4, a in arg(), b in any::<bool>()) {
        let source = deopt_source(at);
        let optimized = tester(&source, Tier::Optimized);
        let baseline = tester(&source, Tier::Baseline);
        // A string operand fails the guard on `a - 1` or `e * 2`
        let bails = at == 1 || (at == 2 && b) || at == 3 || !a.is_number();
        let args = [a, Value::boolean(b)];

        let expected = baseline.call(&args);
        let actual = optimized.call(&args);
        prop_assert_eq!(describe(&actual), describe(&expected));

        let stats = optimized.engine().stats();
        prop_assert_eq!(stats.bailouts(), u64::from(bails));
        if at == 1 {
            prop_assert_eq!(stats.lazy_bailouts, 1);
        }
    }
}
