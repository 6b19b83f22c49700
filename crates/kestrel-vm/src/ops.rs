//! Generic operator semantics shared by both tiers

use std::sync::Arc;

use kestrel_ir::{BinaryOp, UnaryOp};

use crate::value::Value;

/// Evaluate `lhs op rhs` with full JavaScript coercions
pub fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::Add => add(lhs, rhs),
        BinaryOp::Sub => Value::Number(lhs.to_number() - rhs.to_number()),
        BinaryOp::Mul => Value::Number(lhs.to_number() * rhs.to_number()),
        BinaryOp::Div => Value::Number(lhs.to_number() / rhs.to_number()),
        BinaryOp::Rem => Value::Number(lhs.to_number() % rhs.to_number()),
        BinaryOp::Lt => Value::Boolean(compare(lhs, rhs, |o| o.is_lt())),
        BinaryOp::Le => Value::Boolean(compare(lhs, rhs, |o| o.is_le())),
        BinaryOp::Gt => Value::Boolean(compare(lhs, rhs, |o| o.is_gt())),
        BinaryOp::Ge => Value::Boolean(compare(lhs, rhs, |o| o.is_ge())),
        BinaryOp::Eq => Value::Boolean(lhs.loose_equals(rhs)),
        BinaryOp::Ne => Value::Boolean(!lhs.loose_equals(rhs)),
        BinaryOp::StrictEq => Value::Boolean(lhs.strict_equals(rhs)),
        BinaryOp::StrictNe => Value::Boolean(!lhs.strict_equals(rhs)),
    }
}

/// Evaluate a numeric binary operator on two numbers
///
/// Returns `None` for operators without a pure number fast path.
pub fn eval_numeric(op: BinaryOp, a: f64, b: f64) -> Option<Value> {
    let value = match op {
        BinaryOp::Add => Value::Number(a + b),
        BinaryOp::Sub => Value::Number(a - b),
        BinaryOp::Mul => Value::Number(a * b),
        BinaryOp::Div => Value::Number(a / b),
        BinaryOp::Rem => Value::Number(a % b),
        BinaryOp::Lt => Value::Boolean(a < b),
        BinaryOp::Le => Value::Boolean(a <= b),
        BinaryOp::Gt => Value::Boolean(a > b),
        BinaryOp::Ge => Value::Boolean(a >= b),
        _ => return None,
    };
    Some(value)
}

/// Evaluate `op src`
pub fn eval_unary(op: UnaryOp, src: &Value) -> Value {
    match op {
        UnaryOp::Neg => Value::Number(-src.to_number()),
        UnaryOp::Plus => Value::Number(src.to_number()),
        UnaryOp::Not => Value::Boolean(!src.to_boolean()),
        UnaryOp::TypeOf => Value::String(Arc::from(src.type_of())),
        UnaryOp::Void => Value::Undefined,
    }
}

fn is_primitive_string_like(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Function(_) | Value::Error(_))
}

fn add(lhs: &Value, rhs: &Value) -> Value {
    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
        return Value::Number(a + b);
    }
    // Objects convert through ToPrimitive, which yields their string form
    if is_primitive_string_like(lhs) || is_primitive_string_like(rhs) {
        let mut s = String::from(&*lhs.to_js_string());
        s.push_str(&rhs.to_js_string());
        return Value::String(Arc::from(s));
    }
    Value::Number(lhs.to_number() + rhs.to_number())
}

fn compare(lhs: &Value, rhs: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => test(a.cmp(b)),
        _ => match lhs.to_number().partial_cmp(&rhs.to_number()) {
            Some(ordering) => test(ordering),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_concatenates_strings() {
        let r = eval_binary(BinaryOp::Add, &Value::string("-"), &Value::string("A-"));
        assert_eq!(r.as_str(), Some("-A-"));

        let r = eval_binary(BinaryOp::Add, &Value::string("x"), &Value::number(1.0));
        assert_eq!(r.as_str(), Some("x1"));
    }

    #[test]
    fn test_add_numbers() {
        let r = eval_binary(BinaryOp::Add, &Value::number(1.0), &Value::number(1.0));
        assert_eq!(r.as_number(), Some(2.0));

        let r = eval_binary(BinaryOp::Add, &Value::boolean(true), &Value::Null);
        assert_eq!(r.as_number(), Some(1.0));
    }

    #[test]
    fn test_comparisons() {
        let lt = eval_binary(BinaryOp::Lt, &Value::number(1.0), &Value::number(2.0));
        assert!(lt.to_boolean());
        let nan = eval_binary(BinaryOp::Le, &Value::Undefined, &Value::number(2.0));
        assert!(!nan.to_boolean());
        let s = eval_binary(BinaryOp::Gt, &Value::string("b"), &Value::string("a"));
        assert!(s.to_boolean());
    }

    #[test]
    fn test_numeric_fast_path() {
        assert_eq!(
            eval_numeric(BinaryOp::Mul, 3.0, 4.0).and_then(|v| v.as_number()),
            Some(12.0)
        );
        assert!(eval_numeric(BinaryOp::StrictEq, 1.0, 1.0).is_none());
    }

    #[test]
    fn test_unary() {
        assert_eq!(eval_unary(UnaryOp::TypeOf, &Value::Null).as_str(), Some("object"));
        assert_eq!(eval_unary(UnaryOp::Neg, &Value::string("3")).as_number(), Some(-3.0));
        assert!(eval_unary(UnaryOp::Not, &Value::number(0.0)).to_boolean());
    }
}
