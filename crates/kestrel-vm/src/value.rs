//! JavaScript values
//!
//! The value model covers what compiled functions can observe: primitives,
//! function values and error objects. Heap values compare by identity.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use kestrel_ir::Constant;

use crate::callable::Callable;

/// A JavaScript value
#[derive(Clone)]
pub enum Value {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// IEEE 754 number
    Number(f64),
    /// Immutable string
    String(Arc<str>),
    /// Invocable function
    Function(Rc<dyn Callable>),
    /// Error object created by `new Error(...)`
    Error(Rc<ErrorObject>),
}

/// Error object payload
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    /// Constructor name (`Error`, `TypeError`, ...)
    pub name: Arc<str>,
    /// Message
    pub message: Arc<str>,
}

impl Value {
    /// Create undefined
    #[inline]
    pub fn undefined() -> Self {
        Self::Undefined
    }

    /// Create a number
    #[inline]
    pub fn number(n: f64) -> Self {
        Self::Number(n)
    }

    /// Create a string
    pub fn string(s: &str) -> Self {
        Self::String(Arc::from(s))
    }

    /// Create a boolean
    #[inline]
    pub fn boolean(b: bool) -> Self {
        Self::Boolean(b)
    }

    /// Create a fresh error object
    pub fn error(name: &str, message: &str) -> Self {
        Self::Error(Rc::new(ErrorObject {
            name: Arc::from(name),
            message: Arc::from(message),
        }))
    }

    /// Check if value is undefined
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Check if value is null or undefined
    #[inline]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Check if value is a number
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// Check if value is a string
    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as callable
    pub fn as_callable(&self) -> Option<&Rc<dyn Callable>> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// ToBoolean
    pub fn to_boolean(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Number(n) => !n.is_nan() && *n != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Function(_) | Self::Error(_) => true,
        }
    }

    /// ToNumber
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(n) => *n,
            Self::String(s) => string_to_number(s),
            Self::Function(_) | Self::Error(_) => string_to_number(&self.to_js_string()),
        }
    }

    /// ToString
    pub fn to_js_string(&self) -> Arc<str> {
        match self {
            Self::Undefined => Arc::from("undefined"),
            Self::Null => Arc::from("null"),
            Self::Boolean(b) => Arc::from(if *b { "true" } else { "false" }),
            Self::Number(n) => Arc::from(number_to_string(*n)),
            Self::String(s) => Arc::clone(s),
            Self::Function(f) => Arc::from(format!("function {}() {{ [native code] }}", f.name())),
            Self::Error(e) => {
                if e.message.is_empty() {
                    Arc::clone(&e.name)
                } else {
                    Arc::from(format!("{}: {}", e.name, e.message))
                }
            }
        }
    }

    /// `typeof` result
    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "object", // typeof null === "object"
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Function(_) => "function",
            Self::Error(_) => "object",
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Error(a), Self::Error(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==`
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Self::Number(_), Self::String(_)) | (Self::String(_), Self::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Self::Boolean(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Self::Boolean(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (Self::Function(_) | Self::Error(_), Self::Number(_) | Self::String(_)) => {
                Value::String(self.to_js_string()).loose_equals(other)
            }
            (Self::Number(_) | Self::String(_), Self::Function(_) | Self::Error(_)) => {
                self.loose_equals(&Value::String(other.to_js_string()))
            }
            _ => self.strict_equals(other),
        }
    }
}

impl From<&Constant> for Value {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Undefined => Self::Undefined,
            Constant::Null => Self::Null,
            Constant::Boolean(b) => Self::Boolean(*b),
            Constant::Number(n) => Self::Number(*n),
            Constant::String(s) => Self::String(Arc::clone(s)),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", number_to_string(*n)),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Function(func) => write!(f, "[Function: {}]", func.name()),
            Self::Error(e) => write!(f, "[{}: {}]", e.name, e.message),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_js_string())
    }
}

/// Number::toString for the common cases
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e18 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    let mut buf = ryu::Buffer::new();
    let formatted = buf.format_finite(n);
    // ryu writes exponents as `1e21`/`1e-7`; JS writes `1e+21`/`1e-7`
    match formatted.find('e') {
        Some(idx) if !formatted[idx + 1..].starts_with('-') => {
            format!("{}e+{}", &formatted[..idx], &formatted[idx + 1..])
        }
        _ => formatted.to_string(),
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            if let Some(hex) = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                return u64::from_str_radix(hex, 16)
                    .map(|v| v as f64)
                    .unwrap_or(f64::NAN);
            }
            if trimmed.contains(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
                return f64::NAN;
            }
            trimmed.parse::<f64>().unwrap_or(f64::NAN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(2.0), "2");
        assert_eq!(number_to_string(-23.0), "-23");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1e21), "1e+21");
    }

    #[test]
    fn test_to_boolean() {
        assert!(!Value::Undefined.to_boolean());
        assert!(!Value::number(0.0).to_boolean());
        assert!(!Value::number(f64::NAN).to_boolean());
        assert!(!Value::string("").to_boolean());
        assert!(Value::string("0").to_boolean());
        assert!(Value::error("Error", "").to_boolean());
    }

    #[test]
    fn test_to_number() {
        assert_eq!(Value::string(" 42 ").to_number(), 42.0);
        assert_eq!(Value::string("").to_number(), 0.0);
        assert!(Value::string("abc").to_number().is_nan());
        assert_eq!(Value::string("0x10").to_number(), 16.0);
        assert_eq!(Value::Null.to_number(), 0.0);
        assert!(Value::Undefined.to_number().is_nan());
    }

    #[test]
    fn test_error_identity() {
        let a = Value::error("Error", "boom");
        let b = Value::error("Error", "boom");
        assert!(a.strict_equals(&a.clone()));
        assert!(!a.strict_equals(&b));
        assert_eq!(a.to_js_string().as_ref(), "Error: boom");
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::number(1.0).loose_equals(&Value::string("1")));
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.loose_equals(&Value::number(0.0)));
        assert!(Value::boolean(true).loose_equals(&Value::number(1.0)));
        assert!(!Value::string("a").loose_equals(&Value::string("b")));
    }

    #[test]
    fn test_type_of() {
        assert_eq!(Value::Null.type_of(), "object");
        assert_eq!(Value::string("x").type_of(), "string");
        assert_eq!(Value::error("Error", "").type_of(), "object");
    }
}
