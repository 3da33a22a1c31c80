//! Dynamic values flowing through template execution.
//!
//! The dot and every intermediate pipeline result is a [`Value`]. Host
//! objects (the request surface, response control, SQL accessors) implement
//! [`Object`] to expose fields and methods to the executor.

use super::error::{ExecError, ExecResult};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Ordered map used for row values and user data.
pub type Map = BTreeMap<String, Value>;

/// A dynamic template value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<Vec<Value>>),
    Map(Rc<Map>),
    Object(Rc<dyn Object>),
}

/// Host-side object exposed to templates.
///
/// `field` resolves `.Name` access; `call` resolves `.Name arg...` method
/// invocation. A name may resolve as either; the executor tries `field`
/// first for argument-less access and falls back to `call`.
pub trait Object {
    /// Short name used in error messages and default rendering.
    fn type_name(&self) -> &'static str;

    /// Resolve a field access. Default: no fields.
    fn field(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Invoke a method. Returns `None` if the method does not exist so the
    /// caller can keep searching (provider fallthrough on the dot).
    fn call(&self, _method: &str, _args: &[Value]) -> Option<ExecResult<Value>> {
        None
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(items))
    }

    pub fn map(map: Map) -> Value {
        Value::Map(Rc::new(map))
    }

    pub fn object(obj: impl Object + 'static) -> Value {
        Value::Object(Rc::new(obj))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Go-style truthiness: zero values are false, everything else true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Length of a countable value, if it has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(l) => Some(l.len()),
            Value::Map(m) => Some(m.len()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(o) => o.type_name(),
        }
    }

    /// Coerce to an integer where the template expects one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Equality for `eq`/`ne`. Numbers compare across int/float.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            _ => false,
        }
    }

    /// Ordering for `lt`/`le`/`gt`/`ge`. Only numbers and strings order.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }

    /// Index into a list or map, for the `index` builtin and path values.
    pub fn index(&self, key: &Value) -> ExecResult<Value> {
        match (self, key) {
            (Value::List(l), k) => {
                let i = k
                    .as_int()
                    .ok_or_else(|| ExecError::Failure(format!("cannot index list with {}", k)))?;
                if i < 0 || i as usize >= l.len() {
                    return Err(ExecError::Failure(format!("index {i} out of range")));
                }
                Ok(l[i as usize].clone())
            }
            (Value::Map(m), Value::Str(s)) => Ok(m.get(s).cloned().unwrap_or(Value::Null)),
            (v, k) => Err(ExecError::Failure(format!(
                "cannot index {} with {}",
                v.type_name(),
                k.type_name()
            ))),
        }
    }

    /// Resolve a field access, covering maps and host objects.
    pub fn access_field(&self, name: &str) -> Option<Value> {
        match self {
            Value::Map(m) => m.get(name).cloned(),
            Value::Object(o) => o.field(name),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "map[")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "]")
            }
            Value::Object(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::list(vec![]).truthy());

        assert!(Value::Bool(true).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::str("x").truthy());
        assert!(Value::list(vec![Value::Null]).truthy());
    }

    #[test]
    fn test_numeric_equality() {
        assert!(Value::Int(3).equals(&Value::Float(3.0)));
        assert!(!Value::Int(3).equals(&Value::Float(3.5)));
        assert!(Value::str("a").equals(&Value::str("a")));
        assert!(!Value::str("a").equals(&Value::Int(1)));
    }

    #[test]
    fn test_compare() {
        use std::cmp::Ordering::*;
        assert_eq!(Value::Int(1).compare(&Value::Int(2)), Some(Less));
        assert_eq!(Value::Float(2.5).compare(&Value::Int(2)), Some(Greater));
        assert_eq!(Value::str("a").compare(&Value::str("a")), Some(Equal));
        assert_eq!(Value::str("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_index() {
        let list = Value::list(vec![Value::Int(10), Value::Int(20)]);
        assert!(list.index(&Value::Int(1)).unwrap().equals(&Value::Int(20)));
        assert!(list.index(&Value::Int(5)).is_err());

        let mut m = Map::new();
        m.insert("k".to_string(), Value::str("v"));
        let map = Value::map(m);
        assert!(map.index(&Value::str("k")).unwrap().equals(&Value::str("v")));
        assert!(matches!(map.index(&Value::str("missing")), Ok(Value::Null)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::str("hi").to_string(), "hi");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1 2]"
        );
    }
}
