//! Runtime values of the contract interpreter.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value as Json;

use super::SandboxError;

/// Nesting bound for recursive walks over values.
pub const MAX_VALUE_DEPTH: usize = 32;

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<BTreeMap<String, Value>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Int,
    Str,
    Bool,
    Abs,
    Min,
    Max,
    Sum,
    Range,
    List,
    Dict,
    Print,
    Exception,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        let builtin = match name {
            "len" => Builtin::Len,
            "int" => Builtin::Int,
            "str" => Builtin::Str,
            "bool" => Builtin::Bool,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "range" => Builtin::Range,
            "list" => Builtin::List,
            "dict" => Builtin::Dict,
            "print" => Builtin::Print,
            "Exception" | "ValueError" | "KeyError" | "RuntimeError" => Builtin::Exception,
            _ => return None,
        };
        Some(builtin)
    }
}

/// A value; strings, lists and dicts are shared references, so cloning a
/// value never copies its contents.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    List(ListRef),
    Dict(DictRef),
    Range { start: i64, stop: i64, step: i64 },
    Builtin(Builtin),
    Exception(String),
}

/// Containers are torn down with an explicit stack; a value nested
/// deeper than the thread stack allows is still dropped safely.
impl Drop for Value {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.release_children(&mut pending);
        while let Some(mut value) = pending.pop() {
            value.release_children(&mut pending);
        }
    }
}

fn too_deep() -> SandboxError {
    SandboxError::Runtime("value nesting too deep".to_string())
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: BTreeMap<String, Value>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    /// Identity of a shared list or dict.
    pub fn container_id(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(Rc::as_ptr(items) as *const () as usize),
            Value::Dict(entries) => Some(Rc::as_ptr(entries) as *const () as usize),
            _ => None,
        }
    }

    /// Moves the children of a container this value solely owns into
    /// `pending`.
    fn release_children(&mut self, pending: &mut Vec<Value>) {
        match self {
            Value::List(items) => {
                if let Some(items) = Rc::get_mut(items) {
                    pending.append(items.get_mut());
                }
            }
            Value::Dict(entries) => {
                if let Some(entries) = Rc::get_mut(entries) {
                    pending.extend(std::mem::take(entries.get_mut()).into_values());
                }
            }
            _ => {}
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Builtin(_) => "builtin_function",
            Value::Exception(_) => "Exception",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Builtin(_) | Value::Exception(_) => true,
        }
    }

    /// Integer view; booleans count as 0 and 1.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Structural equality with a nesting bound.
    pub fn equals(&self, other: &Value, depth: usize) -> Result<bool, SandboxError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(too_deep());
        }
        let result = match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ok(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    if !x.equals(y, depth + 1)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ok(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Ok(false);
                }
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    if ka != kb || !va.equals(vb, depth + 1)? {
                        return Ok(false);
                    }
                }
                true
            }
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => (start, stop, step) == (s2, e2, st2),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => a == b,
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        };
        Ok(result)
    }

    /// Ordering for `<`, `<=`, `>`, `>=`.
    pub fn compare(&self, other: &Value) -> Result<Ordering, SandboxError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(x.cmp(&y)),
                _ => Err(SandboxError::Runtime(format!(
                    "cannot order {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    /// Text produced by `str()` and `print`.
    pub fn to_display(&self, depth: usize) -> Result<String, SandboxError> {
        match self {
            Value::Str(s) => Ok(s.to_string()),
            other => other.to_repr(depth),
        }
    }

    fn to_repr(&self, depth: usize) -> Result<String, SandboxError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(too_deep());
        }
        let text = match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let parts = items
                    .borrow()
                    .iter()
                    .map(|item| item.to_repr(depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("[{}]", parts.join(", "))
            }
            Value::Dict(entries) => {
                let parts = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| Ok(format!("'{}': {}", k, v.to_repr(depth + 1)?)))
                    .collect::<Result<Vec<_>, SandboxError>>()?;
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range { start, stop, step } => format!("range({}, {}, {})", start, stop, step),
            Value::Builtin(b) => format!("<built-in function {:?}>", b).to_lowercase(),
            Value::Exception(message) => message.clone(),
        };
        Ok(text)
    }

    /// Converts storage content loaded from the ledger.
    pub fn from_json(json: &Json) -> Result<Value, SandboxError> {
        Ok(match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Int(n.as_i64().ok_or_else(|| {
                SandboxError::Runtime(format!("unsupported number in storage: {}", n))
            })?),
            Json::String(s) => Value::Str(s.as_str().into()),
            Json::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect::<Result<_, _>>()?)
            }
            Json::Object(entries) => Value::dict(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                    .collect::<Result<_, SandboxError>>()?,
            ),
        })
    }

    /// Converts a value for storage; functions, ranges and exceptions are
    /// not storable.
    pub fn to_json(&self, depth: usize) -> Result<Json, SandboxError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(SandboxError::NonSerializable("value nesting too deep".to_string()));
        }
        Ok(match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|item| item.to_json(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dict(entries) => Json::Object(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json(depth + 1)?)))
                    .collect::<Result<_, SandboxError>>()?,
            ),
            other => {
                return Err(SandboxError::NonSerializable(format!(
                    "value of type {}",
                    other.type_name()
                )))
            }
        })
    }
}

/// Number of items a range yields.
pub fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let len = if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    };
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let json = json!({"a": [1, "x", null, true], "b": {"c": 2}});
        let value = Value::from_json(&json).unwrap();

        assert_eq!(value.to_json(0).unwrap(), json);
        assert!(Value::from_json(&json!(1.5)).is_err());
        assert!(matches!(
            Value::Builtin(Builtin::Len).to_json(0),
            Err(SandboxError::NonSerializable(_))
        ));
    }

    #[test]
    fn test_equality_and_truthiness() {
        let a = Value::list(vec![Value::Int(1), Value::Str("x".into())]);
        let b = Value::list(vec![Value::Int(1), Value::Str("x".into())]);

        assert!(a.equals(&b, 0).unwrap());
        assert!(Value::Bool(true).equals(&Value::Int(1), 0).unwrap());
        assert!(!Value::Str("1".into()).equals(&Value::Int(1), 0).unwrap());
        assert!(!Value::list(Vec::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::Range { start: 3, stop: 3, step: 1 }.truthy());
    }

    #[test]
    fn test_self_referencing_list_is_bounded() {
        let list = Value::list(Vec::new());
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }

        assert!(list.to_json(0).is_err());
        assert!(list.to_display(0).is_err());
        let other = Value::list(vec![Value::list(Vec::new())]);
        assert!(list.equals(&other, 0).is_ok());

        // Break the cycle so the test does not leak.
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_deeply_nested_value_drops() {
        let mut value = Value::list(Vec::new());
        for i in 0..200_000 {
            value = if i % 2 == 0 {
                Value::list(vec![value])
            } else {
                Value::dict(BTreeMap::from([("k".to_string(), value)]))
            };
        }
        assert!(value.to_json(0).is_err());
        drop(value);
    }

    #[test]
    fn test_shared_children_survive_drop() {
        let shared = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![shared.clone(), shared.clone()]);
        drop(outer);

        assert_eq!(shared.to_json(0).unwrap(), json!([1]));
        assert_ne!(shared.container_id(), None);
        assert_eq!(Value::Str("s".into()).container_id(), None);
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 10, 1), 10);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -2), 5);
        assert_eq!(range_len(5, 0, 1), 0);
    }

    #[test]
    fn test_display() {
        let value = Value::from_json(&json!({"k": ["a", 1, null]})).unwrap();
        assert_eq!(value.to_display(0).unwrap(), "{'k': ['a', 1, None]}");
        assert_eq!(Value::Str("plain".into()).to_display(0).unwrap(), "plain");
    }
}
