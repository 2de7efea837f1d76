use std::collections::HashMap;
use std::fmt;

/// A template value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent. Renders as the empty string
    #[default]
    Null,
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Str(s) => !matches!(s.as_str(), "" | "false" | "False" | "0"),
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::List(items) => !items.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Str(s) => s.chars().count(),
            Value::List(items) => items.len(),
            other => other.to_string().chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loose equality: numeric when both sides are numbers, textual otherwise
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => self.to_string() == other.to_string(),
            },
        }
    }

    pub fn loose_cmp(&self, other: &Value) -> std::cmp::Ordering {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Str(s) => f.write_str(s),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::List(items) => {
                let joined: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                f.write_str(&joined.join(","))
            }
        }
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Num(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Flat variable store keyed by dotted path (`Query.Season`)
///
/// Long-lived values (`Config.*`, `Today.*`, `True`, `False`) live in the base
/// scope. Per-search values live in the query scope, which shadows the base
/// scope and is cleared by [`TemplateVars::reset_query`].
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    base: HashMap<String, Value>,
    query: HashMap<String, Value>,
}

fn normalize_key(path: &str) -> &str {
    path.trim().trim_start_matches('.')
}

impl TemplateVars {
    pub fn new() -> Self {
        let mut vars = Self::default();
        vars.set("True", Value::Bool(true));
        vars.set("False", Value::Bool(false));
        vars
    }

    /// Set a long-lived variable
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        self.base.insert(normalize_key(path).to_string(), value.into());
    }

    /// Set a variable that lasts until the next [`reset_query`](Self::reset_query)
    pub fn set_query(&mut self, path: &str, value: impl Into<Value>) {
        self.query.insert(normalize_key(path).to_string(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let key = normalize_key(path);
        self.query.get(key).or_else(|| self.base.get(key))
    }

    /// Drop every per-search variable
    pub fn reset_query(&mut self) {
        self.query.clear();
    }

    /// Remove every variable under a prefix in the query scope (e.g. `Result.`)
    pub fn clear_query_prefix(&mut self, prefix: &str) {
        let prefix = normalize_key(prefix);
        self.query.retain(|k, _| !k.starts_with(prefix));
    }
}
