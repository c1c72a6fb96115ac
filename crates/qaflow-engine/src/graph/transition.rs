use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::Target;

/// An ordered `(condition, target)` rule on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub when: Condition,
    pub to: Target,
}

impl Transition {
    pub fn new(when: Condition, to: Target) -> Self {
        Self { when, to }
    }

    pub fn always(to: Target) -> Self {
        Self::new(Condition::Always, to)
    }
}

/// Guard on a transition.
///
/// Serialized as a string: `"always"` or an expression such as
/// `status == "ok"`, `page.title != "Error"`, `log contains "done"`, `token exists`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Condition {
    #[default]
    Always,
    Expr(String),
}

impl Condition {
    pub fn expr(expr: impl Into<String>) -> Self {
        Condition::from(expr.into())
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Condition::Always)
    }

    /// Evaluate against the step result, then the session outputs.
    /// Unparseable expressions never match.
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Expr(expr) => {
                Predicate::parse(expr).is_some_and(|p| p.evaluate(ctx))
            }
        }
    }
}

impl From<String> for Condition {
    fn from(s: String) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "always" {
            Condition::Always
        } else {
            Condition::Expr(trimmed.to_string())
        }
    }
}

impl From<Condition> for String {
    fn from(c: Condition) -> Self {
        match c {
            Condition::Always => "always".to_string(),
            Condition::Expr(e) => e,
        }
    }
}

/// Values a condition can see.
pub struct EvalContext<'a> {
    pub result: &'a Value,
    pub outputs: &'a BTreeMap<String, Value>,
}

impl<'a> EvalContext<'a> {
    pub fn new(result: &'a Value, outputs: &'a BTreeMap<String, Value>) -> Self {
        Self { result, outputs }
    }

    /// Resolve a dotted key, preferring the step result over session outputs.
    pub fn lookup(&self, key: &str) -> Option<&'a Value> {
        if let Some(v) = lookup_path(self.result, key) {
            return Some(v);
        }
        let (head, rest) = match key.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (key, None),
        };
        let root = self.outputs.get(head)?;
        match rest {
            Some(rest) => lookup_path(root, rest),
            None => Some(root),
        }
    }
}

fn lookup_path<'v>(root: &'v Value, key: &str) -> Option<&'v Value> {
    let mut current = root;
    for segment in key.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Contains,
    Exists,
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub key: String,
    pub op: Op,
    pub value: Option<String>,
}

impl Predicate {
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();

        if let Some(key) = expr.strip_suffix(" exists") {
            return valid_key(key).map(|key| Self {
                key,
                op: Op::Exists,
                value: None,
            });
        }

        let (key, op, value) = parse_operator(expr)?;
        valid_key(key).map(|key| Self {
            key,
            op,
            value: Some(value.to_string()),
        })
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        let found = ctx.lookup(&self.key).filter(|v| !v.is_null());
        let expected = self.value.as_deref().unwrap_or_default();

        match self.op {
            Op::Exists => found.is_some(),
            Op::Eq => found.and_then(as_text).is_some_and(|s| s == expected),
            Op::Ne => found.and_then(as_text).is_some_and(|s| s != expected),
            Op::Contains => match found {
                Some(Value::String(s)) => s.contains(expected),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(as_text)
                    .any(|s| s == expected),
                _ => false,
            },
        }
    }
}

fn valid_key(key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        None
    } else {
        Some(key.to_string())
    }
}

/// Parse `key OP "value"` expressions. The key ends at the first whitespace or
/// comparison character, so operator words inside a key are never split on.
fn parse_operator(expr: &str) -> Option<(&str, Op, &str)> {
    let end = expr
        .find(|c: char| c.is_whitespace() || c == '=' || c == '!')
        .unwrap_or(expr.len());
    let (key, rest) = expr.split_at(end);
    let rest = rest.trim_start();

    for (token, op) in [("==", Op::Eq), ("!=", Op::Ne), ("contains", Op::Contains)] {
        let Some(value) = rest.strip_prefix(token) else {
            continue;
        };
        if op == Op::Contains && !value.starts_with(char::is_whitespace) {
            continue;
        }
        return Some((key, op, value.trim().trim_matches('"')));
    }
    None
}
