//! Edge guards for condition routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::utils::json_ext::get_by_path;

/// Comparison operator applied between a payload field and a literal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        write!(f, "{symbol}")
    }
}

/// Routing predicate on an edge leaving a condition node.
///
/// Guards are evaluated against the token payload in edge declaration
/// order; the first match wins, and the single `Else` edge catches
/// everything that matched no other guard. A missing or type-mismatched
/// field makes a comparison guard evaluate to `false` rather than erroring,
/// so a malformed payload falls through to the else edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Guard {
    /// Compare the value at a dot-path against a literal.
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    /// Match when a dot-path resolves to any non-null value.
    Exists { path: String },
    /// The mandatory default edge of a condition node.
    Else,
}

impl Guard {
    pub fn compare(path: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Guard::Compare {
            path: path.into(),
            op,
            value,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Guard::Exists { path: path.into() }
    }

    #[must_use]
    pub fn is_else(&self) -> bool {
        matches!(self, Guard::Else)
    }

    /// Evaluate this guard against a token payload.
    #[must_use]
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Guard::Else => true,
            Guard::Exists { path } => {
                matches!(get_by_path(data, path), Some(v) if !v.is_null())
            }
            Guard::Compare { path, op, value } => match get_by_path(data, path) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Compare { path, op, value } => write!(f, "{path} {op} {value}"),
            Guard::Exists { path } => write!(f, "exists({path})"),
            Guard::Else => write!(f, "else"),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
            },
            _ => false,
        },
        (Value::String(a), Value::String(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
        },
        // Other types only support equality.
        (a, b) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparisons() {
        let data = json!({"x": 5});
        assert!(Guard::compare("x", CompareOp::Gt, json!(0)).matches(&data));
        assert!(Guard::compare("x", CompareOp::Le, json!(5)).matches(&data));
        assert!(!Guard::compare("x", CompareOp::Lt, json!(5)).matches(&data));
    }

    #[test]
    fn missing_field_never_matches_compare() {
        let data = json!({"y": 1});
        assert!(!Guard::compare("x", CompareOp::Eq, json!(1)).matches(&data));
    }

    #[test]
    fn type_mismatch_only_supports_equality() {
        let data = json!({"x": "high"});
        assert!(!Guard::compare("x", CompareOp::Gt, json!(1)).matches(&data));
        assert!(Guard::compare("x", CompareOp::Ne, json!(1)).matches(&data));
    }

    #[test]
    fn exists_ignores_null() {
        assert!(Guard::exists("x").matches(&json!({"x": 0})));
        assert!(!Guard::exists("x").matches(&json!({"x": null})));
        assert!(!Guard::exists("x").matches(&json!({})));
    }

    #[test]
    fn else_always_matches() {
        assert!(Guard::Else.matches(&json!({})));
        assert!(Guard::Else.matches(&json!({"anything": [1, 2]})));
    }
}
