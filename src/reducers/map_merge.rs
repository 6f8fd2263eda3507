//! Default reducer: deep-merge branch payloads in arrival order.

use serde_json::Value;

use super::JoinReducer;
use crate::token::Token;
use crate::utils::json_ext::deep_merge;

/// Deep-merges the payloads of all arrived tokens, later arrivals winning
/// on conflicting scalar fields. Registered under the name `"merge"`.
pub struct MapMerge;

impl MapMerge {
    pub const NAME: &'static str = "merge";
}

impl JoinReducer for MapMerge {
    fn reduce(&self, tokens: &[Token]) -> Value {
        let mut merged = Value::Object(serde_json::Map::new());
        for token in tokens {
            merged = deep_merge(&merged, &token.data);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_disjoint_fields() {
        let base = Token::root("s", "t", "p", json!({}));
        let a = base.derive("a", json!({"left": 1}));
        let b = base.derive("b", json!({"right": 2}));
        let merged = MapMerge.reduce(&[a, b]);
        assert_eq!(merged, json!({"left": 1, "right": 2}));
    }

    #[test]
    fn later_arrival_wins_scalar_conflict() {
        let base = Token::root("s", "t", "p", json!({}));
        let a = base.derive("a", json!({"v": 1}));
        let b = base.derive("b", json!({"v": 2}));
        assert_eq!(MapMerge.reduce(&[a, b]), json!({"v": 2}));
    }

    #[test]
    fn empty_arrivals_reduce_to_empty_object() {
        assert_eq!(MapMerge.reduce(&[]), json!({}));
    }
}
