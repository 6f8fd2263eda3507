use proptest::prelude::*;
use serde_json::json;
use waterflow::graphs::{CompareOp, Guard};

proptest! {
    #[test]
    fn numeric_guards_agree_with_rust_comparison(
        actual in -1.0e9f64..1.0e9,
        expected in -1.0e9f64..1.0e9,
    ) {
        let data = json!({ "x": actual });
        let cases = [
            (CompareOp::Eq, actual == expected),
            (CompareOp::Ne, actual != expected),
            (CompareOp::Gt, actual > expected),
            (CompareOp::Ge, actual >= expected),
            (CompareOp::Lt, actual < expected),
            (CompareOp::Le, actual <= expected),
        ];
        for (op, want) in cases {
            let guard = Guard::compare("x", op, json!(expected));
            prop_assert_eq!(guard.matches(&data), want, "op {}", op);
        }
    }

    #[test]
    fn else_matches_any_payload(value in any::<i64>(), key in "[a-z]{1,8}") {
        let data = json!({ key: value });
        prop_assert!(Guard::Else.matches(&data));
    }

    #[test]
    fn missing_path_never_matches_compare(
        value in any::<i64>(),
        key in "[a-z]{1,8}",
    ) {
        let data = json!({ key: value });
        let guard = Guard::compare("definitely.not.there", CompareOp::Eq, json!(value));
        prop_assert!(!guard.matches(&data));
    }

    #[test]
    fn exists_tracks_presence(value in any::<i64>()) {
        let data = json!({ "present": value });
        prop_assert!(Guard::exists("present").matches(&data));
        prop_assert!(!Guard::exists("absent").matches(&data));
    }

    #[test]
    fn string_ordering_is_lexicographic(a in "[a-m]{1,6}", b in "[a-m]{1,6}") {
        let data = json!({ "s": a.clone() });
        let guard = Guard::compare("s", CompareOp::Lt, json!(b.clone()));
        prop_assert_eq!(guard.matches(&data), a < b);
    }
}
