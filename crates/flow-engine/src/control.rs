//! Configuration shapes and pure evaluation helpers for the
//! control-flow primitives. Branch execution itself lives in the
//! interpreter, which recursively invokes itself over the selected
//! nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reference to what a branch runs: one node by position or alias,
/// or an ordered sequence of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchTarget {
    Position(u32),
    Alias(String),
    Sequence(Vec<BranchTarget>),
}

/// `iterate` node configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IterateConfig {
    /// Template (usually a single `{{path}}` token) yielding the array
    /// to iterate over.
    pub source: String,

    /// On a failed iteration: record and continue, or fail the loop.
    #[serde(default)]
    pub continue_on_error: bool,

    /// Keys copied to the parent scope when an iteration's scope pops.
    #[serde(default)]
    pub forward: Vec<String>,

    /// Keys appended to a parent-scope array when the scope pops.
    #[serde(default)]
    pub aggregate: Vec<String>,
}

/// Comparison operators usable in `route` conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// One declarative condition in a `route` node's ordered list.
#[derive(Clone, Debug, Deserialize)]
pub struct RouteCondition {
    /// Variable-store path the condition reads.
    pub path: String,
    pub op: CompareOp,
    /// Right-hand side; absent for `exists`.
    #[serde(default)]
    pub value: Option<Value>,
    pub target: BranchTarget,
}

/// `route` node configuration. Either a literal case map over a
/// single value, or an ordered condition list; `default` applies to
/// both forms.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RouteConfig {
    /// Template producing the value matched against `cases`.
    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub cases: serde_json::Map<String, Value>,

    #[serde(default)]
    pub conditions: Vec<RouteCondition>,

    #[serde(default)]
    pub default: Option<BranchTarget>,
}

/// `handle` node configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HandleConfig {
    #[serde(rename = "try")]
    pub try_branch: BranchTarget,

    #[serde(rename = "catch", default)]
    pub catch_branch: Option<BranchTarget>,

    #[serde(rename = "finally", default)]
    pub finally_branch: Option<BranchTarget>,
}

/// Stringification rule for case matching: strings compare unquoted,
/// everything else by its JSON rendering.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate one condition against the value found at its path (or
/// `None` when the path resolved to nothing).
pub fn condition_holds(op: CompareOp, actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match op {
        CompareOp::Exists => actual.is_some(),
        CompareOp::Eq => matches!((actual, expected), (Some(a), Some(e)) if a == e),
        CompareOp::Ne => match (actual, expected) {
            (Some(a), Some(e)) => a != e,
            (None, Some(_)) => true,
            _ => false,
        },
        CompareOp::Contains => match (actual, expected) {
            (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                haystack.contains(needle.as_str())
            }
            (Some(Value::Array(items)), Some(e)) => items.contains(e),
            _ => false,
        },
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let (Some(a), Some(e)) = (actual, expected) else {
                return false;
            };
            let (Some(a), Some(e)) = (a.as_f64(), e.as_f64()) else {
                return false;
            };
            match op {
                CompareOp::Gt => a > e,
                CompareOp::Gte => a >= e,
                CompareOp::Lt => a < e,
                CompareOp::Lte => a <= e,
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_target_accepts_all_three_forms() {
        let pos: BranchTarget = serde_json::from_value(json!(4)).unwrap();
        assert_eq!(pos, BranchTarget::Position(4));

        let alias: BranchTarget = serde_json::from_value(json!("archive-row")).unwrap();
        assert_eq!(alias, BranchTarget::Alias("archive-row".into()));

        let seq: BranchTarget = serde_json::from_value(json!([4, "archive-row"])).unwrap();
        assert_eq!(
            seq,
            BranchTarget::Sequence(vec![
                BranchTarget::Position(4),
                BranchTarget::Alias("archive-row".into())
            ])
        );
    }

    #[test]
    fn stringify_leaves_strings_unquoted() {
        assert_eq!(stringify(&json!("no")), "no");
        assert_eq!(stringify(&json!(3)), "3");
        assert_eq!(stringify(&json!(true)), "true");
    }

    #[test]
    fn numeric_comparisons() {
        assert!(condition_holds(CompareOp::Gt, Some(&json!(5)), Some(&json!(3))));
        assert!(!condition_holds(CompareOp::Lt, Some(&json!(5)), Some(&json!(3))));
        assert!(condition_holds(CompareOp::Gte, Some(&json!(3)), Some(&json!(3))));
    }

    #[test]
    fn contains_works_on_strings_and_arrays() {
        assert!(condition_holds(
            CompareOp::Contains,
            Some(&json!("invoice overdue")),
            Some(&json!("overdue"))
        ));
        assert!(condition_holds(
            CompareOp::Contains,
            Some(&json!(["a", "b"])),
            Some(&json!("b"))
        ));
        assert!(!condition_holds(
            CompareOp::Contains,
            Some(&json!(42)),
            Some(&json!(4))
        ));
    }

    #[test]
    fn exists_ignores_the_right_hand_side() {
        assert!(condition_holds(CompareOp::Exists, Some(&json!(null)), None));
        assert!(!condition_holds(CompareOp::Exists, None, None));
    }

    #[test]
    fn missing_path_matches_ne_but_not_eq() {
        assert!(condition_holds(CompareOp::Ne, None, Some(&json!("x"))));
        assert!(!condition_holds(CompareOp::Eq, None, Some(&json!("x"))));
    }
}
