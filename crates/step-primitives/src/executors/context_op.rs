//! Direct variable-store manipulation. Unlike the other executors this
//! one writes to the store itself and merges nothing through the usual
//! output path.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{StepCtx, StepError, StepExecutor, StepOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ContextOpConfig {
    Set {
        key: String,
        value: Value,
    },
    /// Copy a value to a new key. Missing source is a no-op.
    Get {
        key: String,
        #[serde(default)]
        into: Option<String>,
    },
    /// Remove one key, or every binding in the current scope.
    Clear {
        #[serde(default)]
        key: Option<String>,
    },
    Merge {
        values: Map<String, Value>,
    },
}

/// Executor for `context` nodes.
pub struct ContextExecutor;

#[async_trait]
impl StepExecutor for ContextExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Context
    }

    fn default_output_key(&self) -> &'static str {
        "context"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let _: ContextOpConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("context: {err}")))?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let op: ContextOpConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("context: {err}")))?;

        match op {
            ContextOpConfig::Set { key, value } => {
                debug!(node = %ctx.node_id, %key, "context set");
                vars.set(key, value);
            }
            ContextOpConfig::Get { key, into } => {
                if let Some(value) = vars.get(&key).cloned() {
                    let target = into.unwrap_or_else(|| key.clone());
                    debug!(node = %ctx.node_id, from = %key, to = %target, "context get");
                    vars.set(target, value);
                }
                // Missing key: deliberately silent.
            }
            ContextOpConfig::Clear { key } => match key {
                Some(key) => {
                    debug!(node = %ctx.node_id, %key, "context clear key");
                    vars.remove(&key);
                }
                None => {
                    debug!(node = %ctx.node_id, "context clear scope");
                    vars.clear();
                }
            },
            ContextOpConfig::Merge { values } => {
                debug!(node = %ctx.node_id, count = values.len(), "context merge");
                vars.merge(values);
            }
        }

        // No result: the store mutation is the whole effect.
        Ok(StepOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedBrowser, ScriptedReasoner};
    use flowmill_core_types::{NodeId, SessionHandle};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StepCtx {
        StepCtx::new(
            SessionHandle::new(),
            Arc::new(ScriptedBrowser::new()),
            Arc::new(ScriptedReasoner::new()),
            NodeId::from("ctx-op"),
            Instant::now() + Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn set_then_get_into_alias() {
        let mut vars = VarStore::new();
        ContextExecutor
            .execute(&ctx(), &json!({"op": "set", "key": "city", "value": "Lyon"}), &mut vars)
            .await
            .unwrap();
        ContextExecutor
            .execute(
                &ctx(),
                &json!({"op": "get", "key": "city", "into": "destination"}),
                &mut vars,
            )
            .await
            .unwrap();
        assert_eq!(vars.get("destination"), Some(&json!("Lyon")));
    }

    #[tokio::test]
    async fn get_missing_key_is_noop() {
        let mut vars = VarStore::new();
        let outcome = ContextExecutor
            .execute(&ctx(), &json!({"op": "get", "key": "absent"}), &mut vars)
            .await
            .unwrap();
        assert!(outcome.result.is_none());
        assert!(vars.get("absent").is_none());
    }

    #[tokio::test]
    async fn clear_single_key_and_whole_scope() {
        let mut vars = VarStore::new();
        vars.set("a", json!(1));
        vars.set("b", json!(2));
        ContextExecutor
            .execute(&ctx(), &json!({"op": "clear", "key": "a"}), &mut vars)
            .await
            .unwrap();
        assert!(vars.get("a").is_none());
        assert!(vars.get("b").is_some());

        ContextExecutor
            .execute(&ctx(), &json!({"op": "clear"}), &mut vars)
            .await
            .unwrap();
        assert!(vars.get("b").is_none());
    }

    #[tokio::test]
    async fn merge_overwrites_existing() {
        let mut vars = VarStore::new();
        vars.set("kept", json!("old"));
        ContextExecutor
            .execute(
                &ctx(),
                &json!({"op": "merge", "values": {"kept": "new", "added": 7}}),
                &mut vars,
            )
            .await
            .unwrap();
        assert_eq!(vars.get("kept"), Some(&json!("new")));
        assert_eq!(vars.get("added"), Some(&json!(7)));
    }

    #[test]
    fn unknown_op_rejected() {
        let err = ContextExecutor.validate(&json!({"op": "swap"})).unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
    }
}
