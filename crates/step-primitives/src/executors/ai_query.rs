//! Natural-language extraction/observation/assessment against a
//! declared output shape. The shape is mandatory: free-text answers
//! with no declared structure are rejected at validation time.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{shape, StepCtx, StepError, StepEvent, StepExecutor, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum QueryMode {
    #[default]
    Extract,
    Observe,
    Assess,
}

#[derive(Debug, Clone, Deserialize)]
struct AiQueryConfig {
    instruction: String,

    /// Declared output shape. Never optional.
    shape: Option<Value>,

    #[serde(default)]
    mode: QueryMode,
}

/// Executor for `ai-query` nodes.
pub struct AiQueryExecutor;

#[async_trait]
impl StepExecutor for AiQueryExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::AiQuery
    }

    fn default_output_key(&self) -> &'static str {
        "extracted"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let parsed: AiQueryConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("ai-query: {err}")))?;
        if parsed.instruction.trim().is_empty() {
            return Err(StepError::Configuration(
                "ai-query: instruction cannot be empty".into(),
            ));
        }
        let Some(declared) = parsed.shape else {
            return Err(StepError::Configuration(
                "ai-query: a declared output shape is mandatory".into(),
            ));
        };
        shape::check_declaration(&declared)
            .map_err(|err| StepError::Configuration(format!("ai-query shape: {err}")))
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        _vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let query: AiQueryConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("ai-query: {err}")))?;
        let declared = query
            .shape
            .ok_or_else(|| StepError::Configuration("ai-query: shape missing".into()))?;

        debug!(node = %ctx.node_id, mode = ?query.mode, "running ai query");
        let value = ctx.browser.extract(&query.instruction, &declared).await?;

        shape::validate(&value, &declared).map_err(StepError::SchemaValidation)?;

        Ok(StepOutcome::with_result(value.clone()).with_event(StepEvent::browser(json!({
            "instruction": query.instruction,
            "mode": format!("{:?}", query.mode).to_lowercase(),
            "extracted": value,
        }))))
    }
}
