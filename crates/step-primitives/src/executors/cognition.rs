//! Reasoning steps: prompt plus resolved input data in, strictly-typed
//! JSON out. Free-form prose is never an acceptable result.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{shape, StepCtx, StepError, StepEvent, StepExecutor, StepOutcome};

#[derive(Debug, Clone, Deserialize)]
struct CognitionConfig {
    prompt: String,

    /// Structured input passed alongside the prompt, already
    /// template-resolved by the interpreter.
    #[serde(default)]
    input: Value,

    /// Declared output shape. Mandatory, same rule as ai-query.
    shape: Option<Value>,
}

/// Executor for `cognition` nodes.
pub struct CognitionExecutor;

/// Strip known formatting artifacts (markdown code fences, an optional
/// language tag) from a reasoner response before parsing.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop a language tag such as `json` on the opening fence line.
    let rest = match rest.split_once('\n') {
        Some((first_line, body)) if !first_line.trim().is_empty() => {
            if first_line.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
                body
            } else {
                rest
            }
        }
        _ => rest,
    };
    rest.trim()
}

#[async_trait]
impl StepExecutor for CognitionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Cognition
    }

    fn default_output_key(&self) -> &'static str {
        "cognition"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let parsed: CognitionConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("cognition: {err}")))?;
        if parsed.prompt.trim().is_empty() {
            return Err(StepError::Configuration(
                "cognition: prompt cannot be empty".into(),
            ));
        }
        let Some(declared) = parsed.shape else {
            return Err(StepError::Configuration(
                "cognition: a declared output shape is mandatory".into(),
            ));
        };
        shape::check_declaration(&declared)
            .map_err(|err| StepError::Configuration(format!("cognition shape: {err}")))
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        _vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let cognition: CognitionConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("cognition: {err}")))?;
        let declared = cognition
            .shape
            .ok_or_else(|| StepError::Configuration("cognition: shape missing".into()))?;

        debug!(node = %ctx.node_id, "consulting reasoning service");
        let response = ctx
            .reasoner
            .complete(&cognition.prompt, &cognition.input, Some(&declared))
            .await?;

        let cleaned = strip_code_fences(&response);
        let parsed: Value = serde_json::from_str(cleaned).map_err(|err| {
            StepError::MalformedResponse(format!(
                "not valid JSON after stripping artifacts ({err}): {cleaned}"
            ))
        })?;

        shape::validate(&parsed, &declared).map_err(StepError::SchemaValidation)?;

        Ok(StepOutcome::with_result(parsed.clone()).with_event(StepEvent::reasoner(json!({
            "prompt": cognition.prompt,
            "response": response,
            "parsed": parsed,
        }))))
    }
}
