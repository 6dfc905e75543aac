//! Natural-language-driven interaction, resolved by the reasoning
//! service against the live page with bounded retries.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::{StepCtx, StepError, StepEvent, StepExecutor, StepOutcome};

const RETRY_BACKOFF_MS: u64 = 250;

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
struct AiActionConfig {
    instruction: String,

    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

/// Executor for `ai-action` nodes.
pub struct AiActionExecutor;

#[async_trait]
impl StepExecutor for AiActionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::AiAction
    }

    fn default_output_key(&self) -> &'static str {
        "action"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        let parsed: AiActionConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("ai-action: {err}")))?;
        if parsed.instruction.trim().is_empty() {
            return Err(StepError::Configuration(
                "ai-action: instruction cannot be empty".into(),
            ));
        }
        if parsed.max_attempts == 0 {
            return Err(StepError::Configuration(
                "ai-action: max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        _vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let action: AiActionConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("ai-action: {err}")))?;

        let mut events = Vec::new();
        let mut attempt = 1u32;
        loop {
            if ctx.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            debug!(
                node = %ctx.node_id,
                attempt,
                instruction = %action.instruction,
                "resolving ai action"
            );

            match ctx.browser.act(&action.instruction).await {
                Ok(report) if report.success => {
                    events.push(StepEvent::browser(json!({
                        "attempt": attempt,
                        "description": report.description,
                    })));
                    let result = json!({
                        "success": true,
                        "description": report.description,
                        "attempts": attempt,
                    });
                    return Ok(StepOutcome {
                        result: Some(result),
                        events,
                        retry_count: attempt - 1,
                    });
                }
                Ok(report) => {
                    warn!(
                        node = %ctx.node_id,
                        attempt,
                        "ai action attempt did not resolve: {}",
                        report.description
                    );
                    events.push(StepEvent::browser(json!({
                        "attempt": attempt,
                        "failed": report.description,
                    })));
                }
                Err(err) => {
                    warn!(node = %ctx.node_id, attempt, error = %err, "ai action attempt failed");
                    events.push(StepEvent {
                        kind: crate::StepEventKind::Error,
                        payload: json!({"attempt": attempt, "error": err.to_string()}),
                    });
                }
            }

            if attempt >= action.max_attempts {
                return Err(StepError::ActionNotResolved {
                    instruction: action.instruction,
                    attempts: attempt,
                });
            }
            attempt += 1;
            sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
        }
    }
}
