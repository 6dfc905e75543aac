//! Deterministic structural checks: element exists/absent by stable
//! selector.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{StepCtx, StepError, StepEvent, StepExecutor, StepOutcome};

#[derive(Debug, Clone, Deserialize)]
struct BrowserQueryConfig {
    selector: String,

    /// When true the check passes if the element is absent.
    #[serde(default)]
    expect_absent: bool,

    /// When true a mismatch halts the workflow; otherwise the step
    /// succeeds with `matched: false` and execution continues.
    #[serde(default)]
    halt_on_mismatch: bool,
}

/// Executor for `browser-query` nodes.
pub struct BrowserQueryExecutor;

#[async_trait]
impl StepExecutor for BrowserQueryExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::BrowserQuery
    }

    fn default_output_key(&self) -> &'static str {
        "query"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        serde_json::from_value::<BrowserQueryConfig>(config.clone())
            .map(|_| ())
            .map_err(|err| StepError::Configuration(format!("browser-query: {err}")))
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        _vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let query: BrowserQueryConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("browser-query: {err}")))?;

        let exists = ctx.browser.element_exists(&query.selector).await?;
        let matched = exists != query.expect_absent;
        debug!(
            node = %ctx.node_id,
            selector = %query.selector,
            exists,
            matched,
            "browser query evaluated"
        );

        if !matched && query.halt_on_mismatch {
            return Err(StepError::ElementNotFound(format!(
                "selector '{}' {} but the workflow requires otherwise",
                query.selector,
                if exists { "exists" } else { "is absent" }
            )));
        }

        let result = json!({
            "matched": matched,
            "exists": exists,
            "selector": query.selector,
        });
        Ok(StepOutcome::with_result(result.clone()).with_event(StepEvent::browser(result)))
    }
}
