//! Deterministic browser operations: navigate, fixed waits, tab
//! management, history moves, refresh, screenshots, key presses, and
//! selector-addressed click/type.

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{StepCtx, StepError, StepEvent, StepExecutor, StepOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BrowserActionConfig {
    Navigate {
        url: String,
    },
    WaitDuration {
        ms: u64,
    },
    GoBack,
    GoForward,
    Refresh,
    Screenshot,
    PressKey {
        key: String,
    },
    OpenTab {
        #[serde(default)]
        url: Option<String>,
    },
    SwitchTab {
        tab_id: String,
    },
    ListTabs,
    Click {
        selector: String,
    },
    TypeText {
        selector: String,
        text: String,
    },
}

/// Executor for `browser-action` nodes.
pub struct BrowserActionExecutor;

#[async_trait]
impl StepExecutor for BrowserActionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::BrowserAction
    }

    fn default_output_key(&self) -> &'static str {
        "browser"
    }

    fn validate(&self, config: &Value) -> Result<(), StepError> {
        serde_json::from_value::<BrowserActionConfig>(config.clone())
            .map(|_| ())
            .map_err(|err| StepError::Configuration(format!("browser-action: {err}")))
    }

    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        _vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError> {
        let action: BrowserActionConfig = serde_json::from_value(config.clone())
            .map_err(|err| StepError::Configuration(format!("browser-action: {err}")))?;
        debug!(node = %ctx.node_id, ?action, "executing browser action");

        let result = match &action {
            BrowserActionConfig::Navigate { url } => {
                ctx.browser.navigate(url).await?;
                json!({"navigated": url})
            }
            BrowserActionConfig::WaitDuration { ms } => {
                tokio::time::sleep(std::time::Duration::from_millis(*ms)).await;
                json!({"waited_ms": ms})
            }
            BrowserActionConfig::GoBack => {
                ctx.browser.go_back().await?;
                json!({"history": "back"})
            }
            BrowserActionConfig::GoForward => {
                ctx.browser.go_forward().await?;
                json!({"history": "forward"})
            }
            BrowserActionConfig::Refresh => {
                ctx.browser.refresh().await?;
                json!({"refreshed": true})
            }
            BrowserActionConfig::Screenshot => {
                let bytes = ctx.browser.screenshot().await?;
                json!({"captured": true, "bytes": bytes.len()})
            }
            BrowserActionConfig::PressKey { key } => {
                ctx.browser.press_key(key).await?;
                json!({"pressed": key})
            }
            BrowserActionConfig::OpenTab { url } => {
                let tab = ctx.browser.open_tab(url.as_deref()).await?;
                serde_json::to_value(tab)
                    .map_err(|err| StepError::Driver(err.to_string()))?
            }
            BrowserActionConfig::SwitchTab { tab_id } => {
                ctx.browser.switch_tab(tab_id).await?;
                json!({"active_tab": tab_id})
            }
            BrowserActionConfig::ListTabs => {
                let tabs = ctx.browser.list_tabs().await?;
                serde_json::to_value(tabs)
                    .map_err(|err| StepError::Driver(err.to_string()))?
            }
            BrowserActionConfig::Click { selector } => {
                ctx.browser.click(selector).await?;
                json!({"clicked": selector})
            }
            BrowserActionConfig::TypeText { selector, text } => {
                ctx.browser.type_text(selector, text).await?;
                json!({"typed_into": selector, "chars": text.chars().count()})
            }
        };

        Ok(StepOutcome::with_result(result.clone())
            .with_event(StepEvent::browser(result)))
    }
}
