//! Narrow interfaces over the external collaborators: the browser
//! driver and the reasoning service. Concrete vendor bindings live
//! outside this repository; the engine only sees these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Browser driver failures, mapped uniformly onto executor failures.
#[derive(Debug, Error, Clone)]
pub enum DriverError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation timeout: {0}")]
    NavigationTimeout(String),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("driver I/O error: {0}")]
    Io(String),
}

/// Reasoning-service failures.
#[derive(Debug, Error, Clone)]
pub enum ReasonerError {
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning service rejected the request: {0}")]
    Rejected(String),
}

/// One open browser tab.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub url: String,
    pub title: String,
    pub active: bool,
}

/// Outcome of an AI-mediated interaction attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActReport {
    pub success: bool,
    /// Natural-language description of what happened.
    pub description: String,
}

/// The live, stateful browser session owned by one run.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn go_back(&self) -> Result<(), DriverError>;

    async fn go_forward(&self) -> Result<(), DriverError>;

    async fn refresh(&self) -> Result<(), DriverError>;

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn open_tab(&self, url: Option<&str>) -> Result<TabInfo, DriverError>;

    async fn switch_tab(&self, tab_id: &str) -> Result<(), DriverError>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, DriverError>;

    /// Deterministic click by stable selector.
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// Deterministic typing by stable selector.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Deterministic structural check.
    async fn element_exists(&self, selector: &str) -> Result<bool, DriverError>;

    /// Perform a natural-language interaction against the live page.
    async fn act(&self, instruction: &str) -> Result<ActReport, DriverError>;

    /// Extract/observe/assess against an instruction and output shape.
    async fn extract(&self, instruction: &str, shape: &Value) -> Result<Value, DriverError>;
}

/// The external LLM-backed component consulted by cognition and
/// AI-mediated primitives. Shape is mandatory for data-returning
/// calls; that rule is enforced at node validation, before execution.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Send a prompt plus structured input; returns the raw response
    /// text (callers parse and shape-check it).
    async fn complete(
        &self,
        prompt: &str,
        input: &Value,
        shape: Option<&Value>,
    ) -> Result<String, ReasonerError>;
}
