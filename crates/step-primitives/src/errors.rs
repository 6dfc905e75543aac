//! Error types for primitive step execution.

use flowmill_var_store::VarError;
use serde_json::Value;
use thiserror::Error;

use crate::drivers::{DriverError, ReasonerError};

/// Failures a primitive executor can signal. All of these travel the
/// same propagation path and are eligible for `handle` recovery.
#[derive(Debug, Error)]
pub enum StepError {
    /// Malformed node configuration. Surfaced at validation time,
    /// before any side effect.
    #[error("configuration invalid: {0}")]
    Configuration(String),

    /// A selector matched nothing on the live page.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Navigation did not settle within its ceiling.
    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    /// The reasoning service could not resolve a natural-language
    /// interaction after exhausting bounded retries.
    #[error("action not resolved after {attempts} attempts: {instruction}")]
    ActionNotResolved { instruction: String, attempts: u32 },

    /// Returned data does not conform to the declared output shape.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// A transform function failed; carries the offending inputs.
    #[error("transform '{name}' failed: {message}")]
    Transform {
        name: String,
        message: String,
        input: Value,
    },

    /// Reasoner output was not parseable even after stripping known
    /// formatting artifacts.
    #[error("malformed reasoner response: {0}")]
    MalformedResponse(String),

    /// Browser driver failure not captured by a more specific variant.
    #[error("browser driver error: {0}")]
    Driver(String),

    /// Reasoning service failure.
    #[error("reasoning service error: {0}")]
    Reasoner(String),

    /// Template or variable lookup failure inside an executor.
    #[error(transparent)]
    Var(#[from] VarError),

    /// Cooperative cancellation observed mid-step.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether an automatic bounded retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::ElementNotFound(_) | StepError::Driver(_) | StepError::Reasoner(_)
        )
    }
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::ElementNotFound(detail) => StepError::ElementNotFound(detail),
            DriverError::NavigationTimeout(detail) => StepError::NavigationTimeout(detail),
            DriverError::TabNotFound(detail) => {
                StepError::Driver(format!("tab not found: {detail}"))
            }
            DriverError::Io(detail) => StepError::Driver(detail),
        }
    }
}

impl From<ReasonerError> for StepError {
    fn from(err: ReasonerError) -> Self {
        StepError::Reasoner(err.to_string())
    }
}
