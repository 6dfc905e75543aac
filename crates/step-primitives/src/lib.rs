//! Primitive step executors.
//!
//! One executor per node type, each behind the [`StepExecutor`] trait
//! and registered in an [`ExecutorSet`] keyed by type tag. Executors
//! receive resolved configuration, an explicit [`StepCtx`] (session
//! ownership is a parameter, never ambient state), and the run's
//! variable store.

mod ctx;
mod drivers;
pub mod errors;
mod executors;
pub mod mock;
mod secrets;
pub mod shape;

pub use ctx::StepCtx;
pub use drivers::{
    ActReport, BrowserDriver, DriverError, ReasonerError, ReasoningService, TabInfo,
};
pub use errors::StepError;
pub use executors::{
    strip_code_fences, AiActionExecutor, AiQueryExecutor, BrowserActionExecutor,
    BrowserQueryExecutor, CognitionExecutor, ContextExecutor, ExecutorSet, TransformExecutor,
    TransformRegistry,
};
pub use secrets::{
    substitute_secrets, EnvSecretProvider, NoSecrets, SecretProvider, StaticSecretProvider,
};

use async_trait::async_trait;
use flowmill_core_types::NodeType;
use flowmill_var_store::VarStore;
use serde_json::Value;

/// Kind of an observable event emitted while a step runs. The engine
/// turns these into memory-artifact processing entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepEventKind {
    Reasoner,
    Browser,
    Error,
}

/// One observable event with its payload.
#[derive(Clone, Debug)]
pub struct StepEvent {
    pub kind: StepEventKind,
    pub payload: Value,
}

impl StepEvent {
    pub fn browser(payload: Value) -> Self {
        Self {
            kind: StepEventKind::Browser,
            payload,
        }
    }

    pub fn reasoner(payload: Value) -> Self {
        Self {
            kind: StepEventKind::Reasoner,
            payload,
        }
    }
}

/// What a step produced.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    /// Primary result, merged into the variable store under the node's
    /// output key. `None` means the step manages the store itself
    /// (context operations) and nothing is merged.
    pub result: Option<Value>,

    /// Events observed while executing, in order.
    pub events: Vec<StepEvent>,

    /// Internal retries the executor performed.
    pub retry_count: u32,
}

impl StepOutcome {
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: StepEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// The executable behavior bound to a node type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Type tag this executor handles.
    fn node_type(&self) -> NodeType;

    /// Variable-store key results land under when the node does not
    /// declare an explicit `output_key`.
    fn default_output_key(&self) -> &'static str;

    /// Validate raw (unresolved) configuration before any side effect.
    fn validate(&self, config: &Value) -> Result<(), StepError>;

    /// Execute against resolved configuration and the live session.
    async fn execute(
        &self,
        ctx: &StepCtx,
        config: &Value,
        vars: &mut VarStore,
    ) -> Result<StepOutcome, StepError>;
}
