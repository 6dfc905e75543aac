//! Engine error types and the error taxonomy terminal run states
//! report.

use body_resolver::ResolveError;
use flowmill_registry::RegistryError;
use flowmill_var_store::VarError;
use step_memory::MemoryError;
use step_primitives::StepError;
use thiserror::Error;

/// Taxonomy kind carried by a terminal run state. Coarser than
/// [`EngineError`]: callers deciding what to do next care about the
/// category, not the exact variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed workflow, detected before any side effect.
    Configuration,
    /// Route had no matching branch and no default.
    Routing,
    /// Template or variable lookup failed at resolution point.
    Template,
    /// A primitive executor failed (browser, reasoner, transform,
    /// timeout). Recoverable via `handle`.
    Executor,
    /// Cooperative cancellation honored between nodes.
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Routing => "routing",
            ErrorKind::Template => "template",
            ErrorKind::Executor => "executor",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Engine failures. Everything that can stop a run travels through
/// this type; `handle` nodes observe and may recover the
/// executor-taxonomy variants.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error at node {node}: {message}")]
    Configuration { node: String, message: String },

    #[error("node {node}: no branch matched value '{value}' and no default is declared")]
    Routing { node: String, value: String },

    #[error("node {node}: {source}")]
    Template {
        node: String,
        #[source]
        source: VarError,
    },

    #[error("node {node}: {source}")]
    Step {
        node: String,
        #[source]
        source: StepError,
    },

    #[error("node {node} timed out after {ms} ms")]
    Timeout { node: String, ms: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration { .. } => ErrorKind::Configuration,
            EngineError::Routing { .. } => ErrorKind::Routing,
            EngineError::Template { .. } => ErrorKind::Template,
            EngineError::Step { source, .. } => match source {
                StepError::Configuration(_) => ErrorKind::Configuration,
                StepError::Var(_) => ErrorKind::Template,
                StepError::Cancelled => ErrorKind::Cancelled,
                _ => ErrorKind::Executor,
            },
            EngineError::Timeout { .. } => ErrorKind::Executor,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Registry(_) => ErrorKind::Configuration,
            EngineError::Resolve(_) => ErrorKind::Configuration,
            EngineError::Memory(_) => ErrorKind::Internal,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The node where the failure originated, when one is known.
    pub fn origin_node(&self) -> Option<&str> {
        match self {
            EngineError::Configuration { node, .. }
            | EngineError::Routing { node, .. }
            | EngineError::Template { node, .. }
            | EngineError::Step { node, .. }
            | EngineError::Timeout { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Whether a `handle` node may recover this failure. Configuration
    /// and template errors stay fatal: recovering them would hide a
    /// broken workflow definition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Executor | ErrorKind::Routing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failures_map_to_executor_kind() {
        let err = EngineError::Step {
            node: "n1".into(),
            source: StepError::ElementNotFound("#x".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Executor);
        assert_eq!(err.origin_node(), Some("n1"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn template_failures_are_not_recoverable() {
        let err = EngineError::Template {
            node: "n2".into(),
            source: VarError::TemplateResolution {
                token: "missing".into(),
                key: "missing".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::Template);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn timeouts_travel_the_executor_path() {
        let err = EngineError::Timeout {
            node: "slow".into(),
            ms: 30_000,
        };
        assert_eq!(err.kind(), ErrorKind::Executor);
        assert!(err.is_recoverable());
    }
}
