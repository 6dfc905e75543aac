//! The executor registry and one module per primitive.

mod ai_action;
mod ai_query;
mod browser_action;
mod browser_query;
mod cognition;
mod context_op;
mod transform;

pub use ai_action::AiActionExecutor;
pub use ai_query::AiQueryExecutor;
pub use browser_action::BrowserActionExecutor;
pub use browser_query::BrowserQueryExecutor;
pub use cognition::{strip_code_fences, CognitionExecutor};
pub use context_op::ContextExecutor;
pub use transform::{TransformExecutor, TransformRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use flowmill_core_types::NodeType;

use crate::StepExecutor;

/// Lookup table from node type tag to executor. Adding a node type
/// means adding one registration here, not touching the dispatcher.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    inner: HashMap<NodeType, Arc<dyn StepExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard seven primitives with the built-in transform
    /// registry.
    pub fn standard() -> Self {
        Self::new()
            .with_executor(Arc::new(BrowserActionExecutor))
            .with_executor(Arc::new(BrowserQueryExecutor))
            .with_executor(Arc::new(AiActionExecutor))
            .with_executor(Arc::new(AiQueryExecutor))
            .with_executor(Arc::new(TransformExecutor::new(Arc::new(
                TransformRegistry::builtin(),
            ))))
            .with_executor(Arc::new(CognitionExecutor))
            .with_executor(Arc::new(ContextExecutor))
    }

    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.inner.insert(executor.node_type(), executor);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn StepExecutor>> {
        self.inner.get(&node_type).cloned()
    }

    pub fn supports(&self, node_type: NodeType) -> bool {
        self.inner.contains_key(&node_type)
    }
}
