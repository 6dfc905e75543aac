//! The stored workflow graph: node model, body specifications, and the
//! narrow [`NodeStore`] interface the engine reads and writes through.

mod loader;
mod node;
mod store;

pub use loader::{load_workflow_file, load_workflow_str, WorkflowFile};
pub use node::{BodyPatch, BodyRef, BodySpec, Node};
pub use store::{InMemoryNodeStore, NodeRef, NodeStore};

use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("alias '{0}' matches more than one node")]
    AmbiguousAlias(String),

    #[error("duplicate node position {0} in workflow")]
    DuplicatePosition(u32),

    #[error("workflow file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow format error: {0}")]
    Format(#[from] serde_json::Error),
}
