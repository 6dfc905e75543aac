//! Flowmill library
//!
//! Re-exports the workspace crates behind one facade so embedders can
//! depend on a single package.

pub use body_resolver::{self as resolver, Resolution, ResolutionReport, ResolutionWarning};
pub use flow_engine::{
    validate_workflow, BranchTarget, EngineError, ErrorKind, Interpreter, RunFailure, RunHandle,
    RunOptions, RunState, Runtime,
};
pub use flowmill_core_types::{NodeId, NodeType, RunId, RunStatus, SessionHandle, WorkflowId};
pub use flowmill_registry::{
    load_workflow_file, load_workflow_str, BodyPatch, BodyRef, BodySpec, InMemoryNodeStore, Node,
    NodeRef, NodeStore, RegistryError,
};
pub use flowmill_var_store::{VarError, VarStore};
pub use step_memory::{
    ArtifactStatus, MemoryRecorder, MemoryStatsSnapshot, SharedMemoryRecorder, StepArtifact,
};
pub use step_primitives::{
    BrowserDriver, EnvSecretProvider, ExecutorSet, NoSecrets, ReasoningService, SecretProvider,
    StaticSecretProvider, StepError, StepExecutor,
};

/// Scripted in-memory drivers for tests and dry runs.
pub mod mock {
    pub use step_primitives::mock::{ScriptedBrowser, ScriptedReasoner};
}
