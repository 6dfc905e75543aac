//! Workflow interpreter and run surface.
//!
//! Walks a stored node graph in position order, dispatches each node
//! to its primitive executor or control-flow handler, threads a scoped
//! variable store through every step, and records per-step provenance
//! in the memory recorder. Runs are sequential within themselves;
//! independent runs share nothing mutable.

pub mod control;
pub mod errors;
pub mod interpreter;
pub mod run;
pub mod validate;

pub use control::{BranchTarget, CompareOp, HandleConfig, IterateConfig, RouteConfig};
pub use errors::{EngineError, ErrorKind};
pub use interpreter::{Interpreter, INDEX_VAR, ITEM_VAR, LAST_ERROR_VAR};
pub use run::{RunFailure, RunHandle, RunOptions, RunState, Runtime};
pub use validate::validate_workflow;
