//! The run surface: start a workflow as a spawned task, observe its
//! state, cancel it cooperatively, wait for its terminal status.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flowmill_core_types::{RunId, RunStatus, WorkflowId};
use flowmill_registry::{Node, NodeStore};
use flowmill_var_store::VarStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use step_memory::{MemoryRecorder, SharedMemoryRecorder, StepArtifact};
use step_primitives::{BrowserDriver, ExecutorSet, ReasoningService, SecretProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{EngineError, ErrorKind};
use crate::interpreter::Interpreter;

/// Options for one run invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Seed values for the workflow-global scope.
    pub initial_variables: Map<String, Value>,

    /// Restrict execution to these positions or aliases. Empty means
    /// the whole workflow.
    pub only: Vec<String>,

    /// Skip top-level nodes before this position or alias.
    pub start_at: Option<String>,

    /// Stop after executing this position or alias.
    pub stop_at: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_variables.insert(key.into(), value);
        self
    }

    pub fn with_only(mut self, node: impl Into<String>) -> Self {
        self.only.push(node.into());
        self
    }

    pub fn starting_at(mut self, node: impl Into<String>) -> Self {
        self.start_at = Some(node.into());
        self
    }

    pub fn stopping_at(mut self, node: impl Into<String>) -> Self {
        self.stop_at = Some(node.into());
        self
    }

    /// The set of positions this run may execute at the top level.
    pub(crate) fn select(
        &self,
        nodes: &[Node],
        alias_index: &HashMap<String, u32>,
    ) -> Result<HashSet<u32>, EngineError> {
        let resolve = |reference: &str| -> Result<u32, EngineError> {
            if let Ok(position) = reference.parse::<u32>() {
                return Ok(position);
            }
            alias_index
                .get(reference)
                .copied()
                .ok_or_else(|| EngineError::Configuration {
                    node: reference.to_string(),
                    message: "run options reference names no node".into(),
                })
        };

        if !self.only.is_empty() {
            let mut selected = HashSet::new();
            for reference in &self.only {
                selected.insert(resolve(reference)?);
            }
            return Ok(selected);
        }

        let start = self.start_at.as_deref().map(resolve).transpose()?;
        let stop = self.stop_at.as_deref().map(resolve).transpose()?;

        Ok(nodes
            .iter()
            .map(|n| n.position)
            .filter(|p| start.map_or(true, |s| *p >= s) && stop.map_or(true, |s| *p <= s))
            .collect())
    }
}

/// Terminal failure details carried by a run state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunFailure {
    pub node: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Observable state of a run.
#[derive(Clone, Debug)]
pub struct RunState {
    pub status: RunStatus,
    /// Flattened variable view. Updated when the run reaches a
    /// terminal status; before that it shows the initial variables.
    pub variables: Value,
    pub last_artifact: Option<StepArtifact>,
    pub failure: Option<RunFailure>,
}

struct RunShared {
    status: Mutex<RunStatus>,
    variables: Mutex<Value>,
    failure: Mutex<Option<RunFailure>>,
    memory: SharedMemoryRecorder,
}

/// Handle to one spawned run.
pub struct RunHandle {
    id: RunId,
    cancel: CancellationToken,
    shared: Arc<RunShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// Request cooperative cancellation. Honored between nodes; an
    /// in-flight driver or reasoner call completes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RunState {
        RunState {
            status: *self.shared.status.lock(),
            variables: self.shared.variables.lock().clone(),
            last_artifact: self.shared.memory.last(),
            failure: self.shared.failure.lock().clone(),
        }
    }

    pub fn memory(&self) -> SharedMemoryRecorder {
        self.shared.memory.clone()
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&self) -> RunState {
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                warn!(run = %self.id, error = %err, "run task panicked");
                *self.shared.status.lock() = RunStatus::Failed;
                *self.shared.failure.lock() = Some(RunFailure {
                    node: None,
                    kind: ErrorKind::Internal,
                    message: err.to_string(),
                });
            }
        }
        self.state()
    }
}

/// Factory for runs over one node store. Each started run gets its own
/// interpreter, memory recorder, variable store, and cancellation
/// token; the drivers passed in are owned by that run alone.
pub struct Runtime {
    store: Arc<dyn NodeStore>,
    executors: ExecutorSet,
    secrets: Option<Arc<dyn SecretProvider>>,
}

impl Runtime {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            executors: ExecutorSet::standard(),
            secrets: None,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorSet) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Spawn a workflow run and return immediately with its handle.
    pub fn start_run(
        &self,
        workflow: WorkflowId,
        browser: Arc<dyn BrowserDriver>,
        reasoner: Arc<dyn ReasoningService>,
        options: RunOptions,
    ) -> RunHandle {
        let id = RunId::new();
        let memory: SharedMemoryRecorder = Arc::new(MemoryRecorder::new());
        let cancel = CancellationToken::new();

        let mut interpreter = Interpreter::new(
            workflow.clone(),
            self.store.clone(),
            self.executors.clone(),
            memory.clone(),
            browser,
            reasoner,
        )
        .with_cancellation(cancel.clone());
        if let Some(secrets) = &self.secrets {
            interpreter = interpreter.with_secrets(secrets.clone());
        }

        let shared = Arc::new(RunShared {
            status: Mutex::new(RunStatus::Pending),
            variables: Mutex::new(Value::Object(options.initial_variables.clone())),
            failure: Mutex::new(None),
            memory,
        });

        let task_shared = shared.clone();
        let run_id = id.clone();
        let join = tokio::spawn(async move {
            *task_shared.status.lock() = RunStatus::Running;
            let initial: HashMap<String, Value> =
                options.initial_variables.clone().into_iter().collect();
            let mut vars = VarStore::with_initial(initial);

            let result = interpreter.run(&mut vars, &options).await;

            *task_shared.variables.lock() = Value::Object(vars.snapshot());
            match result {
                Ok(()) => {
                    info!(run = %run_id, workflow = %workflow, "run completed");
                    *task_shared.status.lock() = RunStatus::Completed;
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    info!(run = %run_id, workflow = %workflow, "run cancelled");
                    *task_shared.status.lock() = RunStatus::Cancelled;
                }
                Err(err) => {
                    warn!(run = %run_id, workflow = %workflow, error = %err, "run failed");
                    *task_shared.failure.lock() = Some(RunFailure {
                        node: err.origin_node().map(str::to_string),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    *task_shared.status.lock() = RunStatus::Failed;
                }
            }
        });

        RunHandle {
            id,
            cancel,
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    /// Start a run and wait for its terminal state.
    pub async fn run_to_completion(
        &self,
        workflow: WorkflowId,
        browser: Arc<dyn BrowserDriver>,
        reasoner: Arc<dyn ReasoningService>,
        options: RunOptions,
    ) -> RunState {
        let handle = self.start_run(workflow, browser, reasoner, options);
        handle.wait().await
    }
}
