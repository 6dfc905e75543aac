//! The interpreter: walks a workflow's nodes in position order,
//! dispatches each to its executor or control-flow handler, threads
//! the variable store through, and records one memory artifact per
//! step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use chrono::Utc;
use flowmill_core_types::{NodeId, NodeType, SessionHandle, WorkflowId};
use flowmill_registry::{Node, NodeRef, NodeStore};
use flowmill_var_store::VarStore;
use parking_lot::Mutex;
use serde_json::{json, Value};
use step_memory::{
    mask_secrets, ArtifactStatus, EventKind, ForwardingRules, InputsSnapshot, SharedMemoryRecorder,
    StepHandle, StepOutputs,
};
use step_primitives::{
    substitute_secrets, BrowserDriver, NoSecrets, ReasoningService, SecretProvider, StepCtx,
    StepEventKind, StepOutcome,
};
use step_primitives::ExecutorSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{
    condition_holds, stringify, BranchTarget, HandleConfig, IterateConfig, RouteConfig,
};
use crate::errors::EngineError;
use crate::run::RunOptions;
use crate::validate;

/// Reserved variable bound to the current loop element.
pub const ITEM_VAR: &str = "item";
/// Reserved variable bound to the current loop index.
pub const INDEX_VAR: &str = "index";
/// Reserved variable bound by `handle` when its `try` branch fails.
pub const LAST_ERROR_VAR: &str = "lastError";

/// Per-type execution ceiling, overridable with a `timeout_ms` config
/// key.
fn default_timeout(node_type: NodeType) -> Duration {
    match node_type {
        NodeType::BrowserAction => Duration::from_secs(30),
        NodeType::BrowserQuery => Duration::from_secs(10),
        NodeType::AiAction | NodeType::AiQuery | NodeType::Cognition => Duration::from_secs(60),
        _ => Duration::from_secs(5),
    }
}

/// One workflow run's interpreter. Owns the run's session handle,
/// driver handles, memory recorder, and cancellation token; nothing
/// here is shared across runs.
pub struct Interpreter {
    workflow: WorkflowId,
    store: Arc<dyn NodeStore>,
    executors: ExecutorSet,
    memory: SharedMemoryRecorder,
    secrets: Arc<dyn SecretProvider>,
    session: SessionHandle,
    browser: Arc<dyn BrowserDriver>,
    reasoner: Arc<dyn ReasoningService>,
    cancel: CancellationToken,
    action_counters: Mutex<HashMap<String, u32>>,
}

impl Interpreter {
    pub fn new(
        workflow: WorkflowId,
        store: Arc<dyn NodeStore>,
        executors: ExecutorSet,
        memory: SharedMemoryRecorder,
        browser: Arc<dyn BrowserDriver>,
        reasoner: Arc<dyn ReasoningService>,
    ) -> Self {
        Self {
            workflow,
            store,
            executors,
            memory,
            secrets: Arc::new(NoSecrets),
            session: SessionHandle::new(),
            browser,
            reasoner,
            cancel: CancellationToken::new(),
            action_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn memory(&self) -> SharedMemoryRecorder {
        self.memory.clone()
    }

    /// Validate the workflow, then execute its top-level nodes in
    /// position order. Body members (nodes with a parent stamp) and
    /// branch targets run only when their loop or branch invokes them.
    pub async fn run(&self, vars: &mut VarStore, options: &RunOptions) -> Result<(), EngineError> {
        let mut nodes = self.store.list_nodes(&self.workflow).await?;

        // Resolve any unresolved iterate bodies before the walk, so
        // parent stamps exist and body members are not also executed
        // at the top level.
        let unresolved: Vec<u32> = nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Iterate && n.resolved_body.is_none())
            .map(|n| n.position)
            .collect();
        if !unresolved.is_empty() {
            for position in unresolved {
                body_resolver::resolve(self.store.as_ref(), &self.workflow, position, &[]).await?;
            }
            nodes = self.store.list_nodes(&self.workflow).await?;
        }

        validate::validate_workflow(&nodes, &self.executors)?;
        let skip = validate::branch_targets(&nodes)?;
        let alias_index = validate::alias_positions(&nodes);

        let selection = options.select(&nodes, &alias_index)?;

        info!(
            workflow = %self.workflow,
            nodes = nodes.len(),
            selected = selection.len(),
            "starting workflow run"
        );

        for node in nodes {
            if node.parent_position.is_some() || skip.contains(&node.position) {
                continue;
            }
            if !selection.contains(&node.position) {
                continue;
            }
            self.execute_node(&node, vars).await?;
        }

        Ok(())
    }

    /// Execute one node, dispatching on its type tag.
    #[async_recursion]
    pub async fn execute_node(&self, node: &Node, vars: &mut VarStore) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        debug!(
            position = node.position,
            alias = %node.alias,
            node_type = %node.node_type,
            "executing node"
        );

        match node.node_type {
            NodeType::Iterate => self.execute_iterate(node, vars).await,
            NodeType::Route => self.execute_route(node, vars).await,
            NodeType::Handle => self.execute_handle(node, vars).await,
            NodeType::Group => {
                debug!(alias = %node.alias, "group node is a no-op at execution time");
                Ok(())
            }
            _ => self.execute_primitive(node, vars).await,
        }
    }

    /// Run a primitive node: substitute secrets, resolve templates,
    /// open an artifact, dispatch, merge the output, close the
    /// artifact.
    async fn execute_primitive(&self, node: &Node, vars: &mut VarStore) -> Result<(), EngineError> {
        let executor = self
            .executors
            .get(node.node_type)
            .ok_or_else(|| EngineError::Internal(format!("no executor for {}", node.node_type)))?;

        // Secrets first: their tokens would otherwise be mistaken for
        // variable references during template resolution.
        let (with_secrets, secret_values) = substitute_secrets(&node.config, self.secrets.as_ref())
            .map_err(|source| EngineError::Step {
                node: node.alias.clone(),
                source,
            })?;
        let resolved = vars
            .resolve_config(&with_secrets)
            .map_err(|source| EngineError::Template {
                node: node.alias.clone(),
                source,
            })?;

        let action_index = self.claim_action_indices(&node.id, 1);
        let handle = self.begin_artifact(node, action_index, &resolved, vars, &secret_values)?;

        let ceiling = timeout_for(node, &resolved);
        let ctx = StepCtx::new(
            self.session.clone(),
            self.browser.clone(),
            self.reasoner.clone(),
            node.id.clone(),
            Instant::now() + ceiling,
            self.cancel.child_token(),
        );

        let started = Instant::now();
        let result = timeout(ceiling, executor.execute(&ctx, &resolved, vars)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(outcome)) => {
                self.record_outcome_events(&handle, &outcome, &secret_values);
                let state_delta = self.merge_output(node, executor.default_output_key(), &outcome, vars);

                let mut masked_result = outcome.result.clone().unwrap_or(Value::Null);
                mask_secrets(&mut masked_result, &secret_values);
                let mut masked_delta = state_delta;
                mask_secrets(&mut masked_delta, &secret_values);

                self.memory.complete(
                    &handle,
                    StepOutputs {
                        result: masked_result,
                        state_delta: masked_delta,
                        duration_ms,
                        retry_count: outcome.retry_count,
                    },
                    ArtifactStatus::Completed,
                )?;
                Ok(())
            }
            Ok(Err(source)) => {
                self.record_error(&handle, &source.to_string(), &secret_values);
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Failed,
                )?;
                Err(EngineError::Step {
                    node: node.alias.clone(),
                    source,
                })
            }
            Err(_elapsed) => {
                let ms = ceiling.as_millis() as u64;
                self.record_error(&handle, &format!("timed out after {ms} ms"), &secret_values);
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Failed,
                )?;
                Err(EngineError::Timeout {
                    node: node.alias.clone(),
                    ms,
                })
            }
        }
    }

    /// Run an `iterate` node: one child scope per element, reserved
    /// `item`/`index` bindings, the resolved body interpreted in order,
    /// forwarding/aggregation applied on scope pop. One artifact per
    /// iteration.
    async fn execute_iterate(&self, node: &Node, vars: &mut VarStore) -> Result<(), EngineError> {
        let config: IterateConfig = serde_json::from_value(node.config.clone()).map_err(|err| {
            EngineError::Configuration {
                node: node.alias.clone(),
                message: format!("iterate: {err}"),
            }
        })?;

        let source = vars
            .resolve_template_value(&config.source)
            .map_err(|source| EngineError::Template {
                node: node.alias.clone(),
                source,
            })?;
        let Value::Array(items) = source else {
            return Err(EngineError::Configuration {
                node: node.alias.clone(),
                message: format!("iterate: source did not yield an array: {source}"),
            });
        };

        let body = match &node.resolved_body {
            Some(body) => body.clone(),
            None => {
                let resolution =
                    body_resolver::resolve(self.store.as_ref(), &self.workflow, node.position, &[])
                        .await?;
                resolution.body_positions
            }
        };

        info!(
            alias = %node.alias,
            iterations = items.len(),
            body_len = body.len(),
            "entering iterate"
        );

        let base_index = self.claim_action_indices(&node.id, items.len() as u32);
        let forwarding = ForwardingRules {
            forward: config.forward.clone(),
            loop_local: Vec::new(),
            aggregate: config.aggregate.clone(),
        };

        for (i, item) in items.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let handle = self.memory.begin(
                &node.id,
                base_index + i as u32,
                InputsSnapshot {
                    resolved_config: json!({"source": config.source, "index": i}),
                    variables: Value::Object(vars.snapshot()),
                    environment: json!({"session": self.session.to_string()}),
                },
                forwarding.clone(),
            )?;

            vars.push_scope();
            vars.set(ITEM_VAR, item);
            vars.set(INDEX_VAR, json!(i));

            let started = Instant::now();
            let iteration = self.run_body(&body, vars).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match iteration {
                Ok(()) => {
                    vars.pop_scope(&config.forward, &config.aggregate)
                        .map_err(|source| EngineError::Template {
                            node: node.alias.clone(),
                            source,
                        })?;
                    self.memory.complete(
                        &handle,
                        StepOutputs {
                            result: json!({"iteration": i, "ok": true}),
                            duration_ms,
                            ..StepOutputs::default()
                        },
                        ArtifactStatus::Completed,
                    )?;
                }
                Err(err) => {
                    // A failed iteration's scope is discarded whole;
                    // nothing half-written forwards to the parent.
                    let _ = vars.discard_scope();
                    let _ = self.memory.record_event(
                        &handle,
                        EventKind::Error,
                        json!({"iteration": i, "error": err.to_string()}),
                    );
                    self.memory.complete(
                        &handle,
                        StepOutputs {
                            duration_ms,
                            ..StepOutputs::default()
                        },
                        ArtifactStatus::Failed,
                    )?;

                    if config.continue_on_error {
                        warn!(
                            alias = %node.alias,
                            iteration = i,
                            error = %err,
                            "iteration failed, continuing"
                        );
                        continue;
                    }
                    // Completed-iteration effects stay in place; no
                    // rollback.
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    async fn run_body(&self, body: &[u32], vars: &mut VarStore) -> Result<(), EngineError> {
        for position in body {
            let child = self
                .store
                .get_node(&self.workflow, &NodeRef::Position(*position))
                .await?;
            self.execute_node(&child, vars).await?;
        }
        Ok(())
    }

    /// Run a `route` node: pick exactly one branch (literal case map
    /// or first matching condition, else `default`), and execute it.
    async fn execute_route(&self, node: &Node, vars: &mut VarStore) -> Result<(), EngineError> {
        let config: RouteConfig = serde_json::from_value(node.config.clone()).map_err(|err| {
            EngineError::Configuration {
                node: node.alias.clone(),
                message: format!("route: {err}"),
            }
        })?;

        let mut matched_desc = String::new();
        let mut selected: Option<BranchTarget> = None;

        if let Some(value_template) = &config.value {
            let value = vars
                .resolve_template_value(value_template)
                .map_err(|source| EngineError::Template {
                    node: node.alias.clone(),
                    source,
                })?;
            let key = stringify(&value);
            if let Some(raw) = config.cases.get(&key) {
                let target: BranchTarget = serde_json::from_value(raw.clone())
                    .map_err(|err| EngineError::Internal(format!("route case: {err}")))?;
                matched_desc = format!("case:{key}");
                selected = Some(target);
            } else {
                matched_desc = format!("value:{key}");
            }
        }

        if selected.is_none() {
            for (idx, condition) in config.conditions.iter().enumerate() {
                let actual = vars.lookup_path(&condition.path);
                if condition_holds(condition.op, actual.as_ref(), condition.value.as_ref()) {
                    matched_desc = format!("condition:{idx}");
                    selected = Some(condition.target.clone());
                    break;
                }
            }
        }

        let (target, via_default) = match (selected, &config.default) {
            (Some(target), _) => (target, false),
            (None, Some(default)) => (default.clone(), true),
            (None, None) => {
                return Err(EngineError::Routing {
                    node: node.alias.clone(),
                    value: matched_desc,
                });
            }
        };

        debug!(
            alias = %node.alias,
            matched = %matched_desc,
            default = via_default,
            "route branch selected"
        );

        let action_index = self.claim_action_indices(&node.id, 1);
        let handle = self.memory.begin(
            &node.id,
            action_index,
            InputsSnapshot {
                resolved_config: json!({"matched": matched_desc, "default": via_default}),
                variables: Value::Object(vars.snapshot()),
                environment: json!({"session": self.session.to_string()}),
            },
            ForwardingRules::default(),
        )?;

        let started = Instant::now();
        let branch = self.execute_target(&target, vars).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match branch {
            Ok(()) => {
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        result: json!({"matched": matched_desc, "default": via_default}),
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Completed,
                )?;
                Ok(())
            }
            Err(err) => {
                let _ = self.memory.record_event(
                    &handle,
                    EventKind::Error,
                    json!({"error": err.to_string()}),
                );
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Failed,
                )?;
                Err(err)
            }
        }
    }

    /// Run a `handle` node: `try`, then `catch` on recoverable
    /// failure (binding `lastError`), then `finally` exactly once, and
    /// re-propagate if nothing recovered.
    async fn execute_handle(&self, node: &Node, vars: &mut VarStore) -> Result<(), EngineError> {
        let config: HandleConfig = serde_json::from_value(node.config.clone()).map_err(|err| {
            EngineError::Configuration {
                node: node.alias.clone(),
                message: format!("handle: {err}"),
            }
        })?;

        let action_index = self.claim_action_indices(&node.id, 1);
        let handle = self.memory.begin(
            &node.id,
            action_index,
            InputsSnapshot {
                variables: Value::Object(vars.snapshot()),
                environment: json!({"session": self.session.to_string()}),
                ..InputsSnapshot::default()
            },
            ForwardingRules::default(),
        )?;
        let started = Instant::now();

        let mut pending: Option<EngineError> = None;
        let mut recovered = false;

        match self.execute_target(&config.try_branch, vars).await {
            Ok(()) => {}
            Err(err) if err.kind() == crate::ErrorKind::Cancelled => {
                let _ = self.memory.complete(
                    &handle,
                    StepOutputs::default(),
                    ArtifactStatus::Failed,
                );
                return Err(err);
            }
            Err(err) => {
                vars.set(
                    LAST_ERROR_VAR,
                    json!({
                        "message": err.to_string(),
                        "node": err.origin_node(),
                        "at": Utc::now().to_rfc3339(),
                    }),
                );
                let _ = self.memory.record_event(
                    &handle,
                    EventKind::Error,
                    json!({"phase": "try", "error": err.to_string()}),
                );

                let may_recover = err.is_recoverable();
                pending = Some(err);

                if may_recover {
                    if let Some(catch) = &config.catch_branch {
                        match self.execute_target(catch, vars).await {
                            Ok(()) => {
                                recovered = true;
                                pending = None;
                            }
                            Err(catch_err) => {
                                // Catch failing keeps the original
                                // error as the one that propagates.
                                let _ = self.memory.record_event(
                                    &handle,
                                    EventKind::Error,
                                    json!({"phase": "catch", "error": catch_err.to_string()}),
                                );
                                warn!(
                                    alias = %node.alias,
                                    error = %catch_err,
                                    "catch branch failed"
                                );
                            }
                        }
                    }
                }
            }
        }

        // `finally` runs exactly once, whatever happened above.
        if let Some(finally) = &config.finally_branch {
            if let Err(finally_err) = self.execute_target(finally, vars).await {
                let _ = self.memory.record_event(
                    &handle,
                    EventKind::Error,
                    json!({"phase": "finally", "error": finally_err.to_string()}),
                );
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        duration_ms: started.elapsed().as_millis() as u64,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Failed,
                )?;
                return Err(finally_err);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match pending {
            None => {
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        result: json!({"recovered": recovered}),
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Completed,
                )?;
                Ok(())
            }
            Some(err) => {
                self.memory.complete(
                    &handle,
                    StepOutputs {
                        duration_ms,
                        ..StepOutputs::default()
                    },
                    ArtifactStatus::Failed,
                )?;
                Err(err)
            }
        }
    }

    /// Execute a branch target's nodes in declaration order.
    async fn execute_target(
        &self,
        target: &BranchTarget,
        vars: &mut VarStore,
    ) -> Result<(), EngineError> {
        let nodes = self.store.list_nodes(&self.workflow).await?;
        let alias_index = validate::alias_positions(&nodes);
        let positions = validate::target_positions(target, &alias_index)
            .map_err(EngineError::Internal)?;
        self.run_body(&positions, vars).await
    }

    fn begin_artifact(
        &self,
        node: &Node,
        action_index: u32,
        resolved_config: &Value,
        vars: &VarStore,
        secret_values: &[String],
    ) -> Result<StepHandle, EngineError> {
        let mut config_snapshot = resolved_config.clone();
        mask_secrets(&mut config_snapshot, secret_values);
        let mut variables = Value::Object(vars.snapshot());
        mask_secrets(&mut variables, secret_values);

        let forwarding = forwarding_from(&node.config);
        let handle = self.memory.begin(
            &node.id,
            action_index,
            InputsSnapshot {
                resolved_config: config_snapshot,
                variables,
                environment: json!({
                    "session": self.session.to_string(),
                    "node_type": node.node_type.as_str(),
                    "position": node.position,
                }),
            },
            forwarding,
        )?;
        Ok(handle)
    }

    fn record_outcome_events(
        &self,
        handle: &StepHandle,
        outcome: &StepOutcome,
        secret_values: &[String],
    ) {
        for event in &outcome.events {
            let kind = match event.kind {
                StepEventKind::Reasoner => EventKind::ReasonerCall,
                StepEventKind::Browser => EventKind::BrowserEvent,
                StepEventKind::Error => EventKind::Error,
            };
            let mut payload = event.payload.clone();
            mask_secrets(&mut payload, secret_values);
            if let Err(err) = self.memory.record_event(handle, kind, payload) {
                warn!(error = %err, "failed to record processing event");
            }
        }
    }

    fn record_error(&self, handle: &StepHandle, message: &str, secret_values: &[String]) {
        let mut payload = json!({"error": message});
        mask_secrets(&mut payload, secret_values);
        if let Err(err) = self.memory.record_event(handle, EventKind::Error, payload) {
            warn!(error = %err, "failed to record error event");
        }
    }

    /// Merge a step's result into the store under the node's declared
    /// output key (or the executor's default). Returns the state delta
    /// for the artifact.
    fn merge_output(
        &self,
        node: &Node,
        default_key: &str,
        outcome: &StepOutcome,
        vars: &mut VarStore,
    ) -> Value {
        let Some(result) = &outcome.result else {
            return Value::Null;
        };
        let key = node
            .config
            .get("output_key")
            .and_then(Value::as_str)
            .unwrap_or(default_key)
            .to_string();
        vars.set(key.clone(), result.clone());
        json!({ key: result })
    }

    /// Reserve `count` consecutive action indices for a node, so the
    /// (node, action index) artifact key stays unique when the same
    /// node runs more than once.
    fn claim_action_indices(&self, node_id: &NodeId, count: u32) -> u32 {
        let mut counters = self.action_counters.lock();
        let counter = counters.entry(node_id.0.clone()).or_insert(0);
        let base = *counter;
        *counter += count.max(1);
        base
    }
}

fn timeout_for(node: &Node, resolved_config: &Value) -> Duration {
    resolved_config
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or_else(|| default_timeout(node.node_type))
}

fn forwarding_from(config: &Value) -> ForwardingRules {
    let keys = |name: &str| -> Vec<String> {
        config
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    ForwardingRules {
        forward: keys("forward"),
        loop_local: keys("loop_local"),
        aggregate: keys("aggregate"),
    }
}
