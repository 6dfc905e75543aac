//! End-to-end interpreter tests against the scripted drivers.

use std::sync::Arc;

use flow_engine::{ErrorKind, RunOptions, Runtime};
use flowmill_core_types::{NodeType, RunStatus, WorkflowId};
use flowmill_registry::{BodyRef, BodySpec, InMemoryNodeStore, Node};
use serde_json::{json, Value};
use step_memory::ArtifactStatus;
use step_primitives::mock::{ScriptedBrowser, ScriptedReasoner};
use step_primitives::StaticSecretProvider;

fn setup(nodes: Vec<Node>) -> (Runtime, WorkflowId) {
    let store = InMemoryNodeStore::new();
    let workflow = WorkflowId::from("wf-test");
    store.insert_workflow(&workflow, nodes).unwrap();
    (Runtime::new(Arc::new(store)), workflow)
}

fn browser() -> Arc<ScriptedBrowser> {
    Arc::new(ScriptedBrowser::new())
}

fn reasoner() -> Arc<ScriptedReasoner> {
    Arc::new(ScriptedReasoner::new())
}

#[tokio::test]
async fn mailbox_to_rows_end_to_end() {
    let nodes = vec![
        Node::new(1, NodeType::BrowserAction, "open-inbox")
            .with_config(json!({"action": "navigate", "url": "https://mail.test/inbox"})),
        Node::new(2, NodeType::AiQuery, "read-emails").with_config(json!({
            "instruction": "list every email subject and sender",
            "shape": {"type": "array", "items": {"type": "object"}},
            "output_key": "emails"
        })),
        Node::new(3, NodeType::Iterate, "per-email")
            .with_config(json!({
                "source": "{{emails}}",
                "aggregate": ["subject"]
            }))
            .with_body(BodySpec::default().with_entry(BodyRef::Position(4))),
        Node::new(4, NodeType::Transform, "pick-subject").with_config(json!({
            "function": "pick",
            "inputs": ["item"],
            "args": ["subject"],
            "output_key": "subject"
        })),
    ];
    let (runtime, workflow) = setup(nodes);

    let browser = Arc::new(ScriptedBrowser::new().with_extract_result(json!([
        {"subject": "Invoice 42", "sender": "billing@x.test"},
        {"subject": "Weekly digest", "sender": "news@y.test"}
    ])));

    let state = runtime
        .run_to_completion(workflow, browser.clone(), reasoner(), RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    assert_eq!(browser.current_url(), "https://mail.test/inbox");
    assert_eq!(
        state.variables["subject"],
        json!(["Invoice 42", "Weekly digest"])
    );
    // Loop-local bindings never leak to the global scope.
    assert!(state.variables.get("item").is_none());
    assert!(state.variables.get("index").is_none());
}

#[tokio::test]
async fn continue_on_error_records_every_iteration() {
    let nodes = vec![
        Node::new(1, NodeType::Iterate, "per-row")
            .with_config(json!({
                "source": "{{rows}}",
                "continue_on_error": true
            }))
            .with_body(BodySpec::default().with_entry(BodyRef::Position(2))),
        // Clicks a selector the scripted browser does not know, so
        // every iteration fails.
        Node::new(2, NodeType::BrowserAction, "click-row")
            .with_config(json!({"action": "click", "selector": "#missing"})),
    ];
    let iterate_id = nodes[0].id.clone();
    let (runtime, workflow) = setup(nodes);

    let handle = runtime.start_run(
        workflow,
        browser(),
        reasoner(),
        RunOptions::new().with_var("rows", json!([1, 2, 3])),
    );
    let state = handle.wait().await;

    // The loop swallowed the failures and the run completed.
    assert_eq!(state.status, RunStatus::Completed);

    let artifacts = handle.memory().artifacts_for(&iterate_id);
    assert_eq!(artifacts.len(), 3);
    assert!(artifacts
        .iter()
        .all(|a| a.status == ArtifactStatus::Failed));
}

#[tokio::test]
async fn iterate_without_continue_on_error_fails_but_keeps_completed_effects() {
    let nodes = vec![
        Node::new(1, NodeType::Iterate, "per-row")
            .with_config(json!({
                "source": "{{rows}}",
                "aggregate": ["seen"]
            }))
            .with_body(
                BodySpec::default()
                    .with_entry(BodyRef::Position(2))
                    .with_entry(BodyRef::Position(3)),
            ),
        Node::new(2, NodeType::Context, "note")
            .with_config(json!({"op": "set", "key": "seen", "value": "{{item}}"})),
        // Fails only on the value "bad".
        Node::new(3, NodeType::Route, "guard").with_config(json!({
            "value": "{{item}}",
            "cases": {"good": 4}
        })),
        Node::new(4, NodeType::Context, "ok")
            .with_config(json!({"op": "set", "key": "checked", "value": true})),
    ];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            reasoner(),
            RunOptions::new().with_var("rows", json!(["good", "bad", "good"])),
        )
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.expect("terminal failure details");
    assert_eq!(failure.kind, ErrorKind::Routing);
    // The first iteration completed and its aggregate survives; the
    // failed one contributed nothing.
    assert_eq!(state.variables["seen"], json!(["good"]));
}

#[tokio::test]
async fn route_takes_exactly_one_branch() {
    let nodes = vec![
        Node::new(1, NodeType::Route, "triage").with_config(json!({
            "value": "{{verdict}}",
            "cases": {"yes": 2, "no": 3}
        })),
        Node::new(2, NodeType::Cognition, "on-yes")
            .with_config(json!({"prompt": "yes path", "shape": {"type": "any"}})),
        Node::new(3, NodeType::Cognition, "on-no")
            .with_config(json!({"prompt": "no path", "shape": {"type": "any"}})),
    ];
    let (runtime, workflow) = setup(nodes);

    let llm = reasoner();
    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            llm.clone(),
            RunOptions::new().with_var("verdict", json!("no")),
        )
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    // Exactly one branch ran, and it was the matching one.
    assert_eq!(llm.prompts(), vec!["no path"]);
}

#[tokio::test]
async fn route_without_match_or_default_is_a_routing_error() {
    let nodes = vec![
        Node::new(1, NodeType::Route, "triage").with_config(json!({
            "value": "{{verdict}}",
            "cases": {"yes": 2, "no": 2}
        })),
        Node::new(2, NodeType::Context, "noop")
            .with_config(json!({"op": "set", "key": "x", "value": 1})),
    ];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            reasoner(),
            RunOptions::new().with_var("verdict", json!("maybe")),
        )
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Routing);
    assert_eq!(failure.node.as_deref(), Some("triage"));
}

#[tokio::test]
async fn route_conditions_take_the_first_match_in_order() {
    let nodes = vec![
        Node::new(1, NodeType::Route, "grade").with_config(json!({
            "conditions": [
                {"path": "score", "op": "gte", "value": 90, "target": 2},
                {"path": "score", "op": "gte", "value": 50, "target": 3}
            ],
            "default": 4
        })),
        Node::new(2, NodeType::Cognition, "high")
            .with_config(json!({"prompt": "high", "shape": {"type": "any"}})),
        Node::new(3, NodeType::Cognition, "mid")
            .with_config(json!({"prompt": "mid", "shape": {"type": "any"}})),
        Node::new(4, NodeType::Cognition, "low")
            .with_config(json!({"prompt": "low", "shape": {"type": "any"}})),
    ];
    let (runtime, workflow) = setup(nodes);

    let llm = reasoner();
    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            llm.clone(),
            RunOptions::new().with_var("score", json!(95)),
        )
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    // 95 satisfies both conditions; only the first declared wins.
    assert_eq!(llm.prompts(), vec!["high"]);
}

/// `finally` runs exactly once in all three handle outcomes. The
/// finally branch is a cognition node, so the reasoner call count is
/// the execution count.
#[tokio::test]
async fn handle_runs_finally_exactly_once_when_try_succeeds() {
    let nodes = vec![
        Node::new(1, NodeType::Handle, "boundary").with_config(json!({
            "try": 2,
            "finally": 3
        })),
        Node::new(2, NodeType::Context, "work")
            .with_config(json!({"op": "set", "key": "done", "value": true})),
        Node::new(3, NodeType::Cognition, "cleanup")
            .with_config(json!({"prompt": "finalize", "shape": {"type": "any"}})),
    ];
    let (runtime, workflow) = setup(nodes);

    let llm = reasoner();
    let state = runtime
        .run_to_completion(workflow, browser(), llm.clone(), RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    assert_eq!(llm.prompts(), vec!["finalize"]);
    assert!(state.variables.get("lastError").is_none());
}

#[tokio::test]
async fn handle_runs_catch_then_finally_on_failure() {
    let nodes = vec![
        Node::new(1, NodeType::Handle, "boundary").with_config(json!({
            "try": 2,
            "catch": 3,
            "finally": 4
        })),
        Node::new(2, NodeType::BrowserAction, "broken-click")
            .with_config(json!({"action": "click", "selector": "#nope"})),
        Node::new(3, NodeType::Context, "recover")
            .with_config(json!({"op": "set", "key": "recovered", "value": true})),
        Node::new(4, NodeType::Cognition, "cleanup")
            .with_config(json!({"prompt": "finalize", "shape": {"type": "any"}})),
    ];
    let (runtime, workflow) = setup(nodes);

    let llm = reasoner();
    let state = runtime
        .run_to_completion(workflow, browser(), llm.clone(), RunOptions::new())
        .await;

    // Catch recovered, so the run completes.
    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    assert_eq!(llm.prompts(), vec!["finalize"]);
    assert_eq!(state.variables["recovered"], json!(true));

    // The captured failure is visible to downstream nodes.
    let last_error = &state.variables["lastError"];
    assert!(last_error["message"]
        .as_str()
        .unwrap()
        .contains("element not found"));
    assert_eq!(last_error["node"], json!("broken-click"));
}

#[tokio::test]
async fn handle_reraises_after_finally_when_nothing_recovers() {
    let nodes = vec![
        Node::new(1, NodeType::Handle, "boundary").with_config(json!({
            "try": 2,
            "finally": 3
        })),
        Node::new(2, NodeType::BrowserAction, "broken-click")
            .with_config(json!({"action": "click", "selector": "#nope"})),
        Node::new(3, NodeType::Cognition, "cleanup")
            .with_config(json!({"prompt": "finalize", "shape": {"type": "any"}})),
    ];
    let (runtime, workflow) = setup(nodes);

    let llm = reasoner();
    let state = runtime
        .run_to_completion(workflow, browser(), llm.clone(), RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.failure.unwrap().kind, ErrorKind::Executor);
    // Finally still ran, exactly once.
    assert_eq!(llm.prompts(), vec!["finalize"]);
}

#[tokio::test]
async fn scope_isolation_between_iterations() {
    let nodes = vec![
        Node::new(1, NodeType::Iterate, "per-item")
            .with_config(json!({"source": "{{items}}"}))
            .with_body(
                BodySpec::default()
                    .with_entry(BodyRef::Position(2))
                    .with_entry(BodyRef::Position(3)),
            ),
        // Writes a scratch value into the iteration scope.
        Node::new(2, NodeType::Context, "scratch")
            .with_config(json!({"op": "set", "key": "scratch", "value": "{{item}}"})),
        // `default` sees the previous iteration's value only if scopes
        // leak; with isolation it always falls back.
        Node::new(3, NodeType::Transform, "probe").with_config(json!({
            "function": "default",
            "inputs": [],
            "args": [null, "fresh"],
            "output_key": "probe"
        })),
    ];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            reasoner(),
            RunOptions::new().with_var("items", json!(["a", "b"])),
        )
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    // Neither iteration's scratch value survived the loop.
    assert!(state.variables.get("scratch").is_none());
}

#[tokio::test]
async fn ai_query_without_shape_never_executes() {
    let nodes = vec![Node::new(1, NodeType::AiQuery, "read-rows")
        .with_config(json!({"instruction": "read the table"}))];
    let (runtime, workflow) = setup(nodes);

    let handle = runtime.start_run(workflow, browser(), reasoner(), RunOptions::new());
    let state = handle.wait().await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.failure.unwrap().kind, ErrorKind::Configuration);
    // Validation rejected the workflow before any step began.
    assert!(handle.memory().list().is_empty());
}

#[tokio::test]
async fn per_node_timeout_travels_the_executor_error_path() {
    let nodes = vec![Node::new(1, NodeType::BrowserAction, "long-wait").with_config(json!({
        "action": "wait_duration",
        "ms": 60_000,
        "timeout_ms": 50
    }))];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(workflow, browser(), reasoner(), RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Executor);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test]
async fn cancellation_is_honored_between_nodes() {
    let nodes = vec![
        Node::new(1, NodeType::BrowserAction, "wait-1")
            .with_config(json!({"action": "wait_duration", "ms": 100})),
        Node::new(2, NodeType::BrowserAction, "wait-2")
            .with_config(json!({"action": "wait_duration", "ms": 100})),
        Node::new(3, NodeType::BrowserAction, "wait-3")
            .with_config(json!({"action": "wait_duration", "ms": 100})),
    ];
    let (runtime, workflow) = setup(nodes);

    let handle = runtime.start_run(workflow, browser(), reasoner(), RunOptions::new());
    handle.cancel();
    let state = handle.wait().await;

    assert_eq!(state.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn secrets_are_substituted_but_masked_in_artifacts() {
    let nodes = vec![Node::new(1, NodeType::BrowserAction, "login").with_config(json!({
        "action": "navigate",
        "url": "https://db.test/?key={{secret:API_KEY}}"
    }))];
    let node_id = nodes[0].id.clone();

    let store = InMemoryNodeStore::new();
    let workflow = WorkflowId::from("wf-secret");
    store.insert_workflow(&workflow, nodes).unwrap();
    let runtime = Runtime::new(Arc::new(store)).with_secrets(Arc::new(
        StaticSecretProvider::new().with_secret("API_KEY", "tok-123"),
    ));

    let browser = Arc::new(ScriptedBrowser::new());
    let handle = runtime.start_run(workflow, browser.clone(), reasoner(), RunOptions::new());
    let state = handle.wait().await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    // The driver saw the real value.
    assert!(browser.current_url().contains("tok-123"));

    // The provenance record never does.
    let artifact = handle.memory().get(&node_id, 0).unwrap();
    let serialized = serde_json::to_string(&artifact).unwrap();
    assert!(!serialized.contains("tok-123"));
    assert!(serialized.contains("***"));
}

#[tokio::test]
async fn missing_template_key_is_fatal_with_template_kind() {
    let nodes = vec![Node::new(1, NodeType::BrowserAction, "nav").with_config(json!({
        "action": "navigate",
        "url": "{{unset_url}}"
    }))];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(workflow, browser(), reasoner(), RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Template);
    assert!(failure.message.contains("unset_url"));
}

#[tokio::test]
async fn fenced_cognition_output_lands_as_typed_json() {
    let nodes = vec![Node::new(1, NodeType::Cognition, "empty-check").with_config(json!({
        "prompt": "is the mailbox empty?",
        "shape": {"type": "boolean"},
        "output_key": "mailbox_empty"
    }))];
    let (runtime, workflow) = setup(nodes);

    let llm = Arc::new(ScriptedReasoner::new().with_response("```json\ntrue\n```"));
    let state = runtime
        .run_to_completion(workflow, browser(), llm, RunOptions::new())
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    assert_eq!(state.variables["mailbox_empty"], Value::Bool(true));
}

#[tokio::test]
async fn unresolved_iterate_body_is_resolved_on_entry() {
    let nodes = vec![
        Node::new(1, NodeType::Context, "seed")
            .with_config(json!({"op": "set", "key": "n", "value": 0})),
        Node::new(2, NodeType::Iterate, "loop")
            .with_config(json!({"source": "{{items}}", "aggregate": ["copy"]}))
            .with_body(BodySpec::default().with_entry(
                BodyRef::Range { from: 3, to: 4 },
            )),
        Node::new(3, NodeType::Context, "copy-item")
            .with_config(json!({"op": "set", "key": "copy", "value": "{{item}}"})),
        Node::new(4, NodeType::Context, "mark")
            .with_config(json!({"op": "set", "key": "marked", "value": true})),
    ];
    let (runtime, workflow) = setup(nodes);

    let state = runtime
        .run_to_completion(
            workflow,
            browser(),
            reasoner(),
            RunOptions::new().with_var("items", json!(["x", "y"])),
        )
        .await;

    assert_eq!(state.status, RunStatus::Completed, "{:?}", state.failure);
    // The range 3-4 resolved and both members ran per iteration.
    assert_eq!(state.variables["copy"], json!(["x", "y"]));
    // Body members were re-parented, so they did not also run at the
    // top level, and their scope-local writes did not survive the loop.
    assert!(state.variables.get("marked").is_none());
}
