//! Pre-flight workflow validation. Runs before any side effect; a
//! failure here is fatal to the run start.

use std::collections::{HashMap, HashSet};

use flowmill_core_types::NodeType;
use flowmill_registry::Node;
use serde_json::Value;
use step_primitives::ExecutorSet;
use tracing::debug;

use crate::control::{BranchTarget, HandleConfig, IterateConfig, RouteConfig};
use crate::errors::EngineError;

fn config_error(node: &Node, message: impl Into<String>) -> EngineError {
    EngineError::Configuration {
        node: node.alias.clone(),
        message: message.into(),
    }
}

/// Validate every node of a workflow against its type's rules.
///
/// Catches: node types without a registered executor, malformed
/// primitive configurations (including ai-query/cognition without a
/// declared shape), iterate nodes without a source or body, route
/// nodes without branches, handle nodes without a `try`, and branch
/// references that name no node.
pub fn validate_workflow(nodes: &[Node], executors: &ExecutorSet) -> Result<(), EngineError> {
    let alias_index = alias_positions(nodes);
    let positions: HashSet<u32> = nodes.iter().map(|n| n.position).collect();

    for node in nodes {
        match node.node_type {
            NodeType::Iterate => {
                let config: IterateConfig = serde_json::from_value(node.config.clone())
                    .map_err(|err| config_error(node, format!("iterate: {err}")))?;
                if config.source.trim().is_empty() {
                    return Err(config_error(node, "iterate: source cannot be empty"));
                }
                if node.body.is_none() && node.resolved_body.is_none() {
                    return Err(config_error(
                        node,
                        "iterate: neither a body specification nor a resolved body is present",
                    ));
                }
            }
            NodeType::Route => {
                let config: RouteConfig = serde_json::from_value(node.config.clone())
                    .map_err(|err| config_error(node, format!("route: {err}")))?;
                let has_cases = config.value.is_some() && !config.cases.is_empty();
                if !has_cases && config.conditions.is_empty() {
                    return Err(config_error(
                        node,
                        "route: needs a value with cases, or a condition list",
                    ));
                }
                for (case, target) in &config.cases {
                    let target: BranchTarget = serde_json::from_value(target.clone())
                        .map_err(|err| {
                            config_error(node, format!("route case '{case}': {err}"))
                        })?;
                    check_target(node, &target, &alias_index, &positions)?;
                }
                for condition in &config.conditions {
                    check_target(node, &condition.target, &alias_index, &positions)?;
                }
                if let Some(default) = &config.default {
                    check_target(node, default, &alias_index, &positions)?;
                }
            }
            NodeType::Handle => {
                let config: HandleConfig = serde_json::from_value(node.config.clone())
                    .map_err(|err| config_error(node, format!("handle: {err}")))?;
                check_target(node, &config.try_branch, &alias_index, &positions)?;
                if let Some(catch) = &config.catch_branch {
                    check_target(node, catch, &alias_index, &positions)?;
                }
                if let Some(finally) = &config.finally_branch {
                    check_target(node, finally, &alias_index, &positions)?;
                }
            }
            NodeType::Group => {}
            primitive => {
                let executor = executors.get(primitive).ok_or_else(|| {
                    config_error(node, format!("no executor registered for '{primitive}'"))
                })?;
                executor
                    .validate(&node.config)
                    .map_err(|err| config_error(node, err.to_string()))?;
            }
        }
    }

    debug!(nodes = nodes.len(), "workflow validated");
    Ok(())
}

/// Positions referenced as route/handle branch targets. These nodes
/// run only when their branch is taken, never in the top-level
/// position walk.
pub fn branch_targets(nodes: &[Node]) -> Result<HashSet<u32>, EngineError> {
    let alias_index = alias_positions(nodes);
    let mut targets = HashSet::new();

    for node in nodes {
        match node.node_type {
            NodeType::Route => {
                let Ok(config) = serde_json::from_value::<RouteConfig>(node.config.clone()) else {
                    continue;
                };
                for target in config.cases.values() {
                    if let Ok(target) = serde_json::from_value::<BranchTarget>(target.clone()) {
                        collect_positions(&target, &alias_index, &mut targets);
                    }
                }
                for condition in &config.conditions {
                    collect_positions(&condition.target, &alias_index, &mut targets);
                }
                if let Some(default) = &config.default {
                    collect_positions(default, &alias_index, &mut targets);
                }
            }
            NodeType::Handle => {
                let Ok(config) = serde_json::from_value::<HandleConfig>(node.config.clone()) else {
                    continue;
                };
                collect_positions(&config.try_branch, &alias_index, &mut targets);
                if let Some(catch) = &config.catch_branch {
                    collect_positions(catch, &alias_index, &mut targets);
                }
                if let Some(finally) = &config.finally_branch {
                    collect_positions(finally, &alias_index, &mut targets);
                }
            }
            _ => {}
        }
    }

    Ok(targets)
}

/// Flatten a branch target into concrete positions, in declaration
/// order.
pub fn target_positions(
    target: &BranchTarget,
    alias_index: &HashMap<String, u32>,
) -> Result<Vec<u32>, String> {
    match target {
        BranchTarget::Position(p) => Ok(vec![*p]),
        BranchTarget::Alias(alias) => alias_index
            .get(alias)
            .map(|p| vec![*p])
            .ok_or_else(|| format!("branch target alias '{alias}' names no node")),
        BranchTarget::Sequence(parts) => {
            let mut out = Vec::new();
            for part in parts {
                out.extend(target_positions(part, alias_index)?);
            }
            Ok(out)
        }
    }
}

pub fn alias_positions(nodes: &[Node]) -> HashMap<String, u32> {
    nodes
        .iter()
        .map(|n| (n.alias.clone(), n.position))
        .collect()
}

fn check_target(
    node: &Node,
    target: &BranchTarget,
    alias_index: &HashMap<String, u32>,
    positions: &HashSet<u32>,
) -> Result<(), EngineError> {
    let resolved =
        target_positions(target, alias_index).map_err(|message| config_error(node, message))?;
    for position in resolved {
        if !positions.contains(&position) {
            return Err(config_error(
                node,
                format!("branch target position {position} names no node"),
            ));
        }
    }
    Ok(())
}

fn collect_positions(
    target: &BranchTarget,
    alias_index: &HashMap<String, u32>,
    out: &mut HashSet<u32>,
) {
    if let Ok(positions) = target_positions(target, alias_index) {
        out.extend(positions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmill_registry::{BodyRef, BodySpec};
    use serde_json::json;

    fn standard() -> ExecutorSet {
        ExecutorSet::standard()
    }

    #[test]
    fn ai_query_without_shape_is_rejected_before_execution() {
        let nodes = vec![Node::new(1, NodeType::AiQuery, "read-rows")
            .with_config(json!({"instruction": "read the table"}))];
        let err = validate_workflow(&nodes, &standard()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
        assert_eq!(err.origin_node(), Some("read-rows"));
    }

    #[test]
    fn cognition_without_shape_is_rejected() {
        let nodes = vec![Node::new(1, NodeType::Cognition, "decide")
            .with_config(json!({"prompt": "is it done?"}))];
        assert!(validate_workflow(&nodes, &standard()).is_err());
    }

    #[test]
    fn route_without_branches_is_rejected() {
        let nodes =
            vec![Node::new(1, NodeType::Route, "decide").with_config(json!({"value": "{{x}}"}))];
        let err = validate_workflow(&nodes, &standard()).unwrap_err();
        assert!(err.to_string().contains("route"));
    }

    #[test]
    fn branch_target_must_name_a_node() {
        let nodes = vec![
            Node::new(1, NodeType::Route, "decide").with_config(json!({
                "value": "{{x}}",
                "cases": {"yes": 9}
            })),
        ];
        let err = validate_workflow(&nodes, &standard()).unwrap_err();
        assert!(err.to_string().contains("position 9"));
    }

    #[test]
    fn iterate_without_body_is_rejected() {
        let nodes = vec![Node::new(1, NodeType::Iterate, "per-row")
            .with_config(json!({"source": "{{rows}}"}))];
        assert!(validate_workflow(&nodes, &standard()).is_err());
    }

    #[test]
    fn well_formed_workflow_passes_and_targets_are_collected() {
        let nodes = vec![
            Node::new(1, NodeType::Route, "decide").with_config(json!({
                "value": "{{verdict}}",
                "cases": {"yes": "mark-done", "no": 3},
                "default": 3
            })),
            Node::new(2, NodeType::Context, "mark-done")
                .with_config(json!({"op": "set", "key": "done", "value": true})),
            Node::new(3, NodeType::Context, "mark-open")
                .with_config(json!({"op": "set", "key": "done", "value": false})),
            Node::new(4, NodeType::Iterate, "per-row")
                .with_config(json!({"source": "{{rows}}"}))
                .with_body(BodySpec::default().with_entry(BodyRef::Position(2))),
        ];
        validate_workflow(&nodes, &standard()).unwrap();

        let targets = branch_targets(&nodes).unwrap();
        assert!(targets.contains(&2));
        assert!(targets.contains(&3));
        assert!(!targets.contains(&1));
    }
}
