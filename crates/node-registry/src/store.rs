//! The `NodeStore` interface and its in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use flowmill_core_types::{NodeId, WorkflowId};
use serde_json::Value;
use tracing::warn;

use crate::node::{BodySpec, Node};
use crate::RegistryError;

/// A way of naming a node: by id, position, or alias.
#[derive(Clone, Debug)]
pub enum NodeRef {
    Id(NodeId),
    Position(u32),
    Alias(String),
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Id(id) => write!(f, "id:{id}"),
            NodeRef::Position(p) => write!(f, "position:{p}"),
            NodeRef::Alias(a) => write!(f, "alias:{a}"),
        }
    }
}

/// Narrow persistence interface the engine consumes. Everything the
/// engine writes back (parent stamps, resolved bodies, config patches)
/// goes through here.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_nodes(&self, workflow: &WorkflowId) -> Result<Vec<Node>, RegistryError>;

    async fn get_node(&self, workflow: &WorkflowId, node: &NodeRef) -> Result<Node, RegistryError>;

    /// Shallow-merge a partial object into a node's configuration.
    async fn update_config(
        &self,
        workflow: &WorkflowId,
        node_id: &NodeId,
        partial: Value,
    ) -> Result<(), RegistryError>;

    /// Persist a (patched) body specification on an iterate node.
    async fn set_body_spec(
        &self,
        workflow: &WorkflowId,
        position: u32,
        spec: BodySpec,
    ) -> Result<(), RegistryError>;

    /// Persist the resolved body and its resolution report.
    async fn set_resolved_body(
        &self,
        workflow: &WorkflowId,
        position: u32,
        body: Vec<u32>,
        report: Value,
    ) -> Result<(), RegistryError>;

    /// Stamp or clear a node's parent back-reference.
    async fn set_parent(
        &self,
        workflow: &WorkflowId,
        position: u32,
        parent: Option<u32>,
    ) -> Result<(), RegistryError>;
}

/// In-memory store, one entry per workflow.
#[derive(Default)]
pub struct InMemoryNodeStore {
    inner: DashMap<String, Vec<Node>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow's nodes. Positions must be unique; duplicate
    /// aliases are tolerated here (the resolver reports them as
    /// warnings) but logged.
    pub fn insert_workflow(
        &self,
        workflow: &WorkflowId,
        nodes: Vec<Node>,
    ) -> Result<(), RegistryError> {
        let mut seen_positions = std::collections::HashSet::new();
        let mut seen_aliases = std::collections::HashSet::new();
        for node in &nodes {
            if !seen_positions.insert(node.position) {
                return Err(RegistryError::DuplicatePosition(node.position));
            }
            if !seen_aliases.insert(node.alias.clone()) {
                warn!(workflow = %workflow, alias = %node.alias, "duplicate alias in workflow");
            }
        }
        let mut sorted = nodes;
        sorted.sort_by_key(|node| node.position);
        self.inner.insert(workflow.0.clone(), sorted);
        Ok(())
    }

    fn with_nodes<R>(
        &self,
        workflow: &WorkflowId,
        f: impl FnOnce(&mut Vec<Node>) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let mut entry = self
            .inner
            .get_mut(&workflow.0)
            .ok_or_else(|| RegistryError::WorkflowNotFound(workflow.0.clone()))?;
        f(entry.value_mut())
    }

    fn node_at_mut<'a>(
        nodes: &'a mut [Node],
        position: u32,
    ) -> Result<&'a mut Node, RegistryError> {
        nodes
            .iter_mut()
            .find(|node| node.position == position)
            .ok_or_else(|| RegistryError::NodeNotFound(format!("position:{position}")))
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn list_nodes(&self, workflow: &WorkflowId) -> Result<Vec<Node>, RegistryError> {
        self.inner
            .get(&workflow.0)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::WorkflowNotFound(workflow.0.clone()))
    }

    async fn get_node(&self, workflow: &WorkflowId, node: &NodeRef) -> Result<Node, RegistryError> {
        let nodes = self
            .inner
            .get(&workflow.0)
            .ok_or_else(|| RegistryError::WorkflowNotFound(workflow.0.clone()))?;

        match node {
            NodeRef::Id(id) => nodes
                .iter()
                .find(|n| n.id == *id)
                .cloned()
                .ok_or_else(|| RegistryError::NodeNotFound(node.to_string())),
            NodeRef::Position(position) => nodes
                .iter()
                .find(|n| n.position == *position)
                .cloned()
                .ok_or_else(|| RegistryError::NodeNotFound(node.to_string())),
            NodeRef::Alias(alias) => {
                let mut matches = nodes.iter().filter(|n| n.alias == *alias);
                let first = matches
                    .next()
                    .cloned()
                    .ok_or_else(|| RegistryError::NodeNotFound(node.to_string()))?;
                if matches.next().is_some() {
                    return Err(RegistryError::AmbiguousAlias(alias.clone()));
                }
                Ok(first)
            }
        }
    }

    async fn update_config(
        &self,
        workflow: &WorkflowId,
        node_id: &NodeId,
        partial: Value,
    ) -> Result<(), RegistryError> {
        self.with_nodes(workflow, |nodes| {
            let node = nodes
                .iter_mut()
                .find(|n| n.id == *node_id)
                .ok_or_else(|| RegistryError::NodeNotFound(format!("id:{node_id}")))?;
            match (&mut node.config, partial) {
                (Value::Object(existing), Value::Object(incoming)) => {
                    for (key, value) in incoming {
                        existing.insert(key, value);
                    }
                }
                (config, incoming) => *config = incoming,
            }
            Ok(())
        })
    }

    async fn set_body_spec(
        &self,
        workflow: &WorkflowId,
        position: u32,
        spec: BodySpec,
    ) -> Result<(), RegistryError> {
        self.with_nodes(workflow, |nodes| {
            Self::node_at_mut(nodes, position)?.body = Some(spec);
            Ok(())
        })
    }

    async fn set_resolved_body(
        &self,
        workflow: &WorkflowId,
        position: u32,
        body: Vec<u32>,
        report: Value,
    ) -> Result<(), RegistryError> {
        self.with_nodes(workflow, |nodes| {
            let node = Self::node_at_mut(nodes, position)?;
            node.resolved_body = Some(body);
            node.resolution_report = Some(report);
            Ok(())
        })
    }

    async fn set_parent(
        &self,
        workflow: &WorkflowId,
        position: u32,
        parent: Option<u32>,
    ) -> Result<(), RegistryError> {
        self.with_nodes(workflow, |nodes| {
            Self::node_at_mut(nodes, position)?.parent_position = parent;
            Ok(())
        })
    }
}
