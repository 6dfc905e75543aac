//! Node model and declarative loop-body specifications.

use flowmill_core_types::{NodeId, NodeType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single declarative step in a workflow graph.
///
/// Created by an external authoring process; the engine only mutates
/// the resolver-owned fields (`parent_position`, `resolved_body`,
/// `resolution_report`) and never deletes nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: NodeId,

    /// Integer position defining default execution order.
    pub position: u32,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Human-readable alias, unique within a workflow, used for
    /// cross-referencing from body specs and route branches.
    pub alias: String,

    /// Type-specific parameters, template tokens unresolved.
    #[serde(default)]
    pub config: Value,

    /// Set when this node is a member of an iterate node's body.
    #[serde(default)]
    pub parent_position: Option<u32>,

    /// Declarative body membership (iterate nodes only).
    #[serde(default)]
    pub body: Option<BodySpec>,

    /// Concrete, ordered body positions (iterate nodes only).
    #[serde(default)]
    pub resolved_body: Option<Vec<u32>>,

    /// Diagnostic record of the last body resolution. Advisory only;
    /// `resolved_body` is authoritative for execution.
    #[serde(default)]
    pub resolution_report: Option<Value>,
}

impl Node {
    pub fn new(position: u32, node_type: NodeType, alias: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            position,
            node_type,
            alias: alias.into(),
            config: Value::Null,
            parent_position: None,
            body: None,
            resolved_body: None,
            resolution_report: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_body(mut self, body: BodySpec) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_parent(mut self, parent_position: u32) -> Self {
        self.parent_position = Some(parent_position);
        self
    }
}

/// A reference to one or more nodes inside a body specification.
///
/// Ranges accept both `{"range": {"from": 3, "to": 4}}` and the
/// authoring shorthand `{"range": "3-4"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "BodyRefRepr")]
pub enum BodyRef {
    /// Explicit node position.
    Position(u32),
    /// Node alias, resolved against the registry at resolution time.
    Alias(String),
    /// Inclusive position range.
    Range { from: u32, to: u32 },
}

impl BodyRef {
    /// Parse the shorthand range form `"3-4"`.
    pub fn parse_range(text: &str) -> Option<Self> {
        let (from, to) = text.split_once('-')?;
        Some(BodyRef::Range {
            from: from.trim().parse().ok()?,
            to: to.trim().parse().ok()?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum BodyRefRepr {
    Position(u32),
    Alias(String),
    Range(RangeRepr),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RangeRepr {
    Bounds { from: u32, to: u32 },
    Shorthand(String),
}

impl TryFrom<BodyRefRepr> for BodyRef {
    type Error = String;

    fn try_from(repr: BodyRefRepr) -> Result<Self, Self::Error> {
        Ok(match repr {
            BodyRefRepr::Position(position) => BodyRef::Position(position),
            BodyRefRepr::Alias(alias) => BodyRef::Alias(alias),
            BodyRefRepr::Range(RangeRepr::Bounds { from, to }) => BodyRef::Range { from, to },
            BodyRefRepr::Range(RangeRepr::Shorthand(text)) => BodyRef::parse_range(&text)
                .ok_or_else(|| format!("invalid range shorthand {text:?}, expected \"from-to\""))?,
        })
    }
}

/// Declarative description of which nodes belong to a loop body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BodySpec {
    #[serde(default)]
    pub entries: Vec<BodyRef>,

    /// Explicit ordering from a reorder operation. When present it
    /// wins over the default ascending position order.
    #[serde(default)]
    pub order: Option<Vec<BodyRef>>,
}

impl BodySpec {
    pub fn with_entry(mut self, entry: BodyRef) -> Self {
        self.entries.push(entry);
        self
    }
}

/// A patch operation over a stored body specification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BodyPatch {
    Add { entry: BodyRef },
    Remove { entry: BodyRef },
    Reorder { order: Vec<BodyRef> },
}
