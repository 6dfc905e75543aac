//! Loop-body resolution: expands an iterate node's declarative body
//! specification (add/remove/reorder operations over positions,
//! aliases, and ranges) into a concrete, ordered list of child
//! positions, and stamps each ordinary child with a parent
//! back-reference.
//!
//! Resolution is a pure function of (current specification, current
//! registry): re-running it after an unrelated change is deterministic
//! and idempotent. Unresolvable references are warnings in the report,
//! never fatal; the node they name is simply omitted from the body.

use flowmill_core_types::{NodeType, WorkflowId};
use flowmill_registry::{BodyPatch, BodyRef, BodySpec, Node, NodeRef, NodeStore, RegistryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Resolver errors. Note that reference mismatches are *not* errors;
/// they land in the report as warnings.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("node at position {position} is {node_type}, not an iterate node")]
    NotIterate { position: u32, node_type: NodeType },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
}

/// A spec entry that matched, with the positions it contributed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedEntry {
    pub entry: BodyRef,
    pub positions: Vec<u32>,
}

/// Why a spec entry (or part of one) was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionWarning {
    UnknownAlias { alias: String },
    AmbiguousAlias { alias: String },
    OutOfRange { position: u32 },
    EmptyRange { from: u32, to: u32 },
    SelfReference { position: u32 },
}

/// Diagnostic record of how a body was computed. Advisory state: the
/// resolved position list is what execution trusts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub matched: Vec<MatchedEntry>,
    pub warnings: Vec<ResolutionWarning>,
    pub final_order: Vec<u32>,
}

/// Resolver output.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub body_positions: Vec<u32>,
    pub report: ResolutionReport,
}

/// Resolve an iterate node's body, applying `patches` to its stored
/// specification first.
///
/// The patched specification is persisted *before* resolution so the
/// stored spec and the resolved body can never disagree after a crash
/// in between. Every resolved ordinary child gets
/// `parent_position = iterate_position`; `group` nodes keep their own
/// grouping semantics and are not re-parented.
pub async fn resolve(
    store: &dyn NodeStore,
    workflow: &WorkflowId,
    iterate_position: u32,
    patches: &[BodyPatch],
) -> Result<Resolution, ResolveError> {
    let iterate = store
        .get_node(workflow, &NodeRef::Position(iterate_position))
        .await?;
    if iterate.node_type != NodeType::Iterate {
        return Err(ResolveError::NotIterate {
            position: iterate_position,
            node_type: iterate.node_type,
        });
    }

    let mut spec = iterate.body.unwrap_or_default();
    apply_patches(&mut spec, patches);
    store
        .set_body_spec(workflow, iterate_position, spec.clone())
        .await?;

    let nodes = store.list_nodes(workflow).await?;
    let mut report = ResolutionReport::default();
    let mut positions: Vec<u32> = Vec::new();

    for entry in &spec.entries {
        let matched = resolve_entry(entry, &nodes, iterate_position, &mut report.warnings);
        if !matched.is_empty() {
            for position in &matched {
                if !positions.contains(position) {
                    positions.push(*position);
                }
            }
        }
        report.matched.push(MatchedEntry {
            entry: entry.clone(),
            positions: matched,
        });
    }

    positions.sort_unstable();

    if let Some(order) = &spec.order {
        let mut explicit: Vec<u32> = Vec::new();
        for entry in order {
            for position in resolve_entry(entry, &nodes, iterate_position, &mut report.warnings) {
                if positions.contains(&position) && !explicit.contains(&position) {
                    explicit.push(position);
                }
            }
        }
        // Members the reorder did not mention keep ascending order at
        // the tail.
        for position in &positions {
            if !explicit.contains(position) {
                explicit.push(*position);
            }
        }
        positions = explicit;
    }

    report.final_order = positions.clone();

    for position in &positions {
        let child = store
            .get_node(workflow, &NodeRef::Position(*position))
            .await?;
        if child.node_type == NodeType::Group {
            debug!(position, "group node joins body without re-parenting");
            continue;
        }
        if child.parent_position != Some(iterate_position) {
            store
                .set_parent(workflow, *position, Some(iterate_position))
                .await?;
        }
    }

    store
        .set_resolved_body(
            workflow,
            iterate_position,
            positions.clone(),
            serde_json::to_value(&report)?,
        )
        .await?;

    debug!(
        iterate_position,
        body = ?positions,
        warnings = report.warnings.len(),
        "body resolved"
    );

    Ok(Resolution {
        body_positions: positions,
        report,
    })
}

fn apply_patches(spec: &mut BodySpec, patches: &[BodyPatch]) {
    for patch in patches {
        match patch {
            BodyPatch::Add { entry } => {
                if !spec.entries.contains(entry) {
                    spec.entries.push(entry.clone());
                }
            }
            BodyPatch::Remove { entry } => {
                spec.entries.retain(|existing| existing != entry);
            }
            BodyPatch::Reorder { order } => {
                spec.order = Some(order.clone());
            }
        }
    }
}

fn resolve_entry(
    entry: &BodyRef,
    nodes: &[Node],
    iterate_position: u32,
    warnings: &mut Vec<ResolutionWarning>,
) -> Vec<u32> {
    match entry {
        BodyRef::Position(position) => {
            if *position == iterate_position {
                warn_once(warnings, ResolutionWarning::SelfReference { position: *position });
                Vec::new()
            } else if nodes.iter().any(|node| node.position == *position) {
                vec![*position]
            } else {
                warn_once(warnings, ResolutionWarning::OutOfRange { position: *position });
                Vec::new()
            }
        }
        BodyRef::Alias(alias) => {
            let mut matches = nodes.iter().filter(|node| node.alias == *alias);
            match (matches.next(), matches.next()) {
                (Some(node), None) => {
                    if node.position == iterate_position {
                        warn_once(
                            warnings,
                            ResolutionWarning::SelfReference {
                                position: node.position,
                            },
                        );
                        Vec::new()
                    } else {
                        vec![node.position]
                    }
                }
                (Some(_), Some(_)) => {
                    warn_once(
                        warnings,
                        ResolutionWarning::AmbiguousAlias {
                            alias: alias.clone(),
                        },
                    );
                    Vec::new()
                }
                (None, _) => {
                    warn_once(
                        warnings,
                        ResolutionWarning::UnknownAlias {
                            alias: alias.clone(),
                        },
                    );
                    Vec::new()
                }
            }
        }
        BodyRef::Range { from, to } => {
            let mut matched: Vec<u32> = nodes
                .iter()
                .map(|node| node.position)
                .filter(|position| *position >= *from && *position <= *to)
                .filter(|position| {
                    if *position == iterate_position {
                        warn_once(
                            warnings,
                            ResolutionWarning::SelfReference {
                                position: *position,
                            },
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect();
            matched.sort_unstable();
            if matched.is_empty() {
                warn_once(warnings, ResolutionWarning::EmptyRange { from: *from, to: *to });
            }
            matched
        }
    }
}

fn warn_once(warnings: &mut Vec<ResolutionWarning>, warning: ResolutionWarning) {
    if !warnings.contains(&warning) {
        warn!(?warning, "body spec entry rejected");
        warnings.push(warning);
    }
}
