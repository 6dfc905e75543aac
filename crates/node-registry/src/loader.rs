//! Workflow file loading: a JSON document with an id and a node array.

use std::path::Path;

use flowmill_core_types::WorkflowId;
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::RegistryError;

/// On-disk workflow document.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub id: Option<String>,
    pub nodes: Vec<Node>,
}

/// Load a workflow document from a file path.
pub fn load_workflow_file(path: impl AsRef<Path>) -> Result<(WorkflowId, Vec<Node>), RegistryError> {
    let text = std::fs::read_to_string(path)?;
    load_workflow_str(&text)
}

/// Load a workflow document from JSON text.
pub fn load_workflow_str(text: &str) -> Result<(WorkflowId, Vec<Node>), RegistryError> {
    let file: WorkflowFile = serde_json::from_str(text)?;
    let id = file
        .id
        .map(WorkflowId)
        .unwrap_or_default();
    Ok((id, file.nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmill_core_types::NodeType;

    #[test]
    fn loads_nodes_and_generates_id_when_absent() {
        let (id, nodes) = load_workflow_str(
            r#"{
                "nodes": [
                    {"position": 1, "type": "browser-action", "alias": "open",
                     "config": {"action": "navigate", "url": "https://mail.test"}}
                ]
            }"#,
        )
        .unwrap();
        assert!(!id.0.is_empty());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_type, NodeType::BrowserAction);
    }

    #[test]
    fn loads_iterate_body_with_range_shorthand() {
        let (_, nodes) = load_workflow_str(
            r#"{
                "nodes": [
                    {"position": 2, "type": "iterate", "alias": "per-message",
                     "config": {"source": "{{messages}}"},
                     "body": {"entries": [{"range": "3-4"}]}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            nodes[0].body.as_ref().unwrap().entries,
            vec![crate::BodyRef::Range { from: 3, to: 4 }]
        );
    }

    #[test]
    fn malformed_document_is_a_format_error() {
        let err = load_workflow_str("{\"nodes\": [{\"position\": \"x\"}]}").unwrap_err();
        assert!(matches!(err, RegistryError::Format(_)));
    }
}
