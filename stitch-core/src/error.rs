use crate::types::{NodeId, NodeStatus};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Compile-time graph validation errors. The compiler accumulates every
/// violation before returning; it never bails on the first.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all_fields = "camelCase")]
pub enum ValidationError {
    #[error("cycle detected through nodes [{}]", .nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("edge '{edge}' references unknown node '{node}'")]
    EdgeEndpoint { edge: String, node: NodeId },

    #[error("node '{node}': required input '{input}' has no incoming mapping and no default")]
    MissingRequiredInput { node: NodeId, input: String },

    #[error("worker node '{node}' has no dispatch route (workerType '{}' unregistered, no webhookUrl)",
            .worker_type.as_deref().unwrap_or("<unset>"))]
    UnknownWorkerType {
        node: NodeId,
        worker_type: Option<String>,
    },

    #[error("node id '{node}' ends in the reserved parallel-instance suffix '_<digits>'")]
    ReservedNodeId { node: NodeId },
}

/// Typed engine surface errors. The server maps these onto HTTP statuses;
/// store plumbing failures ride through the `Store` variant.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow not found: {0}")]
    FlowNotFound(Uuid),

    #[error("flow '{0}' has no current version")]
    NoCurrentVersion(Uuid),

    #[error("flow version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("node '{0}' not found in flow")]
    NodeNotFound(NodeId),

    #[error("node '{0}' has no state in this run")]
    NodeStateNotFound(NodeId),

    #[error("node '{node}' is a {kind} node, expected {expected}")]
    WrongNodeKind {
        node: NodeId,
        kind: &'static str,
        expected: &'static str,
    },

    /// A compare-and-set lost: the node is not in the state the operation
    /// requires. Surfaces as HTTP 409 on the callback endpoint.
    #[error("node '{node}' is {current:?}, expected {expected:?}")]
    InvalidTransition {
        node: NodeId,
        current: Option<NodeStatus>,
        expected: NodeStatus,
    },

    #[error("graph validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_error_display_names_cycle_nodes() {
        let err = ValidationError::Cycle {
            nodes: vec!["A".into(), "B".into(), "C".into()],
        };
        assert_eq!(err.to_string(), "cycle detected through nodes [A, B, C]");
    }

    #[test]
    fn validation_error_serializes_with_code_tag() {
        let err = ValidationError::MissingRequiredInput {
            node: "B".into(),
            input: "prompt".into(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"code": "MissingRequiredInput", "node": "B", "input": "prompt"})
        );
    }

    #[test]
    fn unknown_worker_type_display_handles_unset() {
        let err = ValidationError::UnknownWorkerType {
            node: "W".into(),
            worker_type: None,
        };
        assert!(err.to_string().contains("<unset>"));
    }
}
