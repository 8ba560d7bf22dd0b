use crate::types::{NodeId, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run events — the durable audit trail for every run. Appended through
/// the store; best-effort, never load-bearing for control flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        flow_version_id: Uuid,
    },
    NodeFired {
        node_id: NodeId,
        kind: String,
    },
    /// A UX node parked waiting for user input.
    UserInputRequested {
        node_id: NodeId,
    },
    NodeCompleted {
        node_id: NodeId,
    },
    NodeFailed {
        node_id: NodeId,
        error: String,
    },
    /// Splitter fan-out — one pending state per (downstream, index) pair.
    FanOut {
        splitter_id: NodeId,
        width: usize,
        instances: Vec<NodeId>,
    },
    /// Collector fan-in over its actual parallel predecessor set.
    Merged {
        collector_id: NodeId,
        upstream_count: usize,
    },
    EntityMoved {
        entity_id: Uuid,
        section_id: Uuid,
    },
    /// The run reached its aggregate terminal status.
    RunSettled {
        status: RunStatus,
    },
}
