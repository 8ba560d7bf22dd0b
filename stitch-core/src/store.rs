use crate::events::RunEvent;
use crate::types::{
    CompletionLabel, Flow, FlowVersion, NodeId, NodeState, NodeStatus, Run, RunStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Result of a compare-and-set node-state update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The expectation did not hold; nothing was written. `current` is the
    /// status found (`None` when the node has no state yet).
    Conflict { current: Option<NodeStatus> },
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Persistence trait for flows, versions, runs, and entity relocation.
///
/// The engine and edge walker operate exclusively through this trait. The
/// run row is the only shared resource: node-state writes are atomic per
/// `(run_id, node_id)`, and `update_node_states` is the single multi-key
/// write (splitter fan-out). Backends are pluggable; `MemoryStore` is the
/// in-process reference implementation.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Flows ──

    async fn save_flow(&self, flow: &Flow) -> Result<()>;
    async fn load_flow(&self, id: Uuid) -> Result<Option<Flow>>;
    async fn set_current_version(&self, flow_id: Uuid, version_id: Uuid) -> Result<()>;

    // ── Versions (immutable once referenced by a run) ──

    async fn save_version(&self, version: &FlowVersion) -> Result<()>;
    async fn load_version(&self, id: Uuid) -> Result<Option<FlowVersion>>;

    // ── Runs ──

    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, id: Uuid) -> Result<Option<Run>>;
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()>;

    // ── Node state ──

    /// Compare-and-set on one node's state. When `expect` is set, the
    /// write applies only if the current status equals it; a node with no
    /// state yet counts as `pending`. `expect: None` writes
    /// unconditionally.
    async fn update_node_state(
        &self,
        run_id: Uuid,
        node_id: &str,
        state: NodeState,
        expect: Option<NodeStatus>,
    ) -> Result<CasOutcome>;

    /// Atomic multi-key write — all states land in one store mutation.
    async fn update_node_states(
        &self,
        run_id: Uuid,
        states: BTreeMap<NodeId, NodeState>,
    ) -> Result<()>;

    // ── Entities ──

    /// Relocate an entity to a section and record a `node_arrival` journey
    /// event, atomically. `set_entity_type` reclassifies the entity.
    async fn move_entity_to_section(
        &self,
        entity_id: Uuid,
        section_id: Uuid,
        complete_as: CompletionLabel,
        meta: Value,
        set_entity_type: Option<String>,
    ) -> Result<()>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64>;
    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RunEvent)>>;
}
