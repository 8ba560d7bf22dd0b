use crate::events::RunEvent;
use crate::store::{CasOutcome, RunStore};
use crate::types::{
    CompletionLabel, Flow, FlowVersion, NodeId, NodeState, NodeStatus, Run, RunStatus,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Snapshot of an entity as the mover left it.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    pub entity_id: Uuid,
    pub section_id: Uuid,
    pub entity_type: Option<String>,
}

/// One `node_arrival` journey event.
#[derive(Clone, Debug, PartialEq)]
pub struct JourneyEvent {
    pub entity_id: Uuid,
    pub section_id: Uuid,
    pub event: String,
    pub complete_as: CompletionLabel,
    pub meta: Value,
}

struct Inner {
    flows: HashMap<Uuid, Flow>,
    versions: HashMap<Uuid, FlowVersion>,
    runs: HashMap<Uuid, Run>,
    entities: HashMap<Uuid, EntityRecord>,
    journeys: Vec<JourneyEvent>,
    events: HashMap<Uuid, Vec<(u64, RunEvent)>>,
    event_seq: HashMap<Uuid, u64>,
}

/// In-memory implementation of `RunStore` for development and tests.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                flows: HashMap::new(),
                versions: HashMap::new(),
                runs: HashMap::new(),
                entities: HashMap::new(),
                journeys: Vec::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
            }),
        }
    }

    /// Test support: the entity as the mover last wrote it.
    pub async fn entity(&self, entity_id: Uuid) -> Option<EntityRecord> {
        let r = self.inner.read().await;
        r.entities.get(&entity_id).cloned()
    }

    /// Test support: every journey event recorded so far.
    pub async fn journey_events(&self) -> Vec<JourneyEvent> {
        let r = self.inner.read().await;
        r.journeys.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    // ── Flows ──

    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        let mut w = self.inner.write().await;
        w.flows.insert(flow.flow_id, flow.clone());
        Ok(())
    }

    async fn load_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let r = self.inner.read().await;
        Ok(r.flows.get(&id).cloned())
    }

    async fn set_current_version(&self, flow_id: Uuid, version_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        let flow = w
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| anyhow!("flow not found: {flow_id}"))?;
        flow.current_version = Some(version_id);
        Ok(())
    }

    // ── Versions ──

    async fn save_version(&self, version: &FlowVersion) -> Result<()> {
        let mut w = self.inner.write().await;
        w.versions.insert(version.version_id, version.clone());
        Ok(())
    }

    async fn load_version(&self, id: Uuid) -> Result<Option<FlowVersion>> {
        let r = self.inner.read().await;
        Ok(r.versions.get(&id).cloned())
    }

    // ── Runs ──

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut w = self.inner.write().await;
        w.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<Run>> {
        let r = self.inner.read().await;
        Ok(r.runs.get(&id).cloned())
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    // ── Node state ──

    async fn update_node_state(
        &self,
        run_id: Uuid,
        node_id: &str,
        state: NodeState,
        expect: Option<NodeStatus>,
    ) -> Result<CasOutcome> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;

        let current = run.node_states.get(node_id).map(|s| s.status);
        if let Some(expected) = expect {
            // A node with no state yet has not been touched — it is pending.
            if current.unwrap_or(NodeStatus::Pending) != expected {
                return Ok(CasOutcome::Conflict { current });
            }
        }
        run.node_states.insert(node_id.to_string(), state);
        run.updated_at = Utc::now();
        Ok(CasOutcome::Applied)
    }

    async fn update_node_states(
        &self,
        run_id: Uuid,
        states: BTreeMap<NodeId, NodeState>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.node_states.extend(states);
        run.updated_at = Utc::now();
        Ok(())
    }

    // ── Entities ──

    async fn move_entity_to_section(
        &self,
        entity_id: Uuid,
        section_id: Uuid,
        complete_as: CompletionLabel,
        meta: Value,
        set_entity_type: Option<String>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let record = w.entities.entry(entity_id).or_insert(EntityRecord {
            entity_id,
            section_id,
            entity_type: None,
        });
        record.section_id = section_id;
        if let Some(kind) = set_entity_type {
            record.entity_type = Some(kind);
        }
        w.journeys.push(JourneyEvent {
            entity_id,
            section_id,
            event: "node_arrival".to_string(),
            complete_as,
            meta,
        });
        Ok(())
    }

    // ── Event log ──

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(run_id).or_insert(0);
        *seq += 1;
        let current_seq = *seq;
        w.events
            .entry(run_id)
            .or_default()
            .push((current_seq, event.clone()));
        Ok(current_seq)
    }

    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RunEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(&run_id)
            .map(|evts| {
                evts.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trigger;
    use serde_json::json;

    fn make_run(id: Uuid) -> Run {
        Run {
            run_id: id,
            flow_version_id: Uuid::now_v7(),
            entity_id: None,
            trigger: Trigger::manual(),
            node_states: BTreeMap::from([("A".to_string(), NodeState::pending())]),
            status: RunStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn run_round_trip() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_run(&make_run(id)).await.unwrap();

        let loaded = store.load_run(id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, id);
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.node_states["A"].status, NodeStatus::Pending);
        assert!(store.load_run(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_applies_on_matching_status() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_run(&make_run(id)).await.unwrap();

        let outcome = store
            .update_node_state(id, "A", NodeState::running(), Some(NodeStatus::Pending))
            .await
            .unwrap();
        assert!(outcome.applied());

        let run = store.load_run(id).await.unwrap().unwrap();
        assert_eq!(run.node_states["A"].status, NodeStatus::Running);
    }

    /// The second of two racing terminal transitions is a no-op.
    #[tokio::test]
    async fn cas_conflict_leaves_state_untouched() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_run(&make_run(id)).await.unwrap();

        store
            .update_node_state(id, "A", NodeState::completed(json!({"ok": true})), None)
            .await
            .unwrap();
        let outcome = store
            .update_node_state(id, "A", NodeState::failed("late"), Some(NodeStatus::Running))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                current: Some(NodeStatus::Completed)
            }
        );

        let run = store.load_run(id).await.unwrap().unwrap();
        assert_eq!(run.node_states["A"].status, NodeStatus::Completed);
        assert_eq!(run.node_states["A"].output, Some(json!({"ok": true})));
    }

    /// A node with no state yet counts as pending for CAS purposes.
    #[tokio::test]
    async fn cas_missing_state_counts_as_pending() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_run(&make_run(id)).await.unwrap();

        let outcome = store
            .update_node_state(id, "B", NodeState::running(), Some(NodeStatus::Pending))
            .await
            .unwrap();
        assert!(outcome.applied());

        let outcome = store
            .update_node_state(id, "C", NodeState::failed("x"), Some(NodeStatus::Running))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict { current: None });
    }

    #[tokio::test]
    async fn multi_key_update_lands_together() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_run(&make_run(id)).await.unwrap();

        let states = BTreeMap::from([
            ("W_0".to_string(), NodeState::pending_with_output(json!("a"))),
            ("W_1".to_string(), NodeState::pending_with_output(json!("b"))),
            ("S".to_string(), NodeState::completed(json!(["a", "b"]))),
        ]);
        store.update_node_states(id, states).await.unwrap();

        let run = store.load_run(id).await.unwrap().unwrap();
        assert_eq!(run.node_states["S"].status, NodeStatus::Completed);
        assert_eq!(run.node_states["W_0"].output, Some(json!("a")));
        assert_eq!(run.node_states["W_1"].output, Some(json!("b")));
    }

    #[tokio::test]
    async fn event_log_sequences_per_run() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();

        for i in 0..5u64 {
            let seq = store
                .append_event(
                    id,
                    &RunEvent::NodeCompleted {
                        node_id: format!("n{i}"),
                    },
                )
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let events = store.read_events(id, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, 3);
    }

    #[tokio::test]
    async fn entity_move_records_journey() {
        let store = MemoryStore::new();
        let entity = Uuid::now_v7();
        let section = Uuid::now_v7();

        store
            .move_entity_to_section(
                entity,
                section,
                CompletionLabel::Success,
                json!({"nodeId": "W"}),
                Some("customer".to_string()),
            )
            .await
            .unwrap();

        let record = store.entity(entity).await.unwrap();
        assert_eq!(record.section_id, section);
        assert_eq!(record.entity_type.as_deref(), Some("customer"));

        let journeys = store.journey_events().await;
        assert_eq!(journeys.len(), 1);
        assert_eq!(journeys[0].event, "node_arrival");
        assert_eq!(journeys[0].complete_as, CompletionLabel::Success);
    }
}
