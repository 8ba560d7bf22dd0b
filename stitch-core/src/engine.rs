use crate::compiler::{compile, graph_hash};
use crate::config::EngineConfig;
use crate::dispatch::WebhookDispatcher;
use crate::error::EngineError;
use crate::events::RunEvent;
use crate::path::ParallelId;
use crate::registry::WorkerRegistry;
use crate::store::{CasOutcome, RunStore};
use crate::types::{
    CallbackPayload, CallbackStatus, Flow, FlowVersion, NodeKind, NodeState, NodeStatus, Run,
    RunStatus, Trigger, VisualGraph, WorkerConfig,
};
use crate::walker::Walker;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// StitchEngine is the top-level facade that wires together the compiler,
/// edge walker, worker registry, and store. The HTTP control endpoints
/// delegate to this. Process-wide stateless: every operation re-reads the
/// run record, so any replica can serve any event.
pub struct StitchEngine {
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) dispatcher: WebhookDispatcher,
    pub(crate) config: EngineConfig,
}

/// Handle returned by `start_run`.
#[derive(Clone, Debug)]
pub struct StartedRun {
    pub run_id: Uuid,
    pub version_id: Uuid,
}

impl StitchEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<WorkerRegistry>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let dispatcher = WebhookDispatcher::new(config.callback_timeout)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            store,
            registry,
            dispatcher,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Flows ──

    pub async fn create_flow(&self, name: &str) -> Result<Flow, EngineError> {
        let flow = Flow {
            flow_id: Uuid::now_v7(),
            name: name.to_string(),
            current_version: None,
            created_at: Utc::now(),
        };
        self.store.save_flow(&flow).await?;
        Ok(flow)
    }

    pub async fn get_flow(&self, flow_id: Uuid) -> Result<Flow, EngineError> {
        self.store
            .load_flow(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound(flow_id))
    }

    // ── Run start ──

    /// Create and start a run. A supplied canvas is auto-versioned: an
    /// unchanged canvas reuses the current version, a changed one is
    /// compiled into a new current version. Without a canvas the flow
    /// must already have a current version.
    pub async fn start_run(
        &self,
        flow_id: Uuid,
        visual: Option<VisualGraph>,
        entity_id: Option<Uuid>,
        input: Option<Value>,
    ) -> Result<StartedRun, EngineError> {
        let flow = self
            .store
            .load_flow(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound(flow_id))?;

        let version_id = match visual {
            Some(visual) => self.version_for(&flow, visual).await?,
            None => flow
                .current_version
                .ok_or(EngineError::NoCurrentVersion(flow_id))?,
        };
        let version = self
            .store
            .load_version(version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version_id))?;

        let now = Utc::now();
        let mut node_states = BTreeMap::new();
        for entry in &version.graph.entry {
            node_states.insert(entry.clone(), NodeState::pending());
        }
        let run = Run {
            run_id: Uuid::now_v7(),
            flow_version_id: version_id,
            entity_id,
            trigger: Trigger::api(),
            node_states,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        };
        self.store.save_run(&run).await?;
        tracing::info!(run_id = %run.run_id, version_id = %version_id, "run started");

        let walker = Walker::new(self, &version.graph, run.run_id);
        walker
            .emit(RunEvent::RunStarted {
                run_id: run.run_id,
                flow_version_id: version_id,
            })
            .await;
        walker.start(&input.unwrap_or(Value::Null)).await?;

        Ok(StartedRun {
            run_id: run.run_id,
            version_id,
        })
    }

    async fn version_for(&self, flow: &Flow, visual: VisualGraph) -> Result<Uuid, EngineError> {
        let hash = graph_hash(&visual)?;
        if let Some(current) = flow.current_version {
            if let Some(existing) = self.store.load_version(current).await? {
                if existing.graph_hash == hash {
                    return Ok(current);
                }
            }
        }

        let graph =
            compile(&visual, &self.registry.type_names()).map_err(EngineError::Validation)?;
        let version = FlowVersion {
            version_id: Uuid::now_v7(),
            flow_id: flow.flow_id,
            graph_hash: hash,
            visual,
            graph,
            created_at: Utc::now(),
        };
        self.store.save_version(&version).await?;
        self.store
            .set_current_version(flow.flow_id, version.version_id)
            .await?;
        Ok(version.version_id)
    }

    // ── Worker callback ──

    /// Apply a worker callback: CAS running → terminal, then entity
    /// movement and edge-walker re-entry. Re-delivery of the same
    /// terminal transition is a no-op.
    pub async fn handle_callback(
        &self,
        run_id: Uuid,
        node_id: &str,
        payload: CallbackPayload,
    ) -> Result<(), EngineError> {
        let (run, version) = self.load_run_and_version(run_id).await?;
        let instance = ParallelId::parse(node_id);
        let def = version
            .graph
            .node(instance.base_id())
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        let NodeKind::Worker(cfg) = &def.kind else {
            return Err(EngineError::WrongNodeKind {
                node: node_id.to_string(),
                kind: def.kind.name(),
                expected: "worker",
            });
        };

        let target_status = match payload.status {
            CallbackStatus::Completed => NodeStatus::Completed,
            CallbackStatus::Failed => NodeStatus::Failed,
        };
        let current = run.node_states.get(node_id).map(|s| s.status);
        if current == Some(target_status) {
            return Ok(());
        }

        let state = match payload.status {
            CallbackStatus::Completed => {
                NodeState::completed(payload.output.clone().unwrap_or(Value::Null))
            }
            CallbackStatus::Failed => NodeState::failed(
                payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "Worker reported failure".to_string()),
            ),
        };
        let outcome = self
            .store
            .update_node_state(run_id, node_id, state, Some(NodeStatus::Running))
            .await?;
        if let CasOutcome::Conflict { current } = outcome {
            // Lost a race after the pre-check; an identical transition is
            // still a no-op.
            if current == Some(target_status) {
                return Ok(());
            }
            return Err(EngineError::InvalidTransition {
                node: node_id.to_string(),
                current,
                expected: NodeStatus::Running,
            });
        }

        let walker = Walker::new(self, &version.graph, run_id);
        match &payload.status {
            CallbackStatus::Completed => {
                walker
                    .emit(RunEvent::NodeCompleted {
                        node_id: node_id.to_string(),
                    })
                    .await
            }
            CallbackStatus::Failed => {
                walker
                    .emit(RunEvent::NodeFailed {
                        node_id: node_id.to_string(),
                        error: payload.error.clone().unwrap_or_default(),
                    })
                    .await
            }
        }

        self.apply_entity_movement(&run, node_id, cfg, payload.status)
            .await;

        walker.advance(node_id).await
    }

    /// Entity movement side-effect of a worker's terminal transition.
    /// Failures are logged and swallowed — they never fail the run.
    async fn apply_entity_movement(
        &self,
        run: &Run,
        node_id: &str,
        cfg: &WorkerConfig,
        status: CallbackStatus,
    ) {
        let Some(movement) = &cfg.entity_movement else {
            return;
        };
        let Some(entity_id) = run.entity_id else {
            return;
        };
        let arm = match status {
            CallbackStatus::Completed => movement.on_success.as_ref(),
            CallbackStatus::Failed => movement.on_failure.as_ref(),
        };
        let Some(arm) = arm else {
            return;
        };

        let meta = json!({
            "runId": run.run_id,
            "nodeId": node_id,
            "event": "node_arrival",
        });
        match self
            .store
            .move_entity_to_section(
                entity_id,
                arm.target_section_id,
                arm.complete_as,
                meta,
                arm.set_entity_type.clone(),
            )
            .await
        {
            Ok(()) => {
                if let Err(err) = self
                    .store
                    .append_event(
                        run.run_id,
                        &RunEvent::EntityMoved {
                            entity_id,
                            section_id: arm.target_section_id,
                        },
                    )
                    .await
                {
                    tracing::warn!(%entity_id, %err, "entity-moved event append failed");
                }
            }
            Err(err) => {
                tracing::warn!(%entity_id, node_id, %err, "entity movement failed");
            }
        }
    }

    // ── UX complete ──

    /// Resolve a parked UX node with the user's input. The request body
    /// object (`{"input": …}`) becomes the node's output, which is what
    /// downstream `input.…` mappings resolve against.
    pub async fn complete_ux(
        &self,
        run_id: Uuid,
        node_id: &str,
        input: Value,
    ) -> Result<(), EngineError> {
        let (run, version) = self.load_run_and_version(run_id).await?;
        let instance = ParallelId::parse(node_id);
        let def = version
            .graph
            .node(instance.base_id())
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        if !matches!(def.kind, NodeKind::Ux(_)) {
            return Err(EngineError::WrongNodeKind {
                node: node_id.to_string(),
                kind: def.kind.name(),
                expected: "ux",
            });
        }
        let state = run
            .node_states
            .get(node_id)
            .ok_or_else(|| EngineError::NodeStateNotFound(node_id.to_string()))?;
        if state.status != NodeStatus::WaitingForUser {
            return Err(EngineError::InvalidTransition {
                node: node_id.to_string(),
                current: Some(state.status),
                expected: NodeStatus::WaitingForUser,
            });
        }

        let output = json!({ "input": input });
        let outcome = self
            .store
            .update_node_state(
                run_id,
                node_id,
                NodeState::completed(output),
                Some(NodeStatus::WaitingForUser),
            )
            .await?;
        if let CasOutcome::Conflict { current } = outcome {
            return Err(EngineError::InvalidTransition {
                node: node_id.to_string(),
                current,
                expected: NodeStatus::WaitingForUser,
            });
        }

        let walker = Walker::new(self, &version.graph, run_id);
        walker
            .emit(RunEvent::NodeCompleted {
                node_id: node_id.to_string(),
            })
            .await;
        walker.advance(node_id).await
    }

    // ── Inspection ──

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn read_events(
        &self,
        run_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RunEvent)>, EngineError> {
        Ok(self.store.read_events(run_id, from_seq).await?)
    }

    async fn load_run_and_version(
        &self,
        run_id: Uuid,
    ) -> Result<(Run, FlowVersion), EngineError> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let version = self
            .store
            .load_version(run.flow_version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(run.flow_version_id))?;
        Ok((run, version))
    }
}
