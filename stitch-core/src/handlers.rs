//! Node-type handlers. Each performs exactly one state transition on the
//! run and returns; downstream activation belongs to the walker.

use crate::error::EngineError;
use crate::events::RunEvent;
use crate::path::{resolve, ParallelId};
use crate::types::{
    NodeState, NodeStatus, Run, SplitterConfig, UxConfig, WorkerConfig, WorkerRequest,
};
use crate::walker::{parallel_predecessors, status_of, Walker};
use serde_json::Value;
use std::collections::BTreeMap;

impl Walker<'_> {
    /// Worker: pending → running, then hand off to a registry executor or
    /// the webhook dispatcher. Dispatch failure is the node's own failure;
    /// success leaves it running until the callback arrives.
    pub(crate) async fn fire_worker(
        &self,
        target: &ParallelId,
        cfg: &WorkerConfig,
        input: Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let key = target.render();
        let outcome = self
            .engine
            .store
            .update_node_state(
                self.run_id,
                &key,
                NodeState::running(),
                Some(NodeStatus::Pending),
            )
            .await?;
        if !outcome.applied() {
            return Ok(Vec::new());
        }
        self.emit(RunEvent::NodeFired {
            node_id: key.clone(),
            kind: "worker".to_string(),
        })
        .await;

        let request = WorkerRequest {
            run_id: self.run_id,
            node_id: key.clone(),
            config: cfg.config.clone(),
            input,
            callback_url: self.engine.config.callback_url(self.run_id, &key),
        };

        if let Some(executor) = cfg
            .worker_type
            .as_deref()
            .and_then(|t| self.engine.registry.get(t))
        {
            return match executor.execute(request).await {
                Ok(()) => Ok(Vec::new()),
                Err(err) => {
                    self.fail_from(&key, NodeStatus::Running, &err.to_string())
                        .await?;
                    Ok(vec![target.clone()])
                }
            };
        }

        // Webhook fallback. A worker with neither route fails here with
        // the canonical invalid-URL message.
        let webhook = cfg.webhook_url.as_deref().unwrap_or_default();
        match self.engine.dispatcher.dispatch(webhook, &request).await {
            Ok(()) => Ok(Vec::new()),
            Err(err) => {
                self.fail_from(&key, NodeStatus::Running, &err.to_string())
                    .await?;
                Ok(vec![target.clone()])
            }
        }
    }

    /// UX: pending → waiting_for_user, parking the merged input as a
    /// provisional output so the UI can render context. Left only via the
    /// UX-complete endpoint.
    pub(crate) async fn fire_ux(
        &self,
        target: &ParallelId,
        cfg: &UxConfig,
        input: Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let key = target.render();
        let outcome = self
            .engine
            .store
            .update_node_state(
                self.run_id,
                &key,
                NodeState::waiting_for_user(input),
                Some(NodeStatus::Pending),
            )
            .await?;
        if outcome.applied() {
            tracing::debug!(run_id = %self.run_id, node_id = %key, prompt = %cfg.prompt, "ux node waiting for user");
            self.emit(RunEvent::NodeFired {
                node_id: key.clone(),
                kind: "ux".to_string(),
            })
            .await;
            self.emit(RunEvent::UserInputRequested { node_id: key }).await;
        }
        Ok(Vec::new())
    }

    /// Splitter: navigate `array_path` into the merged input and fan out.
    /// One atomic multi-update writes every `(downstream, index)` pending
    /// state plus the splitter's own completion.
    pub(crate) async fn fire_splitter(
        &self,
        target: &ParallelId,
        cfg: &SplitterConfig,
        input: Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let key = target.render();

        let Some(path) = cfg.array_path.as_deref().filter(|p| !p.is_empty()) else {
            self.fail_from(
                &key,
                NodeStatus::Pending,
                "Splitter node missing arrayPath in configuration",
            )
            .await?;
            return Ok(vec![target.clone()]);
        };

        let Value::Array(items) = resolve(&input, path) else {
            self.fail_from(&key, NodeStatus::Pending, "Value at path is not an array")
                .await?;
            return Ok(vec![target.clone()]);
        };

        if items.is_empty() {
            // Short-circuit: zero parallel instances; downstream collectors
            // will observe none.
            let outcome = self
                .engine
                .store
                .update_node_state(
                    self.run_id,
                    &key,
                    NodeState::completed(Value::Array(Vec::new())),
                    Some(NodeStatus::Pending),
                )
                .await?;
            if outcome.applied() {
                self.emit(RunEvent::NodeCompleted { node_id: key }).await;
            }
            return Ok(vec![target.clone()]);
        }

        let width = items.len();
        let mut states: BTreeMap<String, NodeState> = BTreeMap::new();
        let mut instances = Vec::with_capacity(width * self.graph.successors(target.base_id()).len());
        for downstream in self.graph.successors(target.base_id()) {
            for (i, item) in items.iter().enumerate() {
                let instance = ParallelId::instance(downstream.clone(), i as u32).render();
                states.insert(instance.clone(), NodeState::pending_with_output(item.clone()));
                instances.push(instance);
            }
        }
        states.insert(key.clone(), NodeState::completed(Value::Array(items)));
        self.engine
            .store
            .update_node_states(self.run_id, states)
            .await?;

        self.emit(RunEvent::FanOut {
            splitter_id: key.clone(),
            width,
            instances,
        })
        .await;
        self.emit(RunEvent::NodeCompleted { node_id: key }).await;
        Ok(vec![target.clone()])
    }

    /// Collector: classify the actual parallel predecessor set from the
    /// current snapshot. Pure in the store snapshot — safe to call any
    /// number of times.
    pub(crate) async fn fire_collector(
        &self,
        target: &ParallelId,
        run: &Run,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let key = target.render();
        if let Some(state) = run.node_states.get(&key) {
            if state.status != NodeStatus::Pending {
                return Ok(Vec::new());
            }
        }

        let mut members: Vec<ParallelId> = Vec::new();
        for base in self.graph.predecessors(target.base_id()) {
            members.extend(parallel_predecessors(run, base));
        }
        members.sort();

        if members.is_empty() {
            // No predecessors resolve at all: stays pending by convention.
            return Ok(Vec::new());
        }

        if members
            .iter()
            .any(|m| status_of(run, m) == Some(NodeStatus::Failed))
        {
            self.fail_from(&key, NodeStatus::Pending, "Upstream parallel path failed")
                .await?;
            return Ok(vec![target.clone()]);
        }

        let expected = members.len() as u32;
        let completed_count = members
            .iter()
            .filter(|m| status_of(run, m) == Some(NodeStatus::Completed))
            .count() as u32;

        if completed_count < expected {
            // Not all predecessors have arrived — refresh the derived
            // counters and stay pending.
            let state = NodeState {
                upstream_completed_count: Some(completed_count),
                expected_upstream_count: Some(expected),
                ..NodeState::pending()
            };
            self.engine
                .store
                .update_node_state(self.run_id, &key, state, Some(NodeStatus::Pending))
                .await?;
            return Ok(Vec::new());
        }

        // All completed: merge outputs in (base lexicographic, index
        // ascending) order.
        let mut outputs = Vec::with_capacity(members.len());
        let mut upstream_outputs = BTreeMap::new();
        for member in &members {
            let output = run
                .node_states
                .get(&member.render())
                .and_then(|s| s.output.clone())
                .unwrap_or(Value::Null);
            upstream_outputs.insert(member.render(), output.clone());
            outputs.push(output);
        }
        let state = NodeState {
            upstream_completed_count: Some(completed_count),
            expected_upstream_count: Some(expected),
            upstream_outputs: Some(upstream_outputs),
            ..NodeState::completed(Value::Array(outputs))
        };
        let outcome = self
            .engine
            .store
            .update_node_state(self.run_id, &key, state, Some(NodeStatus::Pending))
            .await?;
        if !outcome.applied() {
            return Ok(Vec::new());
        }

        self.emit(RunEvent::Merged {
            collector_id: key.clone(),
            upstream_count: members.len(),
        })
        .await;
        self.emit(RunEvent::NodeCompleted { node_id: key }).await;
        Ok(vec![target.clone()])
    }

    /// SectionItem: a waypoint. Completes immediately, forwarding its
    /// merged input so downstream mappings still have a source.
    pub(crate) async fn fire_section_item(
        &self,
        target: &ParallelId,
        input: Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let key = target.render();
        let outcome = self
            .engine
            .store
            .update_node_state(
                self.run_id,
                &key,
                NodeState::completed(input),
                Some(NodeStatus::Pending),
            )
            .await?;
        if !outcome.applied() {
            return Ok(Vec::new());
        }
        self.emit(RunEvent::NodeCompleted { node_id: key }).await;
        Ok(vec![target.clone()])
    }

    /// Transition a node to failed from an expected prior status and log
    /// the audit event. A conflict means another walker got there first.
    async fn fail_from(
        &self,
        key: &str,
        expect: NodeStatus,
        error: &str,
    ) -> Result<(), EngineError> {
        let outcome = self
            .engine
            .store
            .update_node_state(
                self.run_id,
                key,
                NodeState::failed(error),
                Some(expect),
            )
            .await?;
        if outcome.applied() {
            self.emit(RunEvent::NodeFailed {
                node_id: key.to_string(),
                error: error.to_string(),
            })
            .await;
        }
        Ok(())
    }
}
