//! The edge walker — advances a run by examining a just-settled node's
//! successors, merging their inputs, and firing their handlers.
//!
//! Stateless: every step re-reads the run from the store and writes back
//! through per-node compare-and-set. Continuation after synchronous
//! terminal transitions (splitter, collector, dispatch failure) is a work
//! queue, not recursion.

use crate::engine::StitchEngine;
use crate::error::EngineError;
use crate::events::RunEvent;
use crate::path::{resolve, ParallelId};
use crate::types::{ExecutionGraph, NodeDef, NodeKind, NodeState, NodeStatus, Run, RunStatus};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use uuid::Uuid;

pub(crate) struct Walker<'e> {
    pub(crate) engine: &'e StitchEngine,
    pub(crate) graph: &'e ExecutionGraph,
    pub(crate) run_id: Uuid,
}

impl<'e> Walker<'e> {
    pub(crate) fn new(engine: &'e StitchEngine, graph: &'e ExecutionGraph, run_id: Uuid) -> Self {
        Self {
            engine,
            graph,
            run_id,
        }
    }

    /// Advance the run after an external transition on `from`.
    pub(crate) async fn advance(&self, from: &str) -> Result<(), EngineError> {
        let mut queue = VecDeque::from([ParallelId::parse(from)]);
        while let Some(next) = queue.pop_front() {
            queue.extend(self.step(&next).await?);
        }
        self.settle().await
    }

    /// Fire every entry node with the run's initial input, then walk.
    pub(crate) async fn start(&self, initial_input: &Value) -> Result<(), EngineError> {
        let mut queue = VecDeque::new();
        for entry in &self.graph.entry {
            let target = ParallelId::base(entry.clone());
            queue.extend(self.fire_entry(&target, initial_input).await?);
        }
        while let Some(next) = queue.pop_front() {
            queue.extend(self.step(&next).await?);
        }
        self.settle().await
    }

    /// Process the successors of a just-settled node. Returns the nodes
    /// that reached a terminal state synchronously, so the walk continues
    /// from them.
    async fn step(&self, from: &ParallelId) -> Result<Vec<ParallelId>, EngineError> {
        let run = self.load_run().await?;
        let from_def = self
            .graph
            .node(from.base_id())
            .ok_or_else(|| EngineError::NodeNotFound(from.base_id().to_string()))?;
        // A failed splitter has no siblings to walk; its successors go
        // through the generic upstream-failure gate instead.
        let fanned_out = matches!(from_def.kind, NodeKind::Splitter(_))
            && status_of(&run, from) == Some(NodeStatus::Completed);

        let mut newly_terminal = Vec::new();
        // Successor order is stable lexicographic (adjacency is sorted).
        for successor in self.graph.successors(from.base_id()) {
            let targets = self.concrete_targets(&run, from, fanned_out, successor);
            for target in targets {
                newly_terminal.extend(self.try_activate(&target).await?);
            }
        }
        Ok(newly_terminal)
    }

    /// Resolve one successor base id into the concrete instance ids to
    /// activate. A splitter origin activates the siblings it just created
    /// in index order; a parallel-instance origin passes its suffix on,
    /// except into collectors, which always merge at the base id.
    fn concrete_targets(
        &self,
        run: &Run,
        from: &ParallelId,
        fanned_out: bool,
        successor: &str,
    ) -> Vec<ParallelId> {
        if fanned_out {
            return sibling_instances(run, successor);
        }
        let successor_is_collector = matches!(
            self.graph.node(successor).map(|d| &d.kind),
            Some(NodeKind::Collector(_))
        );
        if from.is_instance() && !successor_is_collector {
            vec![from.with_base(successor)]
        } else {
            vec![ParallelId::base(successor)]
        }
    }

    /// Try to activate one concrete node: idempotence check, upstream
    /// gate, merged input, handler dispatch.
    async fn try_activate(&self, target: &ParallelId) -> Result<Vec<ParallelId>, EngineError> {
        let run = self.load_run().await?;
        let def = self
            .graph
            .node(target.base_id())
            .ok_or_else(|| EngineError::NodeNotFound(target.base_id().to_string()))?;

        // Idempotence: anything already underway or settled is skipped.
        let key = target.render();
        if let Some(state) = run.node_states.get(&key) {
            if state.status != NodeStatus::Pending {
                return Ok(Vec::new());
            }
        }

        // Collectors classify their own predecessor set; the generic
        // upstream gate below would preempt their canonical failure state.
        if matches!(def.kind, NodeKind::Collector(_)) {
            return self.fire_collector(target, &run).await;
        }

        let upstreams = self.project_upstreams(&run, target);

        // A failed predecessor poisons the successor without firing it,
        // and the poison stops here.
        if upstreams
            .iter()
            .any(|u| status_of(&run, u) == Some(NodeStatus::Failed))
        {
            self.mark_failed(target, "Upstream failed").await?;
            return Ok(Vec::new());
        }

        // Every upstream must have settled (or parked with a provisional
        // output) before the successor fires.
        let ready = upstreams.iter().all(|u| upstream_satisfied(&run, u));
        if !ready {
            return Ok(Vec::new());
        }

        let input = self.merged_input(&run, target, def, &upstreams);
        self.fire(target, def, input).await
    }

    /// Fire an entry node with the run's initial input plus declared
    /// defaults.
    async fn fire_entry(
        &self,
        target: &ParallelId,
        initial_input: &Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        let run = self.load_run().await?;
        let def = self
            .graph
            .node(target.base_id())
            .ok_or_else(|| EngineError::NodeNotFound(target.base_id().to_string()))?;
        if let Some(state) = run.node_states.get(&target.render()) {
            if state.status != NodeStatus::Pending {
                return Ok(Vec::new());
            }
        }
        if matches!(def.kind, NodeKind::Collector(_)) {
            return self.fire_collector(target, &run).await;
        }

        let mut input = if initial_input.is_null() {
            Value::Object(Map::new())
        } else {
            initial_input.clone()
        };
        if let Value::Object(map) = &mut input {
            apply_defaults(def, map);
        }
        self.fire(target, def, input).await
    }

    /// Dispatch to the handler for the node's kind.
    async fn fire(
        &self,
        target: &ParallelId,
        def: &NodeDef,
        input: Value,
    ) -> Result<Vec<ParallelId>, EngineError> {
        match &def.kind {
            NodeKind::Worker(cfg) => self.fire_worker(target, cfg, input).await,
            NodeKind::Ux(cfg) => self.fire_ux(target, cfg, input).await,
            NodeKind::Splitter(cfg) => self.fire_splitter(target, cfg, input).await,
            NodeKind::SectionItem => self.fire_section_item(target, input).await,
            // Collectors are routed to fire_collector before this point.
            NodeKind::Collector(_) => self.fire_collector(target, &self.load_run().await?).await,
        }
    }

    /// The set of concrete upstream ids whose output flows into `target`.
    /// A suffixed target projects each upstream into its own index when a
    /// state for that instance exists, falling back to the base id for
    /// inputs joining from outside the parallel region.
    fn project_upstreams(&self, run: &Run, target: &ParallelId) -> Vec<ParallelId> {
        self.graph
            .predecessors(target.base_id())
            .iter()
            .map(|u| match target.index() {
                Some(i) if run.node_states.contains_key(&ParallelId::instance(u.clone(), i).render()) => {
                    ParallelId::instance(u.clone(), i)
                }
                _ => ParallelId::base(u.clone()),
            })
            .collect()
    }

    /// Build the merged input for `target` from its incoming edge
    /// mappings, then declared defaults. When nothing maps and a single
    /// mapping-less upstream feeds the node, its output passes through
    /// verbatim (this is how a splitter's array element reaches each
    /// parallel instance, and how waypoints forward data).
    fn merged_input(
        &self,
        run: &Run,
        target: &ParallelId,
        def: &NodeDef,
        upstreams: &[ParallelId],
    ) -> Value {
        let mut merged = Map::new();
        for upstream in upstreams {
            let Some(mapping) = self.graph.mapping(upstream.base_id(), target.base_id()) else {
                continue;
            };
            let source_output = self.upstream_output(run, upstream, target);
            for (input_name, source_path) in mapping {
                merged.insert(input_name.clone(), resolve(&source_output, source_path));
            }
        }
        apply_defaults(def, &mut merged);

        if merged.is_empty() && upstreams.len() == 1 {
            let only = &upstreams[0];
            if self.graph.mapping(only.base_id(), target.base_id()).is_none() {
                return self.upstream_output(run, only, target);
            }
        }
        Value::Object(merged)
    }

    /// The output of one upstream as seen by `target`. When the upstream
    /// is the splitter that spawned a suffixed target, the source is the
    /// array element at the target's index, not the whole array.
    fn upstream_output(&self, run: &Run, upstream: &ParallelId, target: &ParallelId) -> Value {
        let upstream_is_splitter = matches!(
            self.graph.node(upstream.base_id()).map(|d| &d.kind),
            Some(NodeKind::Splitter(_))
        );
        let output = run
            .node_states
            .get(&upstream.render())
            .and_then(|s| s.output.clone())
            .unwrap_or(Value::Null);

        match (upstream_is_splitter, target.index()) {
            (true, Some(i)) => match output {
                Value::Array(items) => items.get(i as usize).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            _ => output,
        }
    }

    /// Poison a successor whose upstream failed. Conflict means someone
    /// else already transitioned it — fine either way.
    async fn mark_failed(&self, target: &ParallelId, error: &str) -> Result<(), EngineError> {
        let key = target.render();
        let outcome = self
            .engine
            .store
            .update_node_state(
                self.run_id,
                &key,
                NodeState::failed(error),
                Some(NodeStatus::Pending),
            )
            .await?;
        if outcome.applied() {
            self.emit(RunEvent::NodeFailed {
                node_id: key,
                error: error.to_string(),
            })
            .await;
        }
        Ok(())
    }

    /// Record the run's aggregate status once no live work remains.
    async fn settle(&self) -> Result<(), EngineError> {
        let run = self.load_run().await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let live = run.node_states.values().any(|s| {
            matches!(
                s.status,
                NodeStatus::Pending | NodeStatus::Running | NodeStatus::WaitingForUser
            )
        });
        if live {
            return Ok(());
        }

        let any_failed = run
            .node_states
            .values()
            .any(|s| s.status == NodeStatus::Failed);
        let status = if any_failed {
            RunStatus::Failed
        } else if self
            .graph
            .terminal
            .iter()
            .all(|t| terminal_completed(&run, t))
        {
            RunStatus::Completed
        } else {
            // Dead-ended without failure (e.g. a collector starved by an
            // empty-array splitter): the run stays running by convention.
            return Ok(());
        };

        self.engine.store.update_run_status(self.run_id, status).await?;
        self.emit(RunEvent::RunSettled { status }).await;
        Ok(())
    }

    pub(crate) async fn load_run(&self) -> Result<Run, EngineError> {
        self.engine
            .store
            .load_run(self.run_id)
            .await?
            .ok_or(EngineError::RunNotFound(self.run_id))
    }

    /// Best-effort audit append; never fails the walk.
    pub(crate) async fn emit(&self, event: RunEvent) {
        if let Err(err) = self.engine.store.append_event(self.run_id, &event).await {
            tracing::warn!(run_id = %self.run_id, %err, "run event append failed");
        }
    }
}

// ─── Free helpers ─────────────────────────────────────────────

/// Every suffixed instance of `base` present in the run, ascending index.
pub(crate) fn sibling_instances(run: &Run, base: &str) -> Vec<ParallelId> {
    let mut instances: Vec<ParallelId> = run
        .node_states
        .keys()
        .map(|k| ParallelId::parse(k))
        .filter(|p| p.is_instance() && p.base_id() == base)
        .collect();
    instances.sort();
    instances
}

/// The parallel predecessor set for one upstream base: its suffixed
/// instances if any exist, or the base itself standing in (possibly with
/// no state yet — an incomplete predecessor).
pub(crate) fn parallel_predecessors(run: &Run, base: &str) -> Vec<ParallelId> {
    let mut members: Vec<ParallelId> = run
        .node_states
        .keys()
        .map(|k| ParallelId::parse(k))
        .filter(|p| p.base_id() == base)
        .collect();
    if members.is_empty() {
        members.push(ParallelId::base(base));
    }
    members.sort();
    members
}

pub(crate) fn status_of(run: &Run, id: &ParallelId) -> Option<NodeStatus> {
    run.node_states.get(&id.render()).map(|s| s.status)
}

/// An upstream is satisfied once it settled with an output, or parked in
/// `waiting_for_user` with a provisional one.
fn upstream_satisfied(run: &Run, id: &ParallelId) -> bool {
    run.node_states.get(&id.render()).is_some_and(|s| {
        matches!(
            s.status,
            NodeStatus::Completed | NodeStatus::WaitingForUser
        ) && s.output.is_some()
    })
}

/// A terminal node counts as completed when every concrete instance of it
/// (suffixed or plain) exists and completed.
fn terminal_completed(run: &Run, base: &str) -> bool {
    let states: Vec<&NodeState> = run
        .node_states
        .iter()
        .filter(|(k, _)| ParallelId::parse(k).base_id() == base)
        .map(|(_, s)| s)
        .collect();
    !states.is_empty() && states.iter().all(|s| s.status == NodeStatus::Completed)
}

fn apply_defaults(def: &NodeDef, merged: &mut Map<String, Value>) {
    for spec in def.kind.input_schema() {
        if !merged.contains_key(&spec.name) {
            if let Some(default) = &spec.default {
                merged.insert(spec.name.clone(), default.clone());
            }
        }
    }
}
