//! Canvas → execution-graph compiler.
//!
//! Single pass, error-accumulating, O(V+E). The output is the only graph
//! shape the engine ever reads at runtime.

use crate::error::ValidationError;
use crate::path::ParallelId;
use crate::types::{
    EdgeMapping, ExecutionGraph, GraphHash, NodeDef, NodeId, NodeKind, VisualGraph,
};
use anyhow::Result;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Compile an authored canvas into a validated execution graph.
///
/// Accumulates every validation error before returning; a non-empty error
/// list means no graph. `registered_workers` is a snapshot of the worker
/// registry so the function stays pure.
pub fn compile(
    visual: &VisualGraph,
    registered_workers: &BTreeSet<String>,
) -> Result<ExecutionGraph, Vec<ValidationError>> {
    let mut errors = Vec::new();

    // (i) Node table, layout stripped. Duplicate ids collapse last-wins,
    // matching canvas map semantics.
    let mut nodes: BTreeMap<NodeId, NodeDef> = BTreeMap::new();
    for vn in &visual.nodes {
        if ParallelId::has_reserved_suffix(&vn.id) {
            errors.push(ValidationError::ReservedNodeId {
                node: vn.id.clone(),
            });
        }
        nodes.insert(
            vn.id.clone(),
            NodeDef {
                id: vn.id.clone(),
                kind: vn.kind.clone(),
            },
        );
    }

    // (ii) Adjacency + edge data. Edges with unknown endpoints are
    // reported and excluded from the index.
    let mut adj_out: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut adj_in: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut edge_data: BTreeMap<NodeId, BTreeMap<NodeId, EdgeMapping>> = BTreeMap::new();

    for edge in &visual.edges {
        let mut endpoints_ok = true;
        for endpoint in [&edge.source, &edge.target] {
            if !nodes.contains_key(endpoint.as_str()) {
                errors.push(ValidationError::EdgeEndpoint {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
                endpoints_ok = false;
            }
        }
        if !endpoints_ok {
            continue;
        }

        adj_out
            .entry(edge.source.clone())
            .or_default()
            .push(edge.target.clone());
        adj_in
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());

        if let Some(mapping) = &edge.mapping {
            edge_data
                .entry(edge.source.clone())
                .or_default()
                .entry(edge.target.clone())
                .or_default()
                .extend(mapping.clone());
        }
    }

    for list in adj_out.values_mut().chain(adj_in.values_mut()) {
        list.sort();
        list.dedup();
    }

    // (iii) Cycle detection. Every strongly connected component with more
    // than one node (or a self-loop) is reported with all of its members.
    let mut pg: DiGraph<NodeId, ()> = DiGraph::new();
    let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for id in nodes.keys() {
        indices.insert(id.as_str(), pg.add_node(id.clone()));
    }
    for (source, targets) in &adj_out {
        for target in targets {
            pg.add_edge(indices[source.as_str()], indices[target.as_str()], ());
        }
    }
    for scc in tarjan_scc(&pg) {
        let is_cycle = scc.len() > 1 || pg.find_edge(scc[0], scc[0]).is_some();
        if is_cycle {
            let mut cycle_nodes: Vec<NodeId> = scc.iter().map(|&ix| pg[ix].clone()).collect();
            cycle_nodes.sort();
            errors.push(ValidationError::Cycle { nodes: cycle_nodes });
        }
    }

    // (iv) Required inputs: an incoming edge mapping must name the input,
    // or the input must declare a default.
    for (id, def) in &nodes {
        for input in def.kind.input_schema().iter().filter(|i| i.required) {
            if input.default.is_some() {
                continue;
            }
            let covered = adj_in.get(id).is_some_and(|preds| {
                preds.iter().any(|pred| {
                    edge_data
                        .get(pred)
                        .and_then(|targets| targets.get(id))
                        .is_some_and(|mapping| mapping.contains_key(&input.name))
                })
            });
            if !covered {
                errors.push(ValidationError::MissingRequiredInput {
                    node: id.clone(),
                    input: input.name.clone(),
                });
            }
        }
    }

    // (v) Worker resolution: a registered workerType or a webhookUrl.
    for (id, def) in &nodes {
        if let NodeKind::Worker(cfg) = &def.kind {
            let registered = cfg
                .worker_type
                .as_ref()
                .is_some_and(|t| registered_workers.contains(t));
            let has_webhook = cfg.webhook_url.as_deref().is_some_and(|u| !u.is_empty());
            if !registered && !has_webhook {
                errors.push(ValidationError::UnknownWorkerType {
                    node: id.clone(),
                    worker_type: cfg.worker_type.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // (vi) Entry / terminal sets. BTreeMap iteration keeps them
    // lexicographic.
    let entry: Vec<NodeId> = nodes
        .keys()
        .filter(|id| adj_in.get(*id).map_or(true, Vec::is_empty))
        .cloned()
        .collect();
    let terminal: Vec<NodeId> = nodes
        .keys()
        .filter(|id| adj_out.get(*id).map_or(true, Vec::is_empty))
        .cloned()
        .collect();

    Ok(ExecutionGraph {
        nodes,
        adj_out,
        adj_in,
        edge_data,
        entry,
        terminal,
    })
}

/// SHA-256 over the canonical JSON of the canvas — the version identity
/// key. JSON object keys are ordered, so two submissions of the same
/// canvas hash identically regardless of authoring key order.
pub fn graph_hash(visual: &VisualGraph) -> Result<GraphHash> {
    let bytes = serde_json::to_vec(visual)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}
