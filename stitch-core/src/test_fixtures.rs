//! Canvas builders shared by the compiler and engine test modules.

use crate::registry::WorkerExecutor;
use crate::types::{
    CollectorConfig, EdgeMapping, InputSpec, NodeKind, Position, SplitterConfig, UxConfig,
    VisualEdge, VisualGraph, VisualNode, WorkerConfig, WorkerRequest,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

pub(crate) fn canvas(nodes: Vec<VisualNode>, edges: Vec<VisualEdge>) -> VisualGraph {
    VisualGraph { nodes, edges }
}

fn node(id: &str, kind: NodeKind) -> VisualNode {
    VisualNode {
        id: id.to_string(),
        kind,
        position: Some(Position { x: 0.0, y: 0.0 }),
        style: None,
    }
}

pub(crate) fn ux_node(id: &str) -> VisualNode {
    node(
        id,
        NodeKind::Ux(UxConfig {
            prompt: format!("Provide input for {id}"),
            timeout_hours: None,
        }),
    )
}

pub(crate) fn worker_node(id: &str, worker_type: &str) -> VisualNode {
    node(
        id,
        NodeKind::Worker(WorkerConfig {
            worker_type: Some(worker_type.to_string()),
            ..WorkerConfig::default()
        }),
    )
}

pub(crate) fn webhook_worker_node(id: &str, url: &str) -> VisualNode {
    node(
        id,
        NodeKind::Worker(WorkerConfig {
            webhook_url: Some(url.to_string()),
            ..WorkerConfig::default()
        }),
    )
}

pub(crate) fn splitter_node(id: &str, array_path: &str) -> VisualNode {
    node(
        id,
        NodeKind::Splitter(SplitterConfig {
            array_path: Some(array_path.to_string()),
        }),
    )
}

pub(crate) fn bare_splitter_node(id: &str) -> VisualNode {
    node(id, NodeKind::Splitter(SplitterConfig { array_path: None }))
}

pub(crate) fn collector_node(id: &str) -> VisualNode {
    node(
        id,
        NodeKind::Collector(CollectorConfig {
            expected_upstream_count: None,
        }),
    )
}

pub(crate) fn section_item_node(id: &str) -> VisualNode {
    node(id, NodeKind::SectionItem)
}

pub(crate) fn edge(id: &str, source: &str, target: &str, mapping: &[(&str, &str)]) -> VisualEdge {
    let mapping = if mapping.is_empty() {
        None
    } else {
        Some(
            mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<EdgeMapping>(),
        )
    };
    VisualEdge {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        mapping,
    }
}

pub(crate) fn set_required_input(node: &mut VisualNode, name: &str) {
    if let NodeKind::Worker(cfg) = &mut node.kind {
        cfg.input_schema.push(InputSpec {
            name: name.to_string(),
            required: true,
            default: None,
        });
    }
}

pub(crate) fn set_required_input_with_default(node: &mut VisualNode, name: &str, default: Value) {
    if let NodeKind::Worker(cfg) = &mut node.kind {
        cfg.input_schema.push(InputSpec {
            name: name.to_string(),
            required: true,
            default: Some(default),
        });
    }
}

/// An in-process worker that records every dispatch and never calls back
/// on its own — tests deliver callbacks explicitly.
pub(crate) struct ManualWorker {
    pub(crate) requests: Mutex<Vec<WorkerRequest>>,
}

impl ManualWorker {
    pub(crate) fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn dispatches(&self) -> Vec<WorkerRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl WorkerExecutor for ManualWorker {
    async fn execute(&self, request: WorkerRequest) -> Result<()> {
        self.requests.lock().await.push(request);
        Ok(())
    }
}
