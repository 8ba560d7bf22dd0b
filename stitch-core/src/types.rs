use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ────────────────────────────────────────────

/// Authored node identifier. Opaque; must not end in the reserved
/// `_<digits>` parallel-instance suffix.
pub type NodeId = String;

/// SHA-256 of the canonical visual graph JSON — version identity key.
pub type GraphHash = [u8; 32];

/// Edge mapping: target input name → dotted path into the source output.
pub type EdgeMapping = BTreeMap<String, String>;

// ─── Node configuration ───────────────────────────────────────

/// Completion label recorded on an entity journey event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionLabel {
    Success,
    Failure,
    Neutral,
}

/// One arm of an entity movement declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementArm {
    pub target_section_id: Uuid,
    #[serde(default = "MovementArm::default_label")]
    pub complete_as: CompletionLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_entity_type: Option<String>,
}

impl MovementArm {
    fn default_label() -> CompletionLabel {
        CompletionLabel::Neutral
    }
}

/// Entity movement side-effect declared on a Worker node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMovement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<MovementArm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<MovementArm>,
}

/// One declared input of a Worker node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Registry key. Falls back to `webhook_url` dispatch when absent or
    /// unregistered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque worker configuration, forwarded verbatim on dispatch.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub input_schema: Vec<InputSpec>,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_movement: Option<EntityMovement>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UxConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitterConfig {
    /// Dotted path into the node's merged input. Checked at runtime so a
    /// canvas with a half-configured splitter still compiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    /// Authored hint only. The true predecessor count is derived from the
    /// run's node states at merge time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_upstream_count: Option<u32>,
}

/// Node behavior, tagged by kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Worker(WorkerConfig),
    Ux(UxConfig),
    Splitter(SplitterConfig),
    Collector(CollectorConfig),
    SectionItem,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Worker(_) => "worker",
            NodeKind::Ux(_) => "ux",
            NodeKind::Splitter(_) => "splitter",
            NodeKind::Collector(_) => "collector",
            NodeKind::SectionItem => "section_item",
        }
    }

    /// Declared inputs the compiler must see satisfied.
    pub fn input_schema(&self) -> &[InputSpec] {
        match self {
            NodeKind::Worker(cfg) => &cfg.input_schema,
            _ => &[],
        }
    }
}

// ─── Visual graph (authored canvas) ───────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisualNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Layout only — stripped by the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisualEdge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<EdgeMapping>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualGraph {
    pub nodes: Vec<VisualNode>,
    pub edges: Vec<VisualEdge>,
}

// ─── Execution graph (compiler output) ────────────────────────

/// A node with layout stripped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// O(1)-indexed execution graph. All maps are ordered so compiling the
/// same visual graph twice serializes bit-identically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub nodes: BTreeMap<NodeId, NodeDef>,
    pub adj_out: BTreeMap<NodeId, Vec<NodeId>>,
    pub adj_in: BTreeMap<NodeId, Vec<NodeId>>,
    /// source → target → mapping.
    pub edge_data: BTreeMap<NodeId, BTreeMap<NodeId, EdgeMapping>>,
    /// In-degree 0, lexicographic.
    pub entry: Vec<NodeId>,
    /// Out-degree 0, lexicographic.
    pub terminal: Vec<NodeId>,
}

impl ExecutionGraph {
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.get(id)
    }

    pub fn successors(&self, id: &str) -> &[NodeId] {
        self.adj_out.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[NodeId] {
        self.adj_in.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn mapping(&self, source: &str, target: &str) -> Option<&EdgeMapping> {
        self.edge_data.get(source)?.get(target)
    }

    pub fn is_terminal_node(&self, id: &str) -> bool {
        self.terminal.iter().any(|t| t == id)
    }
}

// ─── Node state ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    WaitingForUser,
    Completed,
    Failed,
}

impl NodeStatus {
    /// True if no further transition is possible for this node.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

/// Per-node execution record inside a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_completed_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_upstream_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_outputs: Option<BTreeMap<NodeId, Value>>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self::with_status(NodeStatus::Pending)
    }

    /// Pending state pre-seeded with an output — how a splitter hands each
    /// parallel instance its array element.
    pub fn pending_with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_status(NodeStatus::Pending)
        }
    }

    pub fn running() -> Self {
        Self::with_status(NodeStatus::Running)
    }

    pub fn waiting_for_user(provisional: Value) -> Self {
        Self {
            output: Some(provisional),
            ..Self::with_status(NodeStatus::WaitingForUser)
        }
    }

    pub fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_status(NodeStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(NodeStatus::Failed)
        }
    }

    fn with_status(status: NodeStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            upstream_completed_count: None,
            expected_upstream_count: None,
            upstream_outputs: None,
        }
    }
}

// ─── Run ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// What started the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Trigger {
    pub fn api() -> Self {
        Self::of("api")
    }

    pub fn manual() -> Self {
        Self::of("manual")
    }

    pub fn of(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            source: None,
            event_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// One execution instance of a flow version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub flow_version_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    pub trigger: Trigger,
    /// Keys may carry the `_<digits>` parallel-instance suffix; bases never do.
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Flow & version ───────────────────────────────────────────

/// Mutable flow header over an immutable version sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Immutable snapshot: authored canvas plus its compiled execution graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    pub version_id: Uuid,
    pub flow_id: Uuid,
    #[serde(with = "serde_bytes_hash")]
    pub graph_hash: GraphHash,
    pub visual: VisualGraph,
    pub graph: ExecutionGraph,
    pub created_at: DateTime<Utc>,
}

/// Hex round-trip for the 32-byte graph hash so versions stay readable in
/// JSON stores.
mod serde_bytes_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        use std::fmt::Write;
        let mut hex = String::with_capacity(64);
        for b in hash {
            let _ = write!(hex, "{b:02x}");
        }
        ser.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let hex = String::deserialize(de)?;
        if hex.len() != 64 {
            return Err(serde::de::Error::custom("graph_hash must be 64 hex chars"));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(out)
    }
}

// ─── Worker protocol (the wire types) ─────────────────────────

/// Outbound dispatch body POSTed to a worker webhook or handed to a
/// registry executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub run_id: Uuid,
    pub node_id: NodeId,
    pub config: Value,
    pub input: Value,
    pub callback_url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

/// Inbound worker callback body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
