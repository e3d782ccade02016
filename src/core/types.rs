//! Core data model: blueprint definitions, the canonical graph, manifests,
//! events, execution plans, and job outcomes.
//!
//! Everything persisted (events, manifests, plans) derives
//! Serialize/Deserialize with camelCase wire names. Order-preserving tables
//! use `IndexMap` so documents round-trip byte-identically.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Node kinds and cardinality
// ============================================================================

/// What a graph node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A user-editable value.
    InputSource,
    /// An external, expensive computation step.
    Producer,
    /// A derived output of a producer.
    Artifact,
}

impl NodeKind {
    /// Prefix used in canonical ids.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::InputSource => "Input",
            Self::Producer => "Producer",
            Self::Artifact => "Artifact",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Fan-out shape of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    #[default]
    Single,
    PerSegment,
    PerSegmentImage,
}

impl Cardinality {
    /// The fan-out dimension names this cardinality expands over, innermost
    /// last.
    pub fn dimensions(self) -> &'static [&'static str] {
        match self {
            Self::Single => &[],
            Self::PerSegment => &["segment"],
            Self::PerSegmentImage => &["segment", "image"],
        }
    }

    /// Lift a cardinality by additional fan-out dimensions (child blueprint
    /// instantiated per item).
    pub fn lifted_by(self, dims: &[String]) -> Self {
        let mut all: Vec<&str> = self.dimensions().to_vec();
        for d in dims {
            if !all.iter().any(|existing| existing == d) {
                all.push(d.as_str());
            }
        }
        Self::from_dimensions(&all)
    }

    fn from_dimensions(dims: &[&str]) -> Self {
        let segment = dims.contains(&"segment");
        let image = dims.contains(&"image");
        match (segment, image) {
            (true, true) => Self::PerSegmentImage,
            (true, false) => Self::PerSegment,
            _ => Self::Single,
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Single => "single",
            Self::PerSegment => "perSegment",
            Self::PerSegmentImage => "perSegmentImage",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// One `key == value` test against late-bound configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionClause {
    pub key: String,
    pub equals: serde_json::Value,
}

/// OR-of-AND condition groups over configuration keys.
///
/// Preserved unevaluated in the compiled graph; concrete configuration
/// values only exist at planning time. An empty group list is always true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub any: Vec<Vec<ConditionClause>>,
}

impl Condition {
    pub fn eval(&self, config: &BTreeMap<String, serde_json::Value>) -> bool {
        if self.any.is_empty() {
            return true;
        }
        self.any
            .iter()
            .any(|group| group.iter().all(|c| config.get(&c.key) == Some(&c.equals)))
    }
}

// ============================================================================
// Blueprint definitions (author-facing)
// ============================================================================

/// A node declaration inside a section or blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    /// Short name, unique within the declaring section/blueprint.
    pub id: String,

    pub kind: NodeKind,

    #[serde(default)]
    pub cardinality: Cardinality,

    /// Optional guard; a node whose guard evaluates false is removed from
    /// plans together with orphaned descendants.
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// An edge declaration. Endpoints are short names resolved against the
/// declared nodes (and, in nested trees, child namespaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,

    /// Extra fan-out dimensions introduced along this edge.
    #[serde(default)]
    pub fan_out: Vec<String>,

    #[serde(default)]
    pub condition: Option<Condition>,

    /// The consumer aggregates the full fan-in of an expanded upstream node.
    #[serde(default)]
    pub aggregate: bool,
}

/// A typed port on a section boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub name: String,

    /// The internal node the port binds to.
    pub node: String,

    #[serde(default)]
    pub cardinality: Cardinality,

    #[serde(default)]
    pub required: bool,

    /// Input ports only: accepts fan-in aggregation from an expanded
    /// upstream cardinality.
    #[serde(default)]
    pub aggregate: bool,
}

/// A reusable, wired section with typed ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintSection {
    pub id: String,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub inputs: Vec<Port>,

    #[serde(default)]
    pub outputs: Vec<Port>,

    #[serde(default)]
    pub nodes: Vec<NodeDecl>,

    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
}

/// A port-to-port connection, written `section.port` on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// A blueprint in the nested-tree composition style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintDoc {
    pub id: String,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeDecl>,

    #[serde(default)]
    pub edges: Vec<EdgeDecl>,

    #[serde(default)]
    pub children: Vec<ChildRef>,
}

/// Reference to a child blueprint, substituted under a namespace when the
/// tree is flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    /// Id of the referenced blueprint.
    pub blueprint: String,

    /// Namespace segment for the substituted subgraph (defaults to the
    /// child blueprint id).
    #[serde(default)]
    pub namespace: Option<String>,

    /// Per-item fan-out: every node of the child is lifted by these
    /// dimensions.
    #[serde(default)]
    pub fan_out: Vec<String>,
}

impl ChildRef {
    pub fn namespace_segment(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.blueprint)
    }
}

// ============================================================================
// Canonical graph (compiled)
// ============================================================================

/// A node in the flattened graph, addressed by canonical id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalNode {
    pub id: String,
    pub kind: NodeKind,

    #[serde(default)]
    pub cardinality: Cardinality,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// An edge in the flattened graph, endpoints by canonical id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEdge {
    pub from: String,
    pub to: String,

    #[serde(default)]
    pub fan_out: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(default)]
    pub aggregate: bool,
}

/// The fully flattened node/edge table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalGraph {
    pub nodes: IndexMap<String, CanonicalNode>,
    pub edges: Vec<CanonicalEdge>,
}

impl CanonicalGraph {
    pub fn node(&self, id: &str) -> Option<&CanonicalNode> {
        self.nodes.get(id)
    }

    /// Edges arriving at `id`.
    pub fn edges_into<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a CanonicalEdge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Edges leaving `id`.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a CanonicalEdge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// All canonical ids of one kind, in insertion order.
    pub fn ids_of_kind(&self, kind: NodeKind) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.kind == kind)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Canonical ids of every user-editable input, for name resolution.
    pub fn input_ids(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.kind == NodeKind::InputSource)
            .map(|n| n.id.clone())
            .collect()
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Current state of one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    pub hash: String,
    pub revision: u64,
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_by: Option<String>,

    pub updated_at: String,
}

/// Current state of one artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactState {
    pub inputs_hash: String,
    pub status: JobStatus,
    pub output: ArtefactOutput,
    pub produced_by: String,
    pub revision: u64,
    pub created_at: String,
}

/// The authoritative current snapshot for one project. Immutable once
/// saved; superseded, never mutated, by the next revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub revision: u64,
    pub base_revision: u64,
    pub created_at: String,

    #[serde(default)]
    pub inputs: IndexMap<String, InputState>,

    #[serde(default)]
    pub artefacts: IndexMap<String, ArtefactState>,

    #[serde(default)]
    pub timeline: serde_json::Value,
}

impl Manifest {
    /// Seed manifest for a project with no history.
    pub fn empty(created_at: &str) -> Self {
        Self {
            revision: 0,
            base_revision: 0,
            created_at: created_at.to_string(),
            inputs: IndexMap::new(),
            artefacts: IndexMap::new(),
            timeline: serde_json::Value::Null,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Append-only record of an input edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    pub id: String,
    pub revision: u64,
    pub payload: serde_json::Value,
    pub hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_by: Option<String>,

    pub created_at: String,
}

/// Append-only record of a produced artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactEvent {
    pub artefact_id: String,
    pub revision: u64,
    pub inputs_hash: String,
    pub output: ArtefactOutput,
    pub status: JobStatus,
    pub produced_by: String,
    pub created_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Persisted artefact output: inline JSON or a content-addressed blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtefactOutput {
    Inline { inline: serde_json::Value },
    Blob { blob: BlobRef },
}

impl ArtefactOutput {
    pub fn inline(value: serde_json::Value) -> Self {
        Self::Inline { inline: value }
    }

    /// JSON view of the output, used when resolving job inputs.
    pub fn as_value(&self) -> serde_json::Value {
        match self {
            Self::Inline { inline } => inline.clone(),
            Self::Blob { blob } => serde_json::json!({ "blob": blob }),
        }
    }
}

/// Reference to a content-addressed blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub hash: String,
    pub size: u64,
    pub mime_type: String,
}

// ============================================================================
// Plan
// ============================================================================

/// One schedulable unit of producer work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Index-expanded producer id; unique within a plan.
    pub job_id: String,

    /// Canonical id of the producer node.
    pub producer: String,

    /// Concrete (index-expanded) input ids.
    pub inputs: Vec<String>,

    /// Artefact ids this job produces.
    pub produces: Vec<String>,

    /// Opaque job context: combined inputs hash, fan-out indices.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl JobDescriptor {
    /// Combined hash of the job's inputs, stamped by the planner.
    pub fn inputs_hash(&self) -> &str {
        self.context
            .get("inputsHash")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

/// Minimal, correctly ordered job set for one target revision.
/// Immutable once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub revision: u64,
    pub manifest_base_hash: String,
    pub layers: Vec<Vec<JobDescriptor>>,
    pub created_at: String,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn job_count(&self) -> usize {
        self.layers.iter().map(|l| l.len()).sum()
    }
}

// ============================================================================
// Run outcomes
// ============================================================================

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Overall run status: failed if any job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// An artefact persisted from a job outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub id: String,
    pub output: ArtefactOutput,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: JobDescriptor,
    pub layer: usize,
    pub attempt: u32,
    pub status: JobStatus,
    pub artifacts: Vec<ProducedArtifact>,
    pub diagnostics: Option<String>,
}
