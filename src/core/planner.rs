//! Plan generation — diff pending input state against the last manifest
//! over the canonical graph.
//!
//! A producer is dirty when no recorded artefact matches its current
//! combined-input hash, when a declared input hash changed, or when a
//! condition guard evaluates differently. Dirtiness propagates forward
//! through fan-out/fan-in expansion; dirty producers are grouped into
//! layers by longest-path distance from available inputs. Identical inputs
//! always yield an identical plan.

use super::ident;
use super::types::*;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::fmt;

use crate::store::hasher;

/// Late-bound planning inputs: condition configuration and concrete
/// fan-out dimension sizes.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub config: BTreeMap<String, serde_json::Value>,
    pub dimensions: BTreeMap<String, usize>,
}

/// Planner failure. Graph-integrity failures here mean the compiled graph
/// was corrupted after composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    UnknownNode { id: String },
    Cycle { members: Vec<String> },
    MissingDimension { dimension: String },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode { id } => write!(f, "plan references unknown node '{}'", id),
            Self::Cycle { members } => {
                write!(f, "graph is not acyclic; involved: {}", members.join(", "))
            }
            Self::MissingDimension { dimension } => {
                write!(f, "no size configured for fan-out dimension '{}'", dimension)
            }
        }
    }
}

impl std::error::Error for PlanError {}

/// Everything the planner needs for one computation.
pub struct PlanRequest<'a> {
    pub graph: &'a CanonicalGraph,
    pub manifest: &'a Manifest,
    /// Target revision stamped into the plan.
    pub revision: u64,
    /// Pending input edits: canonical input id → new payload.
    pub edits: &'a IndexMap<String, serde_json::Value>,
    pub context: &'a PlanContext,
    /// Concurrency token of the base manifest, recorded in the plan.
    pub manifest_hash: Option<&'a str>,
    pub created_at: &'a str,
}

type Combo = Vec<(String, usize)>;

fn indexed(base: &str, combo: &[(String, usize)]) -> String {
    let pairs: Vec<(&str, usize)> = combo.iter().map(|(d, i)| (d.as_str(), *i)).collect();
    ident::indexed_id(base, &pairs)
}

fn dim_size(dimensions: &BTreeMap<String, usize>, dim: &str) -> Result<usize, PlanError> {
    dimensions
        .get(dim)
        .copied()
        .ok_or_else(|| PlanError::MissingDimension { dimension: dim.to_string() })
}

/// All index combinations for the given dimensions, later dimensions
/// varying fastest.
fn combos(dims: &[&str], dimensions: &BTreeMap<String, usize>) -> Result<Vec<Combo>, PlanError> {
    let mut out: Vec<Combo> = vec![Vec::new()];
    for dim in dims {
        let size = dim_size(dimensions, dim)?;
        let mut next = Vec::with_capacity(out.len() * size);
        for partial in &out {
            for i in 0..size {
                let mut combo = partial.clone();
                combo.push((dim.to_string(), i));
                next.push(combo);
            }
        }
        out = next;
    }
    Ok(out)
}

/// Restrict a combo to the dimensions a node actually carries.
fn restrict(combo: &[(String, usize)], dims: &[&str]) -> Combo {
    combo.iter().filter(|(d, _)| dims.contains(&d.as_str())).cloned().collect()
}

/// Concrete ids of an upstream node as seen by one job instance. Shared
/// dimensions take the job's index; extra dimensions (fan-in aggregation)
/// expand fully.
fn expand_upstream_ids(
    base: &str,
    dims: &[&str],
    combo: &[(String, usize)],
    dimensions: &BTreeMap<String, usize>,
) -> Result<Vec<String>, PlanError> {
    let mut partials: Vec<Combo> = vec![Vec::new()];
    for dim in dims {
        if let Some((_, idx)) = combo.iter().find(|(d, _)| d == dim) {
            for p in &mut partials {
                p.push((dim.to_string(), *idx));
            }
        } else {
            let size = dim_size(dimensions, dim)?;
            let mut next = Vec::with_capacity(partials.len() * size);
            for p in &partials {
                for i in 0..size {
                    let mut q = p.clone();
                    q.push((dim.to_string(), i));
                    next.push(q);
                }
            }
            partials = next;
        }
    }
    Ok(partials.iter().map(|p| indexed(base, p)).collect())
}

/// Fingerprint of the configuration keys a guard reads, so a guard that
/// evaluates differently changes the producer's combined hash.
fn guard_fingerprint(condition: &Option<Condition>, config: &BTreeMap<String, serde_json::Value>) -> String {
    let Some(cond) = condition else { return String::new() };
    let mut keys: Vec<&str> =
        cond.any.iter().flatten().map(|clause| clause.key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        match config.get(key) {
            Some(v) => out.push_str(&v.to_string()),
            None => out.push_str("<unset>"),
        }
        out.push(';');
    }
    out
}

/// Deterministic topological order over the active node set (Kahn's
/// algorithm, sorted tie-breaking).
fn topo_order<'a>(
    nodes: &[&'a str],
    edges: &[(&'a str, &'a str)],
) -> Result<Vec<&'a str>, PlanError> {
    let mut in_degree: FxHashMap<&str, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for &(from, to) in edges {
        adjacency.entry(from).or_default().push(to);
        if let Some(d) = in_degree.get_mut(to) {
            *d += 1;
        }
    }

    let mut ready: Vec<&str> =
        in_degree.iter().filter(|(_, &d)| d == 0).map(|(&n, _)| n).collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.first().copied() {
        ready.remove(0);
        order.push(current);

        let mut newly_ready = Vec::new();
        if let Some(next) = adjacency.get(current) {
            for &n in next {
                if let Some(d) = in_degree.get_mut(n) {
                    *d -= 1;
                    if *d == 0 {
                        newly_ready.push(n);
                    }
                }
            }
        }
        for n in newly_ready {
            let pos = ready.binary_search(&n).unwrap_or_else(|p| p);
            ready.insert(pos, n);
        }
    }

    if order.len() != nodes.len() {
        let ordered: FxHashSet<&str> = order.iter().copied().collect();
        let mut members: Vec<String> = nodes
            .iter()
            .filter(|n| !ordered.contains(**n))
            .map(|n| n.to_string())
            .collect();
        members.sort();
        return Err(PlanError::Cycle { members });
    }
    Ok(order)
}

/// Upstream producers feeding `id`, discovered by walking back through
/// artifact chains until a producer or an input source. The flag records
/// whether fan-in aggregation was declared anywhere along the chain.
fn upstream_producers<'a>(
    graph: &'a CanonicalGraph,
    edge_active: &dyn Fn(&CanonicalEdge) -> bool,
    id: &str,
    aggregated: bool,
    out: &mut Vec<(&'a str, bool)>,
) {
    for edge in graph.edges_into_id(id) {
        if !edge_active(edge) {
            continue;
        }
        let aggregated = aggregated || edge.aggregate;
        match graph.node(&edge.from).map(|n| n.kind) {
            Some(NodeKind::Producer) => out.push((edge.from.as_str(), aggregated)),
            Some(NodeKind::Artifact) => {
                upstream_producers(graph, edge_active, &edge.from, aggregated, out)
            }
            _ => {}
        }
    }
}

impl CanonicalGraph {
    /// Like [`CanonicalGraph::edges_into`] but without borrowing the key.
    fn edges_into_id<'a>(&'a self, id: &str) -> Vec<&'a CanonicalEdge> {
        self.edges.iter().filter(|e| e.to == id).collect()
    }
}

/// Resolve a pass-through artifact (a section-boundary alias no producer
/// writes) to the artifact or input that concretely carries its content.
fn concrete_source<'a>(
    graph: &'a CanonicalGraph,
    edge_active: &dyn Fn(&CanonicalEdge) -> bool,
    id: &'a str,
) -> &'a str {
    let node = match graph.node(id) {
        Some(n) => n,
        None => return id,
    };
    if node.kind != NodeKind::Artifact {
        return id;
    }
    let incoming: Vec<&CanonicalEdge> =
        graph.edges.iter().filter(|e| e.to == id && edge_active(e)).collect();
    let produced = incoming
        .iter()
        .any(|e| graph.node(&e.from).map(|n| n.kind == NodeKind::Producer).unwrap_or(false));
    if produced {
        return id;
    }
    match incoming.as_slice() {
        [only] => concrete_source(graph, edge_active, &only.from),
        _ => id,
    }
}

/// Compute a minimal, correctly ordered execution plan.
pub fn compute_plan(req: &PlanRequest<'_>) -> Result<ExecutionPlan, PlanError> {
    let graph = req.graph;
    let config = &req.context.config;
    let dimensions = &req.context.dimensions;

    // -- Active set: guards evaluated, orphaned descendants removed --------
    // Processed in topological order so removal propagates forward.
    let all_ids: Vec<&str> = graph.nodes.keys().map(|k| k.as_str()).collect();
    let all_edges: Vec<(&str, &str)> =
        graph.edges.iter().map(|e| (e.from.as_str(), e.to.as_str())).collect();
    let order = topo_order(&all_ids, &all_edges)?;

    let mut active: FxHashSet<&str> = FxHashSet::default();
    for &id in &order {
        let node = graph.node(id).ok_or_else(|| PlanError::UnknownNode { id: id.to_string() })?;
        let guard_ok = node.condition.as_ref().map(|c| c.eval(config)).unwrap_or(true);
        if !guard_ok {
            continue;
        }
        let orphaned = graph.edges_into_id(id).iter().any(|e| {
            let edge_active = e.condition.as_ref().map(|c| c.eval(config)).unwrap_or(true);
            edge_active && !active.contains(e.from.as_str())
        });
        if !orphaned {
            active.insert(id);
        }
    }

    let edge_active = |e: &CanonicalEdge| {
        active.contains(e.from.as_str())
            && active.contains(e.to.as_str())
            && e.condition.as_ref().map(|c| c.eval(config)).unwrap_or(true)
    };

    // -- Base-level content hashes, in topological order -------------------
    let mut node_hash: FxHashMap<&str, String> = FxHashMap::default();
    for &id in &order {
        if !active.contains(id) {
            continue;
        }
        let node = graph.node(id).ok_or_else(|| PlanError::UnknownNode { id: id.to_string() })?;
        let hash = match node.kind {
            NodeKind::InputSource => {
                if let Some(payload) = req.edits.get(id) {
                    hasher::hash_value(payload).unwrap_or_else(|_| format!("absent:{}", id))
                } else if let Some(state) = req.manifest.inputs.get(id) {
                    state.hash.clone()
                } else {
                    format!("absent:{}", id)
                }
            }
            NodeKind::Producer => {
                let mut sources: Vec<(&str, &str)> = graph
                    .edges_into_id(id)
                    .iter()
                    .filter(|e| edge_active(e))
                    .map(|e| {
                        let from = e.from.as_str();
                        (from, node_hash.get(from).map(|h| h.as_str()).unwrap_or(""))
                    })
                    .collect();
                sources.sort_unstable();

                let guard = guard_fingerprint(&node.condition, config);
                let mut components: Vec<&str> = vec![id, guard.as_str()];
                for &(from, h) in &sources {
                    components.push(from);
                    components.push(h);
                }
                hasher::composite_hash(&components)
            }
            NodeKind::Artifact => {
                // An artifact is characterized by whatever feeds it.
                let mut sources: Vec<&str> = graph
                    .edges_into_id(id)
                    .iter()
                    .filter(|e| edge_active(e))
                    .map(|e| node_hash.get(e.from.as_str()).map(|h| h.as_str()).unwrap_or(""))
                    .collect();
                sources.sort_unstable();
                match sources.len() {
                    0 => format!("absent:{}", id),
                    1 => sources[0].to_string(),
                    _ => hasher::composite_hash(&sources),
                }
            }
        };
        node_hash.insert(id, hash);
    }

    // -- Expand producers, detect dirtiness, assign layers -----------------
    let mut dirty_instances: FxHashSet<String> = FxHashSet::default();
    let mut dirty_base_layer: FxHashMap<String, usize> = FxHashMap::default();
    let mut instance_layer: FxHashMap<String, usize> = FxHashMap::default();
    let mut jobs_by_layer: BTreeMap<usize, Vec<JobDescriptor>> = BTreeMap::new();

    for &id in &order {
        if !active.contains(id) {
            continue;
        }
        let node = match graph.node(id) {
            Some(n) if n.kind == NodeKind::Producer => n,
            _ => continue,
        };
        let combined = node_hash.get(id).cloned().unwrap_or_default();
        let dims = node.cardinality.dimensions();

        // Produced artifacts: active outgoing edges into Artifact nodes
        let produces: Vec<&CanonicalNode> = graph
            .edges
            .iter()
            .filter(|e| e.from == id && edge_active(e))
            .filter_map(|e| graph.node(&e.to))
            .filter(|n| n.kind == NodeKind::Artifact)
            .collect();

        // Upstream producers, for propagation and layering
        let mut upstream: Vec<(&str, bool)> = Vec::new();
        upstream_producers(graph, &edge_active, id, false, &mut upstream);

        for combo in combos(dims, dimensions)? {
            let job_id = indexed(id, &combo);

            let mut is_dirty = false;
            let mut max_upstream_layer: Option<usize> = None;

            for &(up, aggregated) in &upstream {
                let up_node = graph.node(up).ok_or_else(|| PlanError::UnknownNode { id: up.to_string() })?;
                let up_dims = up_node.cardinality.dimensions();
                let exact =
                    !aggregated && up_dims.iter().all(|d| combo.iter().any(|(cd, _)| cd == *d));
                if exact {
                    let up_instance = indexed(up, &restrict(&combo, up_dims));
                    if dirty_instances.contains(&up_instance) {
                        is_dirty = true;
                        let layer = instance_layer.get(&up_instance).copied().unwrap_or(0);
                        max_upstream_layer = Some(max_upstream_layer.map_or(layer, |m| m.max(layer)));
                    }
                } else if let Some(&layer) = dirty_base_layer.get(up) {
                    // Fan-in aggregation: any dirty instance upstream makes
                    // every consumer instance dirty.
                    is_dirty = true;
                    max_upstream_layer = Some(max_upstream_layer.map_or(layer, |m| m.max(layer)));
                }
            }

            let mut produced_ids = Vec::with_capacity(produces.len());
            for artifact in &produces {
                let a_id = indexed(&artifact.id, &restrict(&combo, artifact.cardinality.dimensions()));
                match req.manifest.artefacts.get(&a_id) {
                    Some(state)
                        if state.inputs_hash == combined && state.status == JobStatus::Succeeded => {}
                    _ => is_dirty = true,
                }
                produced_ids.push(a_id);
            }
            produced_ids.sort();
            produced_ids.dedup();

            if !is_dirty {
                continue;
            }

            // Concrete (index-expanded) input ids, with pass-through
            // artifacts resolved to their real source
            let mut input_ids = Vec::new();
            for edge in graph.edges_into_id(id) {
                if !edge_active(edge) {
                    continue;
                }
                let src_id = concrete_source(graph, &edge_active, &edge.from);
                let src = graph
                    .node(src_id)
                    .ok_or_else(|| PlanError::UnknownNode { id: src_id.to_string() })?;
                let src_dims = src.cardinality.dimensions();
                input_ids.extend(expand_upstream_ids(&src.id, src_dims, &combo, dimensions)?);
            }
            input_ids.sort();
            input_ids.dedup();

            let layer = max_upstream_layer.map(|m| m + 1).unwrap_or(0);
            dirty_instances.insert(job_id.clone());
            instance_layer.insert(job_id.clone(), layer);
            let base_entry = dirty_base_layer.entry(id.to_string()).or_insert(layer);
            *base_entry = (*base_entry).max(layer);

            let mut context = serde_json::Map::new();
            context.insert("inputsHash".to_string(), serde_json::json!(combined));
            if !combo.is_empty() {
                let indices: serde_json::Map<String, serde_json::Value> =
                    combo.iter().map(|(d, i)| (d.clone(), serde_json::json!(i))).collect();
                context.insert("indices".to_string(), serde_json::Value::Object(indices));
            }

            jobs_by_layer.entry(layer).or_default().push(JobDescriptor {
                job_id,
                producer: id.to_string(),
                inputs: input_ids,
                produces: produced_ids,
                context: serde_json::Value::Object(context),
            });
        }
    }

    // -- Assemble, stable order within each layer --------------------------
    let mut layers: Vec<Vec<JobDescriptor>> = Vec::with_capacity(jobs_by_layer.len());
    for (_, mut jobs) in jobs_by_layer {
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        layers.push(jobs);
    }

    let manifest_base_hash = match req.manifest_hash {
        Some(h) => h.to_string(),
        None => hasher::hash_value(req.manifest).unwrap_or_default(),
    };

    Ok(ExecutionPlan {
        revision: req.revision,
        manifest_base_hash,
        layers,
        created_at: req.created_at.to_string(),
    })
}
