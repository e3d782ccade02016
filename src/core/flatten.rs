//! Nested blueprint-tree flattening.
//!
//! A root blueprint references child blueprints by id; flattening
//! substitutes each child's subgraph into one flat node/edge table, with an
//! explicit namespace-path stack prefixing every internal reference.
//! Shorthand edge endpoints resolve through the declared node table —
//! never by name-pattern heuristics.

use super::compose::CompositionError;
use super::ident;
use super::types::*;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Flatten the tree rooted at `root_id` into a canonical graph.
pub fn flatten_tree(
    root_id: &str,
    registry: &IndexMap<String, BlueprintDoc>,
) -> Result<CanonicalGraph, CompositionError> {
    let root = registry
        .get(root_id)
        .ok_or_else(|| CompositionError::UnknownSection { reference: root_id.to_string() })?;

    let mut flat = Flattener { registry, graph: CanonicalGraph::default(), declared: FxHashMap::default() };
    let mut stack = Vec::new();
    let mut namespace = vec![root.id.clone()];
    flat.walk(root, &mut namespace, &[], &mut stack)?;

    detect_node_cycle(&flat.graph)?;
    Ok(flat.graph)
}

struct Flattener<'a> {
    registry: &'a IndexMap<String, BlueprintDoc>,
    graph: CanonicalGraph,
    /// Dotted path (without kind prefix) → canonical id.
    declared: FxHashMap<String, String>,
}

impl Flattener<'_> {
    fn walk(
        &mut self,
        doc: &BlueprintDoc,
        namespace: &mut Vec<String>,
        lift: &[String],
        stack: &mut Vec<String>,
    ) -> Result<(), CompositionError> {
        if stack.contains(&doc.id) {
            let mut path = stack.clone();
            path.push(doc.id.clone());
            return Err(CompositionError::CircularDependency { path });
        }
        stack.push(doc.id.clone());

        // Declare this blueprint's own nodes under the current namespace.
        for node in &doc.nodes {
            let id = ident::format_canonical_id(node.kind, namespace, &node.id)
                .map_err(|e| CompositionError::InvalidName { detail: e.to_string() })?;
            if self.graph.nodes.contains_key(&id) {
                return Err(CompositionError::InvalidName {
                    detail: format!("canonical id '{}' declared twice (namespace collision)", id),
                });
            }
            self.declared.insert(ident::id_path(&id).to_string(), id.clone());
            self.graph.nodes.insert(
                id.clone(),
                CanonicalNode {
                    id,
                    kind: node.kind,
                    cardinality: node.cardinality.lifted_by(lift),
                    condition: node.condition.clone(),
                },
            );
        }

        // Substitute children before resolving edges, so endpoints may
        // reach into child namespaces.
        for child_ref in &doc.children {
            let child = self.registry.get(&child_ref.blueprint).ok_or_else(|| {
                CompositionError::UnknownSection { reference: child_ref.blueprint.clone() }
            })?;
            let mut child_lift: Vec<String> = lift.to_vec();
            for dim in &child_ref.fan_out {
                if !child_lift.contains(dim) {
                    child_lift.push(dim.clone());
                }
            }
            namespace.push(child_ref.namespace_segment().to_string());
            self.walk(child, namespace, &child_lift, stack)?;
            namespace.pop();
        }

        // Resolve this blueprint's edges against the declared table.
        for edge in &doc.edges {
            let from = self.resolve_endpoint(&edge.from, namespace, &doc.id)?;
            let to = self.resolve_endpoint(&edge.to, namespace, &doc.id)?;
            self.graph.edges.push(CanonicalEdge {
                from,
                to,
                fan_out: edge.fan_out.clone(),
                condition: edge.condition.clone(),
                aggregate: edge.aggregate,
            });
        }

        stack.pop();
        Ok(())
    }

    /// Resolve a shorthand endpoint relative to `namespace`. The declared
    /// kind travels with the node; an undeclared reference is an error.
    fn resolve_endpoint(
        &self,
        reference: &str,
        namespace: &[String],
        blueprint: &str,
    ) -> Result<String, CompositionError> {
        let mut path = namespace.join(".");
        path.push('.');
        path.push_str(reference);

        self.declared.get(&path).cloned().ok_or_else(|| CompositionError::UnknownNode {
            reference: reference.to_string(),
            context: format!("edge in blueprint '{}'", blueprint),
        })
    }
}

/// Depth-first cycle detection over the flattened node graph, with an
/// explicit recursion stack so the reported path is the cycle itself.
pub fn detect_node_cycle(graph: &CanonicalGraph) -> Result<(), CompositionError> {
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for id in graph.nodes.keys() {
        adjacency.entry(id.as_str()).or_default();
    }
    for edge in &graph.edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        adjacency: &FxHashMap<&'a str, Vec<&'a str>>,
        marks: &mut FxHashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), CompositionError> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        if let Some(next) = adjacency.get(node) {
            for &n in next {
                match marks.get(n) {
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|&s| s == n).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(n.to_string());
                        return Err(CompositionError::CircularDependency { path });
                    }
                    Some(Mark::Done) => {}
                    None => visit(n, adjacency, marks, stack)?,
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks: FxHashMap<&str, Mark> = FxHashMap::default();
    let mut stack: Vec<&str> = Vec::new();
    for id in graph.nodes.keys() {
        if !marks.contains_key(id.as_str()) {
            visit(id, &adjacency, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}
