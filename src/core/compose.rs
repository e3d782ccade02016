//! Section composition — wires discrete sections with typed ports into one
//! canonical graph.
//!
//! Ports connect explicitly, or automatically when enabled and exactly one
//! compatible unconnected pair shares a name. Composition validates required
//! inputs, cardinality compatibility, and acyclicity before emitting the
//! flat graph.

use super::ident;
use super::types::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Fatal blueprint-load failure. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    RequiredInputMissing { section: String, port: String },
    IncompatibleCardinality { from: String, to: String, from_cardinality: String, to_cardinality: String },
    CircularDependency { path: Vec<String> },
    UnknownNode { reference: String, context: String },
    UnknownSection { reference: String },
    UnknownPort { reference: String },
    DuplicateSection { id: String },
    InvalidName { detail: String },
}

impl fmt::Display for CompositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequiredInputMissing { section, port } => {
                write!(f, "required_input_missing: port '{}' of section '{}' is not satisfied", port, section)
            }
            Self::IncompatibleCardinality { from, to, from_cardinality, to_cardinality } => write!(
                f,
                "incompatible cardinality: {} ({}) cannot feed {} ({})",
                from, from_cardinality, to, to_cardinality
            ),
            Self::CircularDependency { path } => {
                write!(f, "circular dependency: {}", path.join(" → "))
            }
            Self::UnknownNode { reference, context } => {
                write!(f, "unknown node '{}' referenced by {}", reference, context)
            }
            Self::UnknownSection { reference } => write!(f, "unknown section '{}'", reference),
            Self::UnknownPort { reference } => write!(f, "unknown port '{}'", reference),
            Self::DuplicateSection { id } => write!(f, "duplicate section id '{}'", id),
            Self::InvalidName { detail } => write!(f, "invalid name: {}", detail),
        }
    }
}

impl std::error::Error for CompositionError {}

/// Result of composing sections: the flat graph, the full connection list
/// (explicit plus auto-inferred), and non-fatal warnings.
#[derive(Debug, Clone)]
pub struct Composition {
    pub graph: CanonicalGraph,
    pub connections: Vec<Connection>,
    pub warnings: Vec<String>,
}

/// Parse a `section.port` reference.
fn parse_port_ref(raw: &str) -> Result<(&str, &str), CompositionError> {
    raw.split_once('.')
        .filter(|(s, p)| !s.is_empty() && !p.is_empty())
        .ok_or_else(|| CompositionError::UnknownPort { reference: raw.to_string() })
}

/// A connection with both endpoints resolved to (section, port) pairs.
struct ResolvedConnection {
    from_section: String,
    from_port: Port,
    to_section: String,
    to_port: Port,
}

fn find_port<'a>(ports: &'a [Port], name: &str) -> Option<&'a Port> {
    ports.iter().find(|p| p.name == name)
}

/// Can an output of `from` cardinality feed an input declared as `to`?
/// A `single` output broadcasts into any fan-out; an expanded output only
/// feeds a narrower input when the consumer declares fan-in aggregation.
fn cardinality_compatible(from: Cardinality, to: Cardinality, to_aggregate: bool) -> bool {
    if from == to || from == Cardinality::Single {
        return true;
    }
    to_aggregate
}

/// Compose sections into one canonical graph.
///
/// `namespace` prefixes every canonical id (usually the pipeline name), so
/// section composition and nested-tree flattening of the same structure
/// yield identical ids.
pub fn compose_sections(
    sections: &[BlueprintSection],
    explicit: &[Connection],
    auto_connect: bool,
    namespace: Option<&str>,
) -> Result<Composition, CompositionError> {
    let mut warnings = Vec::new();

    // Section and node tables
    let mut by_id: FxHashMap<&str, &BlueprintSection> = FxHashMap::default();
    for section in sections {
        if by_id.insert(section.id.as_str(), section).is_some() {
            return Err(CompositionError::DuplicateSection { id: section.id.clone() });
        }
    }

    let mut node_kinds: FxHashMap<(String, String), NodeKind> = FxHashMap::default();
    for section in sections {
        for node in &section.nodes {
            node_kinds.insert((section.id.clone(), node.id.clone()), node.kind);
        }
    }

    // Internal edge endpoints must reference declared nodes
    for section in sections {
        for edge in &section.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !node_kinds.contains_key(&(section.id.clone(), endpoint.clone())) {
                    return Err(CompositionError::UnknownNode {
                        reference: endpoint.clone(),
                        context: format!("edge in section '{}'", section.id),
                    });
                }
            }
        }
    }

    // Port references on ports themselves
    for section in sections {
        for port in section.inputs.iter().chain(&section.outputs) {
            if !node_kinds.contains_key(&(section.id.clone(), port.node.clone())) {
                return Err(CompositionError::UnknownNode {
                    reference: port.node.clone(),
                    context: format!("port '{}' of section '{}'", port.name, section.id),
                });
            }
        }
    }

    // Resolve explicit connections
    let mut resolved: Vec<ResolvedConnection> = Vec::new();
    let mut all_connections: Vec<Connection> = Vec::new();
    for conn in explicit {
        let (from_section, from_port_name) = parse_port_ref(&conn.from)?;
        let (to_section, to_port_name) = parse_port_ref(&conn.to)?;

        let from = by_id
            .get(from_section)
            .ok_or_else(|| CompositionError::UnknownSection { reference: from_section.to_string() })?;
        let to = by_id
            .get(to_section)
            .ok_or_else(|| CompositionError::UnknownSection { reference: to_section.to_string() })?;

        let from_port = find_port(&from.outputs, from_port_name)
            .ok_or_else(|| CompositionError::UnknownPort { reference: conn.from.clone() })?;
        let to_port = find_port(&to.inputs, to_port_name)
            .ok_or_else(|| CompositionError::UnknownPort { reference: conn.to.clone() })?;

        resolved.push(ResolvedConnection {
            from_section: from.id.clone(),
            from_port: from_port.clone(),
            to_section: to.id.clone(),
            to_port: to_port.clone(),
        });
        all_connections.push(conn.clone());
    }

    // Auto-connection: one compatible unconnected pair sharing a name
    if auto_connect {
        let connected_inputs: FxHashSet<(String, String)> = resolved
            .iter()
            .map(|c| (c.to_section.clone(), c.to_port.name.clone()))
            .collect();
        let connected_outputs: FxHashSet<(String, String)> = resolved
            .iter()
            .map(|c| (c.from_section.clone(), c.from_port.name.clone()))
            .collect();

        let mut by_name: FxHashMap<&str, (Vec<(&BlueprintSection, &Port)>, Vec<(&BlueprintSection, &Port)>)> =
            FxHashMap::default();
        for section in sections {
            for port in &section.outputs {
                if !connected_outputs.contains(&(section.id.clone(), port.name.clone())) {
                    by_name.entry(port.name.as_str()).or_default().0.push((section, port));
                }
            }
            for port in &section.inputs {
                if !connected_inputs.contains(&(section.id.clone(), port.name.clone())) {
                    by_name.entry(port.name.as_str()).or_default().1.push((section, port));
                }
            }
        }

        let mut names: Vec<&str> = by_name.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            let (outputs, inputs) = &by_name[name];
            let pairs: Vec<_> = outputs
                .iter()
                .flat_map(|o| inputs.iter().map(move |i| (o, i)))
                .filter(|(o, i)| cardinality_compatible(o.1.cardinality, i.1.cardinality, i.1.aggregate))
                .collect();
            match pairs.len() {
                1 => {
                    let ((osec, oport), (isec, iport)) = pairs[0];
                    resolved.push(ResolvedConnection {
                        from_section: osec.id.clone(),
                        from_port: (*oport).clone(),
                        to_section: isec.id.clone(),
                        to_port: (*iport).clone(),
                    });
                    all_connections.push(Connection {
                        from: format!("{}.{}", osec.id, oport.name),
                        to: format!("{}.{}", isec.id, iport.name),
                    });
                }
                0 => {}
                n => warnings.push(format!(
                    "auto-connect skipped port name '{}': {} compatible pairs",
                    name, n
                )),
            }
        }
    }

    // Cardinality compatibility on every connection
    for conn in &resolved {
        if !cardinality_compatible(conn.from_port.cardinality, conn.to_port.cardinality, conn.to_port.aggregate) {
            return Err(CompositionError::IncompatibleCardinality {
                from: format!("{}.{}", conn.from_section, conn.from_port.name),
                to: format!("{}.{}", conn.to_section, conn.to_port.name),
                from_cardinality: conn.from_port.cardinality.to_string(),
                to_cardinality: conn.to_port.cardinality.to_string(),
            });
        }
    }

    // Required input ports: satisfied by a connection or by a user-supplied
    // input node
    for section in sections {
        for port in &section.inputs {
            if !port.required {
                continue;
            }
            let connected = resolved
                .iter()
                .any(|c| c.to_section == section.id && c.to_port.name == port.name);
            let user_supplied =
                node_kinds.get(&(section.id.clone(), port.node.clone())) == Some(&NodeKind::InputSource);
            if !connected && !user_supplied {
                return Err(CompositionError::RequiredInputMissing {
                    section: section.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }

    // Required outputs with no consumer: warning only
    for section in sections {
        for port in &section.outputs {
            if port.required
                && !resolved
                    .iter()
                    .any(|c| c.from_section == section.id && c.from_port.name == port.name)
            {
                warnings.push(format!(
                    "required output '{}.{}' has no consumer",
                    section.id, port.name
                ));
            }
        }
    }

    // Section-level cycle check over the connection graph
    detect_section_cycle(sections, &resolved)?;

    // Emit the canonical graph
    let root: Vec<String> = namespace.map(|n| vec![n.to_string()]).unwrap_or_default();
    let mut graph = CanonicalGraph::default();
    let mut canonical: FxHashMap<(String, String), String> = FxHashMap::default();

    for section in sections {
        let mut ns = root.clone();
        ns.push(section.id.clone());
        for node in &section.nodes {
            let id = ident::format_canonical_id(node.kind, &ns, &node.id)
                .map_err(|e| CompositionError::InvalidName { detail: e.to_string() })?;
            canonical.insert((section.id.clone(), node.id.clone()), id.clone());
            graph.nodes.insert(
                id.clone(),
                CanonicalNode {
                    id,
                    kind: node.kind,
                    cardinality: node.cardinality,
                    condition: node.condition.clone(),
                },
            );
        }
    }

    for section in sections {
        for edge in &section.edges {
            graph.edges.push(CanonicalEdge {
                from: canonical[&(section.id.clone(), edge.from.clone())].clone(),
                to: canonical[&(section.id.clone(), edge.to.clone())].clone(),
                fan_out: edge.fan_out.clone(),
                condition: edge.condition.clone(),
                aggregate: edge.aggregate,
            });
        }
    }

    for conn in &resolved {
        graph.edges.push(CanonicalEdge {
            from: canonical[&(conn.from_section.clone(), conn.from_port.node.clone())].clone(),
            to: canonical[&(conn.to_section.clone(), conn.to_port.node.clone())].clone(),
            fan_out: vec![],
            condition: None,
            aggregate: conn.to_port.aggregate,
        });
    }

    Ok(Composition { graph, connections: all_connections, warnings })
}

/// Depth-first cycle detection over section connections, with an explicit
/// recursion stack so the reported path is the discovered cycle itself.
fn detect_section_cycle(
    sections: &[BlueprintSection],
    connections: &[ResolvedConnection],
) -> Result<(), CompositionError> {
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for section in sections {
        adjacency.entry(section.id.as_str()).or_default();
    }
    for conn in connections {
        adjacency
            .entry(conn.from_section.as_str())
            .or_default()
            .push(conn.to_section.as_str());
    }

    let mut visited: FxHashSet<&str> = FxHashSet::default();
    let mut stack: Vec<&str> = Vec::new();
    let mut on_stack: FxHashSet<&str> = FxHashSet::default();

    fn visit<'a>(
        node: &'a str,
        adjacency: &FxHashMap<&'a str, Vec<&'a str>>,
        visited: &mut FxHashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut FxHashSet<&'a str>,
    ) -> Result<(), CompositionError> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(next) = adjacency.get(node) {
            for &n in next {
                if on_stack.contains(n) {
                    let start = stack.iter().position(|&s| s == n).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(n.to_string());
                    return Err(CompositionError::CircularDependency { path });
                }
                if !visited.contains(n) {
                    visit(n, adjacency, visited, stack, on_stack)?;
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        Ok(())
    }

    let mut roots: Vec<&str> = adjacency.keys().copied().collect();
    roots.sort_unstable();
    for root in roots {
        if !visited.contains(root) {
            visit(root, &adjacency, &mut visited, &mut stack, &mut on_stack)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, kind: NodeKind) -> NodeDecl {
        NodeDecl { id: id.to_string(), kind, cardinality: Cardinality::Single, condition: None }
    }

    fn port(name: &str, node: &str, required: bool) -> Port {
        Port {
            name: name.to_string(),
            node: node.to_string(),
            cardinality: Cardinality::Single,
            required,
            aggregate: false,
        }
    }

    /// script section: Topic input feeds a Write producer emitting a Text
    /// artifact, exported through the `scriptText` output port.
    fn script_section() -> BlueprintSection {
        BlueprintSection {
            id: "script".to_string(),
            label: Some("Script writing".to_string()),
            inputs: vec![],
            outputs: vec![port("scriptText", "Text", true)],
            nodes: vec![
                node("Topic", NodeKind::InputSource),
                node("Write", NodeKind::Producer),
                node("Text", NodeKind::Artifact),
            ],
            edges: vec![
                EdgeDecl { from: "Topic".into(), to: "Write".into(), fan_out: vec![], condition: None, aggregate: false },
                EdgeDecl { from: "Write".into(), to: "Text".into(), fan_out: vec![], condition: None, aggregate: false },
            ],
        }
    }

    /// audio section: requires a narrationScript input, synthesizes Speech.
    fn audio_section() -> BlueprintSection {
        BlueprintSection {
            id: "audio".to_string(),
            label: None,
            inputs: vec![port("narrationScript", "Script", true)],
            outputs: vec![],
            nodes: vec![
                node("Script", NodeKind::Artifact),
                node("Synthesize", NodeKind::Producer),
                node("Speech", NodeKind::Artifact),
            ],
            edges: vec![
                EdgeDecl { from: "Script".into(), to: "Synthesize".into(), fan_out: vec![], condition: None, aggregate: false },
                EdgeDecl { from: "Synthesize".into(), to: "Speech".into(), fan_out: vec![], condition: None, aggregate: false },
            ],
        }
    }

    #[test]
    fn test_required_input_missing() {
        let sections = vec![script_section(), audio_section()];
        let err = compose_sections(&sections, &[], false, None).unwrap_err();
        assert_eq!(
            err,
            CompositionError::RequiredInputMissing {
                section: "audio".to_string(),
                port: "narrationScript".to_string(),
            }
        );
        assert!(err.to_string().contains("required_input_missing"));
        assert!(err.to_string().contains("narrationScript"));
    }

    #[test]
    fn test_explicit_connection_satisfies() {
        let sections = vec![script_section(), audio_section()];
        let connections = vec![Connection { from: "script.scriptText".into(), to: "audio.narrationScript".into() }];
        let composition = compose_sections(&sections, &connections, false, Some("movie")).unwrap();

        assert!(composition.graph.nodes.contains_key("Producer:movie.script.Write"));
        assert!(composition.graph.nodes.contains_key("Artifact:movie.audio.Speech"));
        // Connection edge bridges the sections
        assert!(composition
            .graph
            .edges
            .iter()
            .any(|e| e.from == "Artifact:movie.script.Text" && e.to == "Artifact:movie.audio.Script"));
    }

    #[test]
    fn test_auto_connect_single_pair() {
        let mut script = script_section();
        let mut audio = audio_section();
        // Same port name on both sides
        script.outputs[0].name = "narration".to_string();
        audio.inputs[0].name = "narration".to_string();

        let composition = compose_sections(&[script, audio], &[], true, None).unwrap();
        assert_eq!(composition.connections.len(), 1);
        assert_eq!(composition.connections[0].from, "script.narration");
        assert_eq!(composition.connections[0].to, "audio.narration");
    }

    #[test]
    fn test_auto_connect_ambiguous_is_skipped() {
        let mut script = script_section();
        script.outputs[0].name = "narration".to_string();
        let mut audio_a = audio_section();
        audio_a.inputs[0].name = "narration".to_string();
        audio_a.inputs[0].required = false;
        let mut audio_b = audio_section();
        audio_b.id = "audio2".to_string();
        audio_b.inputs[0].name = "narration".to_string();
        audio_b.inputs[0].required = false;

        let composition = compose_sections(&[script, audio_a, audio_b], &[], true, None).unwrap();
        assert!(composition.connections.is_empty());
        assert!(composition.warnings.iter().any(|w| w.contains("auto-connect")));
    }

    #[test]
    fn test_incompatible_cardinality() {
        let mut script = script_section();
        script.outputs[0].cardinality = Cardinality::PerSegment;
        let audio = audio_section();
        let connections = vec![Connection { from: "script.scriptText".into(), to: "audio.narrationScript".into() }];

        let err = compose_sections(&[script, audio], &connections, false, None).unwrap_err();
        match err {
            CompositionError::IncompatibleCardinality { from_cardinality, to_cardinality, .. } => {
                assert_eq!(from_cardinality, "perSegment");
                assert_eq!(to_cardinality, "single");
            }
            other => panic!("expected IncompatibleCardinality, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_consumer_accepts_fan_in() {
        let mut script = script_section();
        script.outputs[0].cardinality = Cardinality::PerSegment;
        let mut audio = audio_section();
        audio.inputs[0].aggregate = true;
        let connections = vec![Connection { from: "script.scriptText".into(), to: "audio.narrationScript".into() }];

        let composition = compose_sections(&[script, audio], &connections, false, None).unwrap();
        let bridge = composition
            .graph
            .edges
            .iter()
            .find(|e| e.to == "Artifact:audio.Script")
            .unwrap();
        assert!(bridge.aggregate);
    }

    #[test]
    fn test_single_output_broadcasts_into_fanout() {
        let script = script_section();
        let mut audio = audio_section();
        audio.inputs[0].cardinality = Cardinality::PerSegment;
        let connections = vec![Connection { from: "script.scriptText".into(), to: "audio.narrationScript".into() }];
        assert!(compose_sections(&[script, audio], &connections, false, None).is_ok());
    }

    #[test]
    fn test_circular_dependency_reports_path() {
        let mut a = script_section();
        a.id = "a".to_string();
        a.inputs = vec![port("loop_in", "Topic", false)];
        let mut b = script_section();
        b.id = "b".to_string();
        b.inputs = vec![port("loop_in", "Topic", false)];

        let connections = vec![
            Connection { from: "a.scriptText".into(), to: "b.loop_in".into() },
            Connection { from: "b.scriptText".into(), to: "a.loop_in".into() },
        ];
        let err = compose_sections(&[a, b], &connections, false, None).unwrap_err();
        match err {
            CompositionError::CircularDependency { path } => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CircularDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_unconsumed_required_output_is_warning() {
        let mut audio = audio_section();
        audio.inputs[0].required = false;
        let composition = compose_sections(&[script_section(), audio], &[], false, None).unwrap();
        assert!(composition
            .warnings
            .iter()
            .any(|w| w.contains("script.scriptText") && w.contains("no consumer")));
    }

    #[test]
    fn test_unknown_node_in_edge() {
        let mut script = script_section();
        script.edges.push(EdgeDecl {
            from: "Ghost".into(),
            to: "Write".into(),
            fan_out: vec![],
            condition: None,
            aggregate: false,
        });
        let err = compose_sections(&[script], &[], false, None).unwrap_err();
        assert!(matches!(err, CompositionError::UnknownNode { .. }));
    }

    #[test]
    fn test_unknown_section_and_port() {
        let sections = vec![script_section(), audio_section()];
        let bad_section = vec![Connection { from: "ghost.scriptText".into(), to: "audio.narrationScript".into() }];
        assert!(matches!(
            compose_sections(&sections, &bad_section, false, None).unwrap_err(),
            CompositionError::UnknownSection { .. }
        ));

        let bad_port = vec![Connection { from: "script.ghost".into(), to: "audio.narrationScript".into() }];
        assert!(matches!(
            compose_sections(&sections, &bad_port, false, None).unwrap_err(),
            CompositionError::UnknownPort { .. }
        ));
    }

    #[test]
    fn test_duplicate_section() {
        let err = compose_sections(&[script_section(), script_section()], &[], false, None).unwrap_err();
        assert!(matches!(err, CompositionError::DuplicateSection { .. }));
    }

    #[test]
    fn test_input_source_port_needs_no_connection() {
        // A required input port bound to a user-supplied InputSource is
        // satisfied without a connection.
        let section = BlueprintSection {
            id: "script".to_string(),
            label: None,
            inputs: vec![port("topic", "Topic", true)],
            outputs: vec![],
            nodes: vec![node("Topic", NodeKind::InputSource), node("Write", NodeKind::Producer)],
            edges: vec![EdgeDecl {
                from: "Topic".into(),
                to: "Write".into(),
                fan_out: vec![],
                condition: None,
                aggregate: false,
            }],
        };
        assert!(compose_sections(&[section], &[], false, None).is_ok());
    }
}
