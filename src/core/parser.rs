//! Pipeline document parsing and validation.
//!
//! Parses `pipeline.yaml` and validates structural constraints before
//! composition:
//! - Version must be "1.0"
//! - Exactly one composition style (sections or blueprints)
//! - Ids unique, child references known

use super::compose::{compose_sections, Composition, CompositionError};
use super::flatten::flatten_tree;
use super::types::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Authored pipeline document: either wired sections or a nested blueprint
/// tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDoc {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Pipeline name; used as the canonical id namespace for sections.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Section composition style
    #[serde(default)]
    pub sections: Vec<BlueprintSection>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Infer connections for unique matching port names.
    #[serde(default)]
    pub auto_connect: bool,

    /// Nested-tree composition style
    #[serde(default)]
    pub blueprints: Vec<BlueprintDoc>,

    /// Root blueprint id (defaults to the first declared blueprint).
    #[serde(default)]
    pub root: Option<String>,
}

impl PipelineDoc {
    pub fn blueprint_registry(&self) -> IndexMap<String, BlueprintDoc> {
        self.blueprints.iter().map(|b| (b.id.clone(), b.clone())).collect()
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref().or_else(|| self.blueprints.first().map(|b| b.id.as_str()))
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a pipeline document from disk.
pub fn parse_pipeline_file(path: &Path) -> Result<PipelineDoc, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_pipeline(&content)
}

/// Parse a pipeline document from a YAML string.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDoc, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

fn push_error(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Validate a parsed document. Returns a list of errors (empty = valid).
pub fn validate_document(doc: &PipelineDoc) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if doc.version != "1.0" {
        push_error(&mut errors, format!("version must be \"1.0\", got \"{}\"", doc.version));
    }

    if doc.name.trim().is_empty() {
        push_error(&mut errors, "name must not be empty".to_string());
    }

    match (doc.sections.is_empty(), doc.blueprints.is_empty()) {
        (true, true) => {
            push_error(&mut errors, "document declares neither sections nor blueprints".to_string());
        }
        (false, false) => {
            push_error(
                &mut errors,
                "document declares both sections and blueprints — choose one composition style".to_string(),
            );
        }
        _ => {}
    }

    // Section style
    let mut seen_sections = HashSet::new();
    for section in &doc.sections {
        if !seen_sections.insert(&section.id) {
            push_error(&mut errors, format!("duplicate section id '{}'", section.id));
        }
        check_unique_nodes(&section.nodes, &section.id, &mut errors);
    }
    if !doc.sections.is_empty() && doc.root.is_some() {
        push_error(&mut errors, "root only applies to the blueprints style".to_string());
    }

    // Nested style
    let mut seen_blueprints = HashSet::new();
    for blueprint in &doc.blueprints {
        if !seen_blueprints.insert(&blueprint.id) {
            push_error(&mut errors, format!("duplicate blueprint id '{}'", blueprint.id));
        }
        check_unique_nodes(&blueprint.nodes, &blueprint.id, &mut errors);

        for child in &blueprint.children {
            if !doc.blueprints.iter().any(|b| b.id == child.blueprint) {
                push_error(
                    &mut errors,
                    format!("blueprint '{}' references unknown child '{}'", blueprint.id, child.blueprint),
                );
            }
        }
    }
    if !doc.blueprints.is_empty() {
        if let Some(root) = &doc.root {
            if !doc.blueprints.iter().any(|b| &b.id == root) {
                push_error(&mut errors, format!("root references unknown blueprint '{}'", root));
            }
        }
    }

    errors
}

fn check_unique_nodes(nodes: &[NodeDecl], owner: &str, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(&node.id) {
            push_error(errors, format!("duplicate node id '{}' in '{}'", node.id, owner));
        }
    }
}

/// Compile a validated document into a canonical graph, dispatching on the
/// composition style.
pub fn compile(doc: &PipelineDoc) -> Result<Composition, CompositionError> {
    if !doc.sections.is_empty() {
        return compose_sections(&doc.sections, &doc.connections, doc.auto_connect, Some(&doc.name));
    }

    let root = doc
        .root_id()
        .ok_or_else(|| CompositionError::UnknownSection { reference: "<root>".to_string() })?;
    let registry = doc.blueprint_registry();
    let graph = flatten_tree(root, &registry)?;
    Ok(Composition { graph, connections: Vec::new(), warnings: Vec::new() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED_YAML: &str = r#"
version: "1.0"
name: explainer
blueprints:
  - id: movie
    edges:
      - from: script.Text
        to: narration.Script
    children:
      - blueprint: script
      - blueprint: narration
        fan_out: [segment]
  - id: script
    nodes:
      - id: Topic
        kind: input_source
      - id: Write
        kind: producer
      - id: Text
        kind: artifact
    edges:
      - from: Topic
        to: Write
      - from: Write
        to: Text
  - id: narration
    nodes:
      - id: Script
        kind: artifact
      - id: Synthesize
        kind: producer
      - id: Speech
        kind: artifact
    edges:
      - from: Script
        to: Synthesize
      - from: Synthesize
        to: Speech
root: movie
"#;

    #[test]
    fn test_parse_nested_style() {
        let doc = parse_pipeline(NESTED_YAML).unwrap();
        assert_eq!(doc.name, "explainer");
        assert_eq!(doc.blueprints.len(), 3);
        assert_eq!(doc.root_id(), Some("movie"));
        assert!(validate_document(&doc).is_empty());
    }

    #[test]
    fn test_compile_nested_style() {
        let doc = parse_pipeline(NESTED_YAML).unwrap();
        let composition = compile(&doc).unwrap();
        assert!(composition.graph.nodes.contains_key("Producer:movie.script.Write"));
        // fan_out lifted the narration child per segment
        let synth = composition.graph.node("Producer:movie.narration.Synthesize").unwrap();
        assert_eq!(synth.cardinality, Cardinality::PerSegment);
    }

    #[test]
    fn test_parse_section_style() {
        let yaml = r#"
version: "1.0"
name: shorts
auto_connect: true
sections:
  - id: script
    nodes:
      - id: Topic
        kind: input_source
      - id: Write
        kind: producer
      - id: Text
        kind: artifact
    edges:
      - from: Topic
        to: Write
      - from: Write
        to: Text
    outputs:
      - name: narration
        node: Text
        required: true
  - id: audio
    nodes:
      - id: Script
        kind: artifact
      - id: Synthesize
        kind: producer
    edges:
      - from: Script
        to: Synthesize
    inputs:
      - name: narration
        node: Script
        required: true
"#;
        let doc = parse_pipeline(yaml).unwrap();
        assert!(validate_document(&doc).is_empty());
        let composition = compile(&doc).unwrap();
        assert_eq!(composition.connections.len(), 1, "auto-connected by shared name");
        assert!(composition.graph.nodes.contains_key("Producer:shorts.audio.Synthesize"));
    }

    #[test]
    fn test_bad_version() {
        let doc = parse_pipeline("version: \"2.0\"\nname: x\nblueprints:\n  - id: a\n").unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("version")));
    }

    #[test]
    fn test_empty_document() {
        let doc = parse_pipeline("version: \"1.0\"\nname: x\n").unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("neither sections nor blueprints")));
    }

    #[test]
    fn test_both_styles_rejected() {
        let yaml = r#"
version: "1.0"
name: x
sections:
  - id: s
blueprints:
  - id: b
"#;
        let doc = parse_pipeline(yaml).unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("choose one composition style")));
    }

    #[test]
    fn test_unknown_child_reference() {
        let yaml = r#"
version: "1.0"
name: x
blueprints:
  - id: movie
    children:
      - blueprint: ghost
"#;
        let doc = parse_pipeline(yaml).unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("unknown child 'ghost'")));
    }

    #[test]
    fn test_duplicate_node_id() {
        let yaml = r#"
version: "1.0"
name: x
blueprints:
  - id: movie
    nodes:
      - id: A
        kind: producer
      - id: A
        kind: artifact
"#;
        let doc = parse_pipeline(yaml).unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("duplicate node id 'A'")));
    }

    #[test]
    fn test_unknown_root() {
        let yaml = r#"
version: "1.0"
name: x
blueprints:
  - id: movie
root: ghost
"#;
        let doc = parse_pipeline(yaml).unwrap();
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.message.contains("unknown blueprint 'ghost'")));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, NESTED_YAML).unwrap();
        let doc = parse_pipeline_file(&path).unwrap();
        assert_eq!(doc.name, "explainer");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(parse_pipeline("not: [valid: yaml: {{").is_err());
    }

    #[test]
    fn test_condition_in_yaml() {
        let yaml = r#"
version: "1.0"
name: x
blueprints:
  - id: movie
    nodes:
      - id: Animate
        kind: producer
        condition:
          any:
            - - key: use_video
                equals: true
"#;
        let doc = parse_pipeline(yaml).unwrap();
        let cond = doc.blueprints[0].nodes[0].condition.as_ref().unwrap();
        assert_eq!(cond.any[0][0].key, "use_video");
        assert_eq!(cond.any[0][0].equals, serde_json::json!(true));
    }
}
