//! Canonical id formatting and resolution.
//!
//! Every graph node is addressed by one canonical string
//! `Kind:namespace.path.Name`, optionally suffixed with fan-out indices
//! (`[segment=2][image=0]`). Author-facing documents use short or dotted
//! names; this module maps between the two.

use super::types::{BlueprintDoc, NodeKind};
use indexmap::IndexMap;
use std::fmt;

/// Resolution failure, with enough detail to diagnose the lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Empty or whitespace-only key.
    EmptyKey,
    /// No known entry matches; `checked` names the locations searched.
    UnknownInput { key: String, checked: Vec<String> },
    /// More than one known entry matches a bare or dotted name.
    AmbiguousInput { key: String, candidates: Vec<String> },
    /// A producer-scoped name is missing its producer or key part.
    MalformedQualifiedName { raw: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "empty or whitespace key"),
            Self::UnknownInput { key, checked } => {
                write!(f, "unknown input '{}' (checked: {})", key, checked.join(", "))
            }
            Self::AmbiguousInput { key, candidates } => write!(
                f,
                "ambiguous input '{}' — candidates: {}",
                key,
                candidates.join(", ")
            ),
            Self::MalformedQualifiedName { raw } => {
                write!(f, "malformed producer-scoped name '{}'", raw)
            }
        }
    }
}

impl std::error::Error for ResolveError {}

fn require_segment(s: &str) -> Result<&str, ResolveError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::EmptyKey);
    }
    Ok(trimmed)
}

/// Format a canonical id from a namespace path and a short name.
pub fn format_canonical_id(
    kind: NodeKind,
    namespace: &[String],
    name: &str,
) -> Result<String, ResolveError> {
    let name = require_segment(name)?;
    let mut path = String::new();
    for segment in namespace {
        path.push_str(require_segment(segment)?);
        path.push('.');
    }
    path.push_str(name);
    Ok(format!("{}:{}", kind.prefix(), path))
}

/// Format the canonical id of a user-editable input.
pub fn format_canonical_input_id(namespace: &[String], name: &str) -> Result<String, ResolveError> {
    format_canonical_id(NodeKind::InputSource, namespace, name)
}

/// Append fan-out indices to a canonical id: `[segment=2][image=0]`.
pub fn indexed_id(base: &str, indices: &[(&str, usize)]) -> String {
    let mut id = base.to_string();
    for (dim, idx) in indices {
        id.push_str(&format!("[{}={}]", dim, idx));
    }
    id
}

/// Strip fan-out indices, returning the unexpanded canonical id.
pub fn base_id(id: &str) -> &str {
    match id.find('[') {
        Some(pos) => &id[..pos],
        None => id,
    }
}

/// The path part of a canonical id (after the kind prefix), indices
/// stripped.
pub fn id_path(id: &str) -> &str {
    let base = base_id(id);
    match base.split_once(':') {
        Some((_, path)) => path,
        None => base,
    }
}

/// Collect the canonical ids of every user-editable input in a blueprint
/// tree, walking children recursively under their namespaces.
pub fn collect_canonical_inputs(
    root: &BlueprintDoc,
    registry: &IndexMap<String, BlueprintDoc>,
) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut namespace = vec![root.id.clone()];
    collect_inputs_walk(root, registry, &mut namespace, &mut out)?;
    Ok(out)
}

fn collect_inputs_walk(
    doc: &BlueprintDoc,
    registry: &IndexMap<String, BlueprintDoc>,
    namespace: &mut Vec<String>,
    out: &mut Vec<String>,
) -> Result<(), String> {
    for node in &doc.nodes {
        if node.kind == NodeKind::InputSource {
            let id = format_canonical_input_id(namespace, &node.id)
                .map_err(|e| format!("invalid input name in '{}': {}", doc.id, e))?;
            out.push(id);
        }
    }
    for child_ref in &doc.children {
        let child = registry
            .get(&child_ref.blueprint)
            .ok_or_else(|| format!("blueprint '{}' references unknown child '{}'", doc.id, child_ref.blueprint))?;
        namespace.push(child_ref.namespace_segment().to_string());
        collect_inputs_walk(child, registry, namespace, out)?;
        namespace.pop();
    }
    Ok(())
}

/// Resolve an author-facing reference to a canonical id.
///
/// Accepts an already-canonical id (validated against `known`), a fully
/// qualified dotted path, or a bare name. A bare name must match exactly
/// one known entry.
pub fn resolve(raw: &str, known: &[String]) -> Result<String, ResolveError> {
    let key = require_segment(raw)?;

    if key.contains(':') {
        let base = base_id(key);
        if known.iter().any(|k| k == base) {
            return Ok(key.to_string());
        }
        return Err(ResolveError::UnknownInput {
            key: key.to_string(),
            checked: vec!["canonical id set".to_string()],
        });
    }

    let matches: Vec<&String> = if key.contains('.') {
        known.iter().filter(|id| id_path(id) == key).collect()
    } else {
        known
            .iter()
            .filter(|id| {
                id_path(id)
                    .rsplit('.')
                    .next()
                    .map(|last| last == key)
                    .unwrap_or(false)
            })
            .collect()
    };

    match matches.len() {
        1 => Ok(matches[0].clone()),
        0 => Err(ResolveError::UnknownInput {
            key: key.to_string(),
            checked: vec![
                "canonical id set".to_string(),
                if key.contains('.') { "qualified paths" } else { "bare names" }.to_string(),
            ],
        }),
        _ => Err(ResolveError::AmbiguousInput {
            key: key.to_string(),
            candidates: matches.into_iter().cloned().collect(),
        }),
    }
}

/// Canonical id of a producer-scoped override input (provider/model
/// selection for one producer). Symmetric with
/// [`parse_qualified_producer_name`].
pub fn format_producer_scoped_input_id(producer: &str, key: &str) -> Result<String, ResolveError> {
    let producer = require_segment(producer)?;
    let key = require_segment(key)?;
    let path = producer.strip_prefix("Producer:").unwrap_or(producer);
    Ok(format!("Input:{}#{}", path, key))
}

/// Split a producer-scoped name back into `(producer path, key)`.
pub fn parse_qualified_producer_name(raw: &str) -> Result<(String, String), ResolveError> {
    let trimmed = require_segment(raw)?;
    let body = trimmed.strip_prefix("Input:").unwrap_or(trimmed);
    let (producer, key) = body
        .split_once('#')
        .ok_or_else(|| ResolveError::MalformedQualifiedName { raw: raw.to_string() })?;
    if producer.trim().is_empty() || key.trim().is_empty() {
        return Err(ResolveError::MalformedQualifiedName { raw: raw.to_string() });
    }
    Ok((producer.trim().to_string(), key.trim().to_string()))
}
