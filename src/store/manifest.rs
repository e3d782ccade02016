//! Manifest service — derives the current project snapshot from the event
//! log and guards writes with optimistic concurrency.
//!
//! A manifest is a pure fold over the event log; the saved snapshot is a
//! cache of that fold. `save_manifest` is a hash compare-and-swap: the
//! caller proves it saw the manifest currently on disk, or the write is
//! rejected.

use crate::core::types::{ArtefactEvent, ArtefactState, InputEvent, InputState, Manifest};
use crate::store::{self, eventlog, hasher, Store};
use std::fmt;

/// Manifest-service failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// No snapshot and no events yet. Recoverable: seed an empty manifest.
    NotFound { project: String },
    /// The manifest on disk does not match the caller's concurrency token.
    /// Recoverable by reload-and-retry.
    ConcurrentModification { expected: Option<String>, actual: Option<String> },
    /// Revisions must strictly increase per project.
    NonMonotonicRevision { current: u64, proposed: u64 },
    Storage(String),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { project } => write!(f, "no manifest for project '{}'", project),
            Self::ConcurrentModification { expected, actual } => write!(
                f,
                "concurrent modification: expected {}, found {}",
                expected.as_deref().unwrap_or("<none>"),
                actual.as_deref().unwrap_or("<none>"),
            ),
            Self::NonMonotonicRevision { current, proposed } => write!(
                f,
                "revision {} does not supersede current revision {}",
                proposed, current
            ),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<String> for ManifestError {
    fn from(msg: String) -> Self {
        Self::Storage(msg)
    }
}

/// A manifest plus its optimistic-concurrency token. The hash is of the
/// snapshot currently stored on disk; `None` when the manifest was derived
/// from events alone and nothing is stored yet.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub hash: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CurrentPointer {
    revision: u64,
}

fn apply_input(manifest: &mut Manifest, ev: InputEvent) {
    manifest.inputs.insert(
        ev.id,
        InputState {
            hash: ev.hash,
            revision: ev.revision,
            payload: ev.payload,
            edited_by: ev.edited_by,
            updated_at: ev.created_at,
        },
    );
}

fn apply_artefact(manifest: &mut Manifest, ev: ArtefactEvent) {
    manifest.artefacts.insert(
        ev.artefact_id,
        ArtefactState {
            inputs_hash: ev.inputs_hash,
            status: ev.status,
            output: ev.output,
            produced_by: ev.produced_by,
            revision: ev.revision,
            created_at: ev.created_at,
        },
    );
}

/// Fold events into a manifest, applying them in `(revision, id)` order so
/// the result is independent of the append order of non-causally-related
/// events. `up_to` limits the replay to a revision (inclusive).
pub fn fold_events(
    mut inputs: Vec<InputEvent>,
    mut artefacts: Vec<ArtefactEvent>,
    up_to: Option<u64>,
) -> Manifest {
    if let Some(limit) = up_to {
        inputs.retain(|e| e.revision <= limit);
        artefacts.retain(|e| e.revision <= limit);
    }
    inputs.sort_by(|a, b| (a.revision, &a.id, &a.created_at).cmp(&(b.revision, &b.id, &b.created_at)));
    artefacts.sort_by(|a, b| {
        (a.revision, &a.artefact_id, &a.created_at).cmp(&(b.revision, &b.artefact_id, &b.created_at))
    });

    let revision = inputs
        .iter()
        .map(|e| e.revision)
        .chain(artefacts.iter().map(|e| e.revision))
        .max()
        .unwrap_or(0);
    let created_at = inputs
        .iter()
        .map(|e| e.created_at.as_str())
        .chain(artefacts.iter().map(|e| e.created_at.as_str()))
        .max()
        .unwrap_or("")
        .to_string();

    let mut manifest = Manifest::empty(&created_at);
    manifest.revision = revision;
    for ev in inputs {
        apply_input(&mut manifest, ev);
    }
    for ev in artefacts {
        apply_artefact(&mut manifest, ev);
    }
    manifest
}

fn read_stored(
    store: &dyn Store,
    project: &str,
) -> Result<Option<(Manifest, String)>, ManifestError> {
    let pointer_path = store::current_pointer_path(project);
    if !store.exists(&pointer_path) {
        return Ok(None);
    }
    let pointer: CurrentPointer = serde_json::from_slice(&store.read(&pointer_path)?)
        .map_err(|e| ManifestError::Storage(format!("corrupt current.json: {}", e)))?;

    let bytes = store.read(&store::manifest_path(project, pointer.revision))?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|e| ManifestError::Storage(format!("corrupt manifest snapshot: {}", e)))?;
    Ok(Some((manifest, hasher::hash_bytes(&bytes))))
}

fn collect_events(
    store: &dyn Store,
    project: &str,
) -> Result<(Vec<InputEvent>, Vec<ArtefactEvent>), ManifestError> {
    let inputs: Vec<InputEvent> = eventlog::stream_inputs(store, project)?
        .collect::<Result<_, _>>()
        .map_err(ManifestError::Storage)?;
    let artefacts: Vec<ArtefactEvent> = eventlog::stream_artefacts(store, project)?
        .collect::<Result<_, _>>()
        .map_err(ManifestError::Storage)?;
    Ok((inputs, artefacts))
}

/// Load the current manifest: the stored snapshot plus any newer event
/// tail, or a pure fold of the event log when nothing was ever saved.
///
/// `NotFound` (no snapshot, no events) is recoverable — callers seed an
/// empty manifest.
pub fn load_current(store: &dyn Store, project: &str) -> Result<LoadedManifest, ManifestError> {
    let stored = read_stored(store, project)?;
    let (inputs, artefacts) = collect_events(store, project)?;

    match stored {
        Some((mut manifest, hash)) => {
            // Fold the tail appended since the snapshot was saved.
            let snapshot_revision = manifest.revision;
            let mut newer_inputs: Vec<InputEvent> =
                inputs.into_iter().filter(|e| e.revision > snapshot_revision).collect();
            let mut newer_artefacts: Vec<ArtefactEvent> =
                artefacts.into_iter().filter(|e| e.revision > snapshot_revision).collect();
            newer_inputs.sort_by(|a, b| {
                (a.revision, &a.id, &a.created_at).cmp(&(b.revision, &b.id, &b.created_at))
            });
            newer_artefacts.sort_by(|a, b| {
                (a.revision, &a.artefact_id, &a.created_at)
                    .cmp(&(b.revision, &b.artefact_id, &b.created_at))
            });

            for ev in newer_inputs {
                manifest.revision = manifest.revision.max(ev.revision);
                apply_input(&mut manifest, ev);
            }
            for ev in newer_artefacts {
                manifest.revision = manifest.revision.max(ev.revision);
                apply_artefact(&mut manifest, ev);
            }
            Ok(LoadedManifest { manifest, hash: Some(hash) })
        }
        None if inputs.is_empty() && artefacts.is_empty() => {
            Err(ManifestError::NotFound { project: project.to_string() })
        }
        None => Ok(LoadedManifest { manifest: fold_events(inputs, artefacts, None), hash: None }),
    }
}

/// Persist a manifest under its revision and repoint `current.json`.
///
/// `previous_hash` is the token from `load_current`; the write is rejected
/// with `ConcurrentModification` when the snapshot on disk no longer
/// matches it. Returns the new token.
pub fn save_manifest(
    store: &dyn Store,
    project: &str,
    manifest: &Manifest,
    previous_hash: Option<&str>,
) -> Result<String, ManifestError> {
    let stored = read_stored(store, project)?;
    let actual = stored.as_ref().map(|(_, hash)| hash.as_str());
    if actual != previous_hash {
        return Err(ManifestError::ConcurrentModification {
            expected: previous_hash.map(|s| s.to_string()),
            actual: actual.map(|s| s.to_string()),
        });
    }

    if let Some((current, _)) = &stored {
        if manifest.revision <= current.revision {
            return Err(ManifestError::NonMonotonicRevision {
                current: current.revision,
                proposed: manifest.revision,
            });
        }
    }

    let bytes = serde_json::to_vec(manifest)
        .map_err(|e| ManifestError::Storage(format!("serialize error: {}", e)))?;
    store.write(&store::manifest_path(project, manifest.revision), &bytes)?;

    let pointer = serde_json::to_vec(&CurrentPointer { revision: manifest.revision })
        .map_err(|e| ManifestError::Storage(format!("serialize error: {}", e)))?;
    store.write(&store::current_pointer_path(project), &pointer)?;

    Ok(hasher::hash_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ArtefactOutput, JobStatus};
    use crate::store::MemoryStore;

    fn input_event(id: &str, revision: u64, payload: &str) -> InputEvent {
        InputEvent {
            id: id.to_string(),
            revision,
            payload: serde_json::json!(payload),
            hash: hasher::hash_string(payload),
            edited_by: None,
            created_at: format!("2026-07-01T10:00:0{}Z", revision),
        }
    }

    fn artefact_event(id: &str, revision: u64) -> ArtefactEvent {
        ArtefactEvent {
            artefact_id: id.to_string(),
            revision,
            inputs_hash: "blake3:in".to_string(),
            output: ArtefactOutput::inline(serde_json::json!("out")),
            status: JobStatus::Succeeded,
            produced_by: "Producer:m.P".to_string(),
            created_at: format!("2026-07-01T10:00:0{}Z", revision),
            diagnostics: None,
        }
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = load_current(&store, "ghost").unwrap_err();
        assert_eq!(err, ManifestError::NotFound { project: "ghost".to_string() });
    }

    #[test]
    fn test_fold_last_event_wins() {
        let manifest = fold_events(
            vec![input_event("Input:m.Topic", 1, "old"), input_event("Input:m.Topic", 2, "new")],
            vec![],
            None,
        );
        assert_eq!(manifest.revision, 2);
        assert_eq!(manifest.inputs["Input:m.Topic"].payload, serde_json::json!("new"));
    }

    #[test]
    fn test_fold_order_independent_for_unrelated_events() {
        let a = input_event("Input:m.A", 1, "x");
        let b = input_event("Input:m.B", 2, "y");
        let m1 = fold_events(vec![a.clone(), b.clone()], vec![], None);
        let m2 = fold_events(vec![b, a], vec![], None);
        assert_eq!(m1, m2);
        assert_eq!(
            serde_json::to_string(&m1).unwrap(),
            serde_json::to_string(&m2).unwrap()
        );
    }

    #[test]
    fn test_fold_up_to_revision() {
        let manifest = fold_events(
            vec![input_event("Input:m.Topic", 1, "old"), input_event("Input:m.Topic", 3, "new")],
            vec![artefact_event("Artifact:m.Text", 2)],
            Some(2),
        );
        assert_eq!(manifest.revision, 2);
        assert_eq!(manifest.inputs["Input:m.Topic"].payload, serde_json::json!("old"));
        assert!(manifest.artefacts.contains_key("Artifact:m.Text"));
    }

    #[test]
    fn test_load_derives_from_events_without_snapshot() {
        let store = MemoryStore::new();
        eventlog::append_input(&store, "mov", &input_event("Input:m.Topic", 1, "volcanoes")).unwrap();

        let loaded = load_current(&store, "mov").unwrap();
        assert_eq!(loaded.hash, None, "nothing stored yet");
        assert_eq!(loaded.manifest.revision, 1);
        assert!(loaded.manifest.inputs.contains_key("Input:m.Topic"));
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let store = MemoryStore::new();
        let mut manifest = Manifest::empty("2026-07-01T10:00:00Z");
        manifest.revision = 1;
        manifest.inputs.insert(
            "Input:m.Topic".to_string(),
            InputState {
                hash: "blake3:abc".into(),
                revision: 1,
                payload: serde_json::json!("volcanoes"),
                edited_by: None,
                updated_at: "2026-07-01T10:00:00Z".into(),
            },
        );

        let hash = save_manifest(&store, "mov", &manifest, None).unwrap();
        let loaded = load_current(&store, "mov").unwrap();
        assert_eq!(loaded.manifest, manifest);
        assert_eq!(loaded.hash, Some(hash));
    }

    #[test]
    fn test_save_stale_hash_rejected_and_state_untouched() {
        let store = MemoryStore::new();
        let mut m1 = Manifest::empty("2026-07-01T10:00:00Z");
        m1.revision = 1;
        let hash1 = save_manifest(&store, "mov", &m1, None).unwrap();

        let mut m2 = m1.clone();
        m2.revision = 2;
        save_manifest(&store, "mov", &m2, Some(&hash1)).unwrap();

        // A writer still holding hash1 must lose.
        let mut m3 = m1.clone();
        m3.revision = 3;
        let err = save_manifest(&store, "mov", &m3, Some(&hash1)).unwrap_err();
        assert!(matches!(err, ManifestError::ConcurrentModification { .. }));

        // Stored state is still revision 2.
        let loaded = load_current(&store, "mov").unwrap();
        assert_eq!(loaded.manifest.revision, 2);
    }

    #[test]
    fn test_first_save_requires_empty_disk() {
        let store = MemoryStore::new();
        let mut m1 = Manifest::empty("2026-07-01T10:00:00Z");
        m1.revision = 1;
        save_manifest(&store, "mov", &m1, None).unwrap();

        // A second blind first-write loses.
        let mut other = Manifest::empty("2026-07-01T10:00:00Z");
        other.revision = 1;
        let err = save_manifest(&store, "mov", &other, None).unwrap_err();
        assert!(matches!(err, ManifestError::ConcurrentModification { .. }));
    }

    #[test]
    fn test_revisions_must_increase() {
        let store = MemoryStore::new();
        let mut m1 = Manifest::empty("2026-07-01T10:00:00Z");
        m1.revision = 2;
        let hash = save_manifest(&store, "mov", &m1, None).unwrap();

        let mut stale = m1.clone();
        stale.revision = 2;
        let err = save_manifest(&store, "mov", &stale, Some(&hash)).unwrap_err();
        assert_eq!(err, ManifestError::NonMonotonicRevision { current: 2, proposed: 2 });
    }

    #[test]
    fn test_load_applies_newer_tail_over_snapshot() {
        let store = MemoryStore::new();
        let mut m1 = Manifest::empty("2026-07-01T10:00:00Z");
        m1.revision = 1;
        save_manifest(&store, "mov", &m1, None).unwrap();

        // Events appended after the snapshot
        eventlog::append_input(&store, "mov", &input_event("Input:m.Topic", 2, "newer")).unwrap();

        let loaded = load_current(&store, "mov").unwrap();
        assert_eq!(loaded.manifest.revision, 2);
        assert_eq!(loaded.manifest.inputs["Input:m.Topic"].payload, serde_json::json!("newer"));
        assert!(loaded.hash.is_some(), "token still tracks the stored snapshot");
    }

    proptest::proptest! {
        /// Appending non-causally-related input events in any order folds
        /// to the same manifest.
        #[test]
        fn prop_fold_order_independent(
            entries in proptest::collection::btree_map(0u8..8, 1u64..6, 1..8),
        ) {
            let events: Vec<InputEvent> = entries
                .iter()
                .map(|(&id, &rev)| input_event(&format!("Input:m.N{}", id), rev, "payload"))
                .collect();
            let mut reversed = events.clone();
            reversed.reverse();
            proptest::prop_assert_eq!(
                fold_events(events, vec![], None),
                fold_events(reversed, vec![], None)
            );
        }
    }

    #[test]
    fn test_manifest_reproducible_from_replay() {
        let store = MemoryStore::new();
        eventlog::append_input(&store, "mov", &input_event("Input:m.Topic", 1, "volcanoes")).unwrap();
        eventlog::append_artefact(&store, "mov", &artefact_event("Artifact:m.Text", 1)).unwrap();

        let inputs: Vec<InputEvent> =
            eventlog::stream_inputs(&store, "mov").unwrap().collect::<Result<_, _>>().unwrap();
        let artefacts: Vec<ArtefactEvent> =
            eventlog::stream_artefacts(&store, "mov").unwrap().collect::<Result<_, _>>().unwrap();
        let replayed = fold_events(inputs, artefacts, None);

        let loaded = load_current(&store, "mov").unwrap();
        assert_eq!(loaded.manifest, replayed);
    }
}
