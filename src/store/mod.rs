//! Storage abstraction — in-memory and local-filesystem backends behind one
//! trait, plus the per-project path layout.
//!
//! Layout: `<base>/<id>/{manifests, events, runs, blobs}` and a
//! `current.json` pointer to the latest manifest revision. Blobs are
//! addressed by content hash, so identical payloads are stored once.

pub mod eventlog;
pub mod hasher;
pub mod manifest;
pub mod planstore;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Pluggable storage backend. Paths are relative, `/`-separated.
pub trait Store: Send + Sync {
    /// Create a directory (and parents). Idempotent.
    fn create_dir(&self, path: &str) -> Result<(), String>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// Read the full contents of a file.
    fn read(&self, path: &str) -> Result<Vec<u8>, String>;

    /// Write a file, replacing any previous contents. Readers never observe
    /// a partially written file.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), String>;

    /// Append one line (newline-terminated) to a file, creating it if needed.
    fn append_line(&self, path: &str, line: &str) -> Result<(), String>;

    /// List file names directly under a directory. Missing directory is an
    /// empty listing.
    fn list(&self, dir: &str) -> Result<Vec<String>, String>;
}

/// Join a project id and path segments into a canonical relative path.
pub fn resolve(project: &str, segments: &[&str]) -> String {
    let mut path = String::from(project);
    for s in segments {
        path.push('/');
        path.push_str(s);
    }
    path
}

pub fn current_pointer_path(project: &str) -> String {
    resolve(project, &["current.json"])
}

pub fn manifest_path(project: &str, revision: u64) -> String {
    resolve(project, &["manifests", &format!("{}.json", revision)])
}

pub fn inputs_log_path(project: &str) -> String {
    resolve(project, &["events", "inputs.log"])
}

pub fn artefacts_log_path(project: &str) -> String {
    resolve(project, &["events", "artefacts.log"])
}

pub fn plan_path(project: &str, revision: u64) -> String {
    resolve(project, &["runs", &format!("{}-plan.json", revision)])
}

pub fn blob_path(project: &str, hex: &str) -> String {
    resolve(project, &["blobs", hex])
}

/// Write a content-addressed blob, returning its `blake3:` hash.
/// A blob that already exists is left untouched — concurrent writers of
/// identical content cannot corrupt each other.
pub fn write_blob(store: &dyn Store, project: &str, bytes: &[u8]) -> Result<String, String> {
    let hash = hasher::hash_bytes(bytes);
    let path = blob_path(project, hasher::hex_digest(&hash));
    if !store.exists(&path) {
        store.write(&path, bytes)?;
    }
    Ok(hash)
}

/// Read a content-addressed blob back by its hash.
pub fn read_blob(store: &dyn Store, project: &str, hash: &str) -> Result<Vec<u8>, String> {
    store.read(&blob_path(project, hasher::hex_digest(hash)))
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory backend for tests and structural dry runs.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn create_dir(&self, _path: &str) -> Result<(), String> {
        // Directories are implicit in the flat key space.
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, String> {
        let files = self.files.lock().map_err(|_| "store lock poisoned".to_string())?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| format!("not found: {}", path))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), String> {
        let mut files = self.files.lock().map_err(|_| "store lock poisoned".to_string())?;
        files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append_line(&self, path: &str, line: &str) -> Result<(), String> {
        let mut files = self.files.lock().map_err(|_| "store lock poisoned".to_string())?;
        let buf = files.entry(path.to_string()).or_default();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, String> {
        let files = self.files.lock().map_err(|_| "store lock poisoned".to_string())?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// Local-filesystem backend
// ============================================================================

/// Local-filesystem backend rooted at a base directory.
pub struct LocalStore {
    base: PathBuf,
}

impl LocalStore {
    pub fn new(base: &Path) -> Self {
        Self { base: base.to_path_buf() }
    }

    fn full(&self, path: &str) -> PathBuf {
        let mut full = self.base.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push(segment);
        }
        full
    }
}

impl Store for LocalStore {
    fn create_dir(&self, path: &str) -> Result<(), String> {
        let full = self.full(path);
        std::fs::create_dir_all(&full)
            .map_err(|e| format!("cannot create dir {}: {}", full.display(), e))
    }

    fn exists(&self, path: &str) -> bool {
        self.full(path).exists()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, String> {
        let full = self.full(path);
        std::fs::read(&full).map_err(|e| format!("cannot read {}: {}", full.display(), e))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), String> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }

        // Atomic write: temp file + rename
        let tmp = full.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| format!("cannot write {}: {}", tmp.display(), e))?;
        std::fs::rename(&tmp, &full).map_err(|e| {
            format!("cannot rename {} → {}: {}", tmp.display(), full.display(), e)
        })?;
        Ok(())
    }

    fn append_line(&self, path: &str, line: &str) -> Result<(), String> {
        use std::io::Write;
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .map_err(|e| format!("cannot open {}: {}", full.display(), e))?;
        writeln!(file, "{}", line).map_err(|e| format!("write error: {}", e))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, String> {
        let full = self.full(dir);
        if !full.exists() {
            return Ok(Vec::new());
        }
        let read_dir = std::fs::read_dir(&full)
            .map_err(|e| format!("cannot read dir {}: {}", full.display(), e))?;
        let mut names: Vec<String> = read_dir
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<(Box<dyn Store>, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        vec![
            (Box::new(MemoryStore::new()) as Box<dyn Store>, None),
            (Box::new(LocalStore::new(dir.path())) as Box<dyn Store>, Some(dir)),
        ]
    }

    #[test]
    fn test_resolve_layout_paths() {
        assert_eq!(resolve("mov-1", &["events", "inputs.log"]), "mov-1/events/inputs.log");
        assert_eq!(manifest_path("mov-1", 3), "mov-1/manifests/3.json");
        assert_eq!(plan_path("mov-1", 3), "mov-1/runs/3-plan.json");
        assert_eq!(current_pointer_path("mov-1"), "mov-1/current.json");
        assert_eq!(blob_path("mov-1", "abc"), "mov-1/blobs/abc");
    }

    #[test]
    fn test_write_read_roundtrip() {
        for (store, _guard) in backends() {
            store.write("p/manifests/1.json", b"{}").unwrap();
            assert!(store.exists("p/manifests/1.json"));
            assert_eq!(store.read("p/manifests/1.json").unwrap(), b"{}");
        }
    }

    #[test]
    fn test_read_missing_is_error() {
        for (store, _guard) in backends() {
            assert!(!store.exists("p/nope.json"));
            assert!(store.read("p/nope.json").is_err());
        }
    }

    #[test]
    fn test_write_replaces() {
        for (store, _guard) in backends() {
            store.write("p/current.json", b"one").unwrap();
            store.write("p/current.json", b"two").unwrap();
            assert_eq!(store.read("p/current.json").unwrap(), b"two");
        }
    }

    #[test]
    fn test_append_line_accumulates() {
        for (store, _guard) in backends() {
            store.append_line("p/events/inputs.log", "{\"a\":1}").unwrap();
            store.append_line("p/events/inputs.log", "{\"b\":2}").unwrap();
            let content = String::from_utf8(store.read("p/events/inputs.log").unwrap()).unwrap();
            let lines: Vec<_> = content.lines().collect();
            assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        }
    }

    #[test]
    fn test_list_only_direct_children() {
        for (store, _guard) in backends() {
            store.write("p/manifests/1.json", b"{}").unwrap();
            store.write("p/manifests/2.json", b"{}").unwrap();
            store.write("p/manifests/deep/3.json", b"{}").unwrap();
            let names = store.list("p/manifests").unwrap();
            assert_eq!(names, vec!["1.json", "2.json"]);
        }
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        for (store, _guard) in backends() {
            assert!(store.list("p/ghost").unwrap().is_empty());
        }
    }

    #[test]
    fn test_blob_content_addressed() {
        for (store, _guard) in backends() {
            let h1 = write_blob(store.as_ref(), "p", b"frame-data").unwrap();
            let h2 = write_blob(store.as_ref(), "p", b"frame-data").unwrap();
            assert_eq!(h1, h2);
            assert!(h1.starts_with("blake3:"));
            assert_eq!(read_blob(store.as_ref(), "p", &h1).unwrap(), b"frame-data");
            // Exactly one file under blobs/
            assert_eq!(store.list("p/blobs").unwrap().len(), 1);
        }
    }

    #[test]
    fn test_local_write_atomic_no_tmp_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write("p/current.json", b"{\"revision\":1}").unwrap();
        assert!(dir.path().join("p/current.json").exists());
        assert!(!dir.path().join("p/current.tmp").exists());
    }
}
