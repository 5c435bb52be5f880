//! The hierarchical, versioned key-value store (spec.md §4.1).
//!
//! Paths are dotted strings (`gate.R.Q1.params.frequency`). Values live in a
//! tree of [`serde_json::Value`] so that arbitrary nested configuration
//! (channel maps, calibration tables, per-qubit parameters) round-trips
//! through the checkpoint format without a bespoke schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::error::RegistryError;

/// An immutable view of the registry, taken at task start. All compilation
/// for one task uses a single snapshot; the registry's own subsequent
/// `update`s never retroactively alter it (spec.md §8 invariant 3).
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: u64,
    data: Arc<Json>,
}

impl Snapshot {
    pub fn query(&self, path: &str, default: Option<Json>) -> Option<Json> {
        query_path(&self.data, path).cloned().or(default)
    }

    pub fn as_json(&self) -> &Json {
        &self.data
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn query_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut node = root;
    for seg in split(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Walks `path` from `root`, creating missing intermediate objects on the
/// way down (the "auto-create walk" of spec.md §4.1), and sets the leaf to
/// `value`.
fn write_path(root: &mut Json, path: &str, value: Json) -> Result<(), RegistryError> {
    let segs = split(path);
    if segs.is_empty() {
        *root = value;
        return Ok(());
    }
    if !root.is_object() {
        *root = Json::Object(Map::new());
    }
    let mut node = root;
    for seg in &segs[..segs.len() - 1] {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| RegistryError::NotAnObject(path.to_string()))?;
        node = obj
            .entry(seg.to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if !node.is_object() {
            *node = Json::Object(Map::new());
        }
    }
    let obj = node
        .as_object_mut()
        .ok_or_else(|| RegistryError::NotAnObject(path.to_string()))?;
    obj.insert(segs[segs.len() - 1].to_string(), value);
    Ok(())
}

fn delete_path(root: &mut Json, path: &str) {
    let segs = split(path);
    if segs.is_empty() {
        return;
    }
    let mut node = root;
    for seg in &segs[..segs.len() - 1] {
        match node.as_object_mut().and_then(|o| o.get_mut(*seg)) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let Some(obj) = node.as_object_mut() {
        obj.remove(segs[segs.len() - 1]);
    }
}

/// Single-writer, multi-reader hierarchical store. Readers observe a
/// consistent snapshot because writes replace the whole tree behind the
/// `RwLock` rather than mutating through outstanding references.
pub struct Registry {
    inner: RwLock<Inner>,
}

struct Inner {
    data: Json,
    version: u64,
    /// Snapshots recorded per task id, so repeated `snapshot(Some(tid))`
    /// calls return the exact same view for the lifetime of that task.
    named_snapshots: BTreeMap<u64, Snapshot>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(Inner {
                data: Json::Object(Map::new()),
                version: 0,
                named_snapshots: BTreeMap::new(),
            }),
        }
    }

    pub fn query(&self, path: &str, default: Option<Json>) -> Option<Json> {
        let inner = self.inner.read();
        let found = query_path(&inner.data, path).cloned();
        if found.is_none() {
            log::warn!("registry miss at `{path}`");
        }
        found.or(default)
    }

    pub fn try_query(&self, path: &str) -> Result<Json, RegistryError> {
        self.query(path, None)
            .ok_or_else(|| RegistryError::Miss(path.to_string()))
    }

    pub fn update(&self, path: &str, value: Json) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        write_path(&mut inner.data, path, value)?;
        inner.version += 1;
        Ok(())
    }

    /// `create` differs from `update` only in intent (spec.md §4.1 lists
    /// them separately); both use the same auto-create walk.
    pub fn create(&self, path: &str, value: Json) -> Result<(), RegistryError> {
        self.update(path, value)
    }

    pub fn delete(&self, path: &str) {
        let mut inner = self.inner.write();
        delete_path(&mut inner.data, path);
        inner.version += 1;
    }

    /// Takes a fresh snapshot of the current tree. If `tid` is given and a
    /// snapshot was already recorded for it, the previously recorded one is
    /// returned instead — a task's compilation always sees the state as of
    /// when it started, never a later write (spec.md §8 invariant 3).
    pub fn snapshot(&self, tid: Option<u64>) -> Snapshot {
        if let Some(tid) = tid {
            let existing = self.inner.read().named_snapshots.get(&tid).cloned();
            if let Some(snap) = existing {
                return snap;
            }
        }
        let mut inner = self.inner.write();
        let snap = Snapshot { version: inner.version, data: Arc::new(inner.data.clone()) };
        if let Some(tid) = tid {
            inner.named_snapshots.insert(tid, snap.clone());
        }
        snap
    }

    /// Produces a diffable, content-addressed textual dump of the snapshot
    /// recorded for `tid` (spec.md §6 "Registry checkpoint format").
    pub fn checkpoint(&self, tid: u64) -> Option<Checkpoint> {
        let snap = self.inner.read().named_snapshots.get(&tid).cloned()?;
        let text = serde_json::to_string_pretty(snap.as_json()).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let content_address = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Some(Checkpoint { tid, text, content_address })
    }

    pub fn forget_snapshot(&self, tid: u64) {
        self.inner.write().named_snapshots.remove(&tid);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub tid: u64,
    pub text: String,
    pub content_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_create_walks_missing_subtrees() {
        let reg = Registry::new();
        reg.update("gate.R.Q1.params.frequency", json!(5.0e9)).unwrap();
        assert_eq!(reg.query("gate.R.Q1.params.frequency", None), Some(json!(5.0e9)));
    }

    #[test]
    fn snapshot_is_frozen_at_task_start() {
        let reg = Registry::new();
        reg.update("gate.R.Q0.params.frequency", json!(1.0)).unwrap();
        let snap = reg.snapshot(Some(1));
        reg.update("gate.R.Q0.params.frequency", json!(2.0)).unwrap();
        assert_eq!(snap.query("gate.R.Q0.params.frequency", None), Some(json!(1.0)));
        // a second call for the same tid returns the identical frozen view
        let snap2 = reg.snapshot(Some(1));
        assert_eq!(snap2.query("gate.R.Q0.params.frequency", None), Some(json!(1.0)));
    }

    #[test]
    fn checkpoint_is_content_addressed() {
        let reg = Registry::new();
        reg.update("a.b", json!(1)).unwrap();
        reg.snapshot(Some(7));
        let cp1 = reg.checkpoint(7).unwrap();
        let cp2 = reg.checkpoint(7).unwrap();
        assert_eq!(cp1.content_address, cp2.content_address);
    }

    #[test]
    fn delete_removes_leaf() {
        let reg = Registry::new();
        reg.update("a.b.c", json!(1)).unwrap();
        reg.delete("a.b.c");
        assert_eq!(reg.query("a.b.c", None), None);
    }
}
