//! Persistence collaborators.
//!
//! The engine never touches ambient storage. Callers inject a [`KeyValueStore`]
//! (string blobs, `localStorage`-shaped) and a [`ModelStore`] (model snapshots).
//! Formats are opaque to the stores: the engine serializes, the store only
//! keeps bytes.
//!
//! - [`MemoryStore`]: in-process map, the test fake.
//! - [`FileStore`]: one file per key under a directory.
//! - [`KvModelStore`]: adapts any `KeyValueStore` into a `ModelStore` by
//!   JSON-encoding [`ModelSnapshot`]s.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{Error, ModelSnapshot, Result};

/// String key-value storage (`getItem` / `setItem` / `removeItem`).
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value, `Ok(None)` when the key is absent.
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    /// Insert or overwrite a value.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a key. Deleting an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// Model persistence keyed by a fixed model identifier.
pub trait ModelStore: Send + Sync {
    /// Load a snapshot, `Ok(None)` when nothing is stored under `key`.
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>>;
    /// Persist a snapshot, replacing any previous one.
    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        (**self).get_item(key)
    }
    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        (**self).set_item(key, value)
    }
    fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key)
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Whether `key` currently holds a value.
    pub fn contains(&self, key: &str) -> bool {
        self.items.lock().contains_key(key)
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Directory-backed [`KeyValueStore`]: each key is a file named `<key>.json`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written blob.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(Error::InvalidConfig(format!(
                "store key {key:?} must be non-empty [A-Za-z0-9_.-] and not start with '.'"
            )));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(key, e)),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(".{key}.tmp"));
        fs::write(&tmp, value).map_err(|e| Error::store(key, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::store(key, e))?;
        debug!(key, bytes = value.len(), path = %path.display(), "file store write");
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store(key, e)),
        }
    }
}

/// [`ModelStore`] on top of any [`KeyValueStore`], JSON-encoded.
#[derive(Debug, Clone)]
pub struct KvModelStore<S> {
    inner: S,
}

impl<S: KeyValueStore> KvModelStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KeyValueStore> ModelStore for KvModelStore<S> {
    fn load(&self, key: &str) -> Result<Option<ModelSnapshot>> {
        match self.inner.get_item(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, snapshot: &ModelSnapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot)?;
        self.inner.set_item(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_removes() {
        let s = MemoryStore::new();
        assert_eq!(s.get_item("k").unwrap(), None);
        s.set_item("k", "v1").unwrap();
        s.set_item("k", "v2").unwrap();
        assert_eq!(s.get_item("k").unwrap().as_deref(), Some("v2"));
        s.remove_item("k").unwrap();
        s.remove_item("k").unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileStore::open(dir.path()).unwrap();
        a.set_item("feature_scaler", "{\"x\":1}").unwrap();

        let b = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            b.get_item("feature_scaler").unwrap().as_deref(),
            Some("{\"x\":1}")
        );
        assert_eq!(b.get_item("missing").unwrap(), None);
        b.remove_item("feature_scaler").unwrap();
        assert_eq!(a.get_item("feature_scaler").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileStore::open(dir.path()).unwrap();
        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(s.set_item(bad, "x"), Err(Error::InvalidConfig(_))),
                "key {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn kv_model_store_reports_absent_and_malformed() {
        let kv = Arc::new(MemoryStore::new());
        let ms = KvModelStore::new(kv.clone());
        assert!(ms.load("m").unwrap().is_none());

        kv.set_item("m", "not json").unwrap();
        assert!(matches!(ms.load("m"), Err(Error::Serialization(_))));
    }
}
