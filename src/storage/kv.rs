//! Local persistent key-value storage with change notifications.
//!
//! Values are JSON documents. Reads and writes are synchronous; observers
//! learn about writes through a broadcast feed of [`StorageChange`]s.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::PanelError;

const CHANGE_FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<(), PanelError>;

    fn remove(&self, key: &str) -> Result<(), PanelError>;

    fn keys(&self) -> Vec<String>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Entries plus the feed that announces writes to them.
#[derive(Debug)]
struct Entries {
    map: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Entries {
    fn new(map: BTreeMap<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            map: Mutex::new(map),
            changes,
        }
    }

    fn announce(&self, change: StorageChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

/// Volatile store, used in tests and when no store path is configured.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Entries,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Entries::new(BTreeMap::new()),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PanelError> {
        let old_value = self
            .entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        self.entries.announce(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PanelError> {
        let old_value = self
            .entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if old_value.is_some() {
            self.entries.announce(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
            });
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.entries.changes.subscribe()
    }
}

/// Store persisted as a single JSON object on disk. Every write rewrites the
/// file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Entries,
}

impl FileStore {
    /// Opens the store at `path`, starting empty when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PanelError> {
        let path = path.into();
        let map = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<BTreeMap<String, Value>>(&raw).map_err(|e| {
                    PanelError::ParseError(format!("store file {}: {e}", path.display()))
                })?
            }
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), entries = map.len(), "Opened local store");

        Ok(Self {
            path,
            entries: Entries::new(map),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<String, Value>) -> Result<(), PanelError> {
        let body = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = map.len(), "Persisted local store");
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PanelError> {
        let old_value = {
            let mut map = self
                .entries
                .map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let old = map.insert(key.to_string(), value.clone());
            if let Err(e) = self.persist(&map) {
                // Keep memory and disk in agreement.
                match &old {
                    Some(prev) => map.insert(key.to_string(), prev.clone()),
                    None => map.remove(key),
                };
                return Err(e);
            }
            old
        };
        self.entries.announce(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PanelError> {
        let old_value = {
            let mut map = self
                .entries
                .map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(old) = map.remove(key) else {
                return Ok(());
            };
            if let Err(e) = self.persist(&map) {
                map.insert(key.to_string(), old);
                return Err(e);
            }
            old
        };
        self.entries.announce(StorageChange {
            key: key.to_string(),
            old_value: Some(old_value),
            new_value: None,
        });
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.entries.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_set_get_remove() {
        let store = MemoryStore::new();
        store.set("a", json!(1)).unwrap();
        assert_eq!(store.get("a"), Some(json!(1)));
        store.remove("a").unwrap();
        assert_eq!(store.get("a"), None);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn writes_are_announced() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set("k", json!("v1")).unwrap();
        store.set("k", json!("v2")).unwrap();
        store.remove("k").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value, Some(json!("v1")));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.old_value, Some(json!("v1")));
        let third = rx.try_recv().unwrap();
        assert_eq!(third.new_value, None);
    }

    #[test]
    fn removing_missing_key_is_silent() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.remove("nothing").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("appSettings", json!({"darkMode": true})).unwrap();
            store.set("gone", json!(0)).unwrap();
            store.remove("gone").unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("appSettings"), Some(json!({"darkMode": true})));
        assert_eq!(reopened.keys(), vec!["appSettings".to_string()]);
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(PanelError::ParseError(_))));
    }
}
