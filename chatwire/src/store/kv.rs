//! Pluggable key/value persistence backend.
//!
//! The store never talks to disk or browser storage directly; it goes
//! through this trait. `MemoryStore` covers tests and ephemeral embeds,
//! `FileStore` persists across process restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// Session-scoped key/value persistence.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);
    /// Remove `key` if present.
    fn remove(&self, key: &str);
}

/// In-memory store; state lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

/// File-backed store: one JSON document holding the whole key space.
///
/// Write failures are logged and otherwise swallowed; persistence is a
/// best-effort convenience, not a correctness requirement of the engine.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, loading any existing contents.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    fn write_out(&self, map: &HashMap<String, String>) {
        match serde_json::to_string(map) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), error = %err, "failed to persist store");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize store"),
        }
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(key.to_string(), value.to_string());
        self.write_out(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(key);
        self.write_out(&map);
    }
}
