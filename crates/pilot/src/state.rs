//! Pipeline state flags that survive restarts.
//!
//! The tracker records facts like "material for this domain set has
//! been installed into the consumer at least once" so a fresh process
//! does not redo first-run work. Flags are write-once: setting an
//! existing flag keeps the original timestamp.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for StateError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Durable write-once flags keyed by string.
pub trait StateStore: Send + Sync {
    fn has(&self, key: &str) -> Result<bool, StateError>;

    /// Record the flag. Idempotent: a flag that already exists keeps
    /// its original timestamp.
    fn set(&self, key: &str) -> Result<(), StateError>;

    /// When the flag was first set, if it is set and readable.
    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError>;
}

/// Marker files under a state directory, one per flag. The file content
/// is the RFC 3339 timestamp of when the flag was first set.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StateError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn marker_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.marker"))
    }
}

impl StateStore for FileStateStore {
    fn has(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.marker_path(key).exists())
    }

    fn set(&self, key: &str) -> Result<(), StateError> {
        let path = self.marker_path(key);
        if path.exists() {
            debug!(key, "state flag already set");
            return Ok(());
        }
        fs::write(&path, Utc::now().to_rfc3339()).map_err(|e| StateError::Io {
            path,
            source: e,
        })
    }

    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        let path = self.marker_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| StateError::Io {
            path: path.clone(),
            source: e,
        })?;
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                warn!(key, error = %e, "unreadable state marker timestamp");
                Ok(None)
            }
        }
    }
}

/// In-memory tracker for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStateStore {
    flags: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn has(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.flags.lock().contains_key(key))
    }

    fn set(&self, key: &str) -> Result<(), StateError> {
        self.flags
            .lock()
            .entry(key.to_string())
            .or_insert_with(Utc::now);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateError> {
        Ok(self.flags.lock().get(key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_set_and_get() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        assert!(!store.has("installed:irc.example.com").unwrap());
        store.set("installed:irc.example.com").unwrap();
        assert!(store.has("installed:irc.example.com").unwrap());
        assert!(store.get("installed:irc.example.com").unwrap().is_some());
    }

    #[test]
    fn test_file_store_set_is_write_once() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        store.set("flag").unwrap();
        let first = store.get("flag").unwrap().unwrap();
        store.set("flag").unwrap();
        assert_eq!(store.get("flag").unwrap().unwrap(), first);
    }

    #[test]
    fn test_file_store_sanitizes_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        store.set("installed:*.example.com/odd").unwrap();
        assert!(store.has("installed:*.example.com/odd").unwrap());
        // Marker lands inside the state dir, not wherever the slash said.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStateStore::new(dir.path()).unwrap();
            store.set("flag").unwrap();
        }
        let store = FileStateStore::new(dir.path()).unwrap();
        assert!(store.has("flag").unwrap());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(!store.has("k").unwrap());
        store.set("k").unwrap();
        let first = store.get("k").unwrap().unwrap();
        store.set("k").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), first);
    }
}
