//! # Stage: Persistence
//!
//! ## Responsibility
//! Cookie-jar style key/value persistence with per-entry expiry. The session
//! layer keeps two entries in it: the persisted variant blob and the session
//! identity.
//!
//! ## Guarantees
//! - Expired entries are never returned; they are dropped lazily on access
//! - [`MemoryStore`] clones share the same entries, so two engines built from
//!   clones of one store behave like two visits of one browser
//! - [`FileStore`] rewrites the whole file on every write
//!
//! ## NOT Responsible For
//! - Deciding what is stored (that is [`crate::session::SessionContext`])
//! - Cross-process locking of the backing file

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TuneError};
use crate::now_ms;

/// Swappable persistence backend.
pub trait PersistenceAdapter {
    /// Current value under `key`, or `None` if absent or expired.
    fn read(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, expiring `ttl` from now.
    fn write(&mut self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;
}

/// One persisted value and its absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Value,
    pub expires_at_ms: u64,
}

impl StoredEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self { value, expires_at_ms: now_ms().saturating_add(ttl_ms) }
    }

    pub fn is_expired(&self, at_ms: u64) -> bool {
        at_ms >= self.expires_at_ms
    }
}

/// Days → `Duration`, the unit every expiry option is configured in.
pub fn days(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 86_400)
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory store. Cloning yields a handle onto the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = now_ms();
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw entry including its expiry, for inspection.
    pub fn entry(&self, key: &str) -> Option<StoredEntry> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }
}

impl PersistenceAdapter for MemoryStore {
    fn read(&self, key: &str) -> Option<Value> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = guard.get(key)?.is_expired(now_ms());
        if expired {
            guard.remove(key);
            return None;
        }
        guard.get(key).map(|e| e.value.clone())
    }

    fn write(&mut self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// JSON-file store: `{key: {value, expires_at_ms}}`.
///
/// A missing file reads as empty. A file that fails to parse is a
/// [`TuneError::Persistence`] on write, and reads as empty.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, StoredEntry>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            TuneError::Persistence(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, entries: &HashMap<String, StoredEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

impl PersistenceAdapter for FileStore {
    fn read(&self, key: &str) -> Option<Value> {
        let entries = match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable store, treating as empty");
                return None;
            }
        };
        entries
            .get(key)
            .filter(|e| !e.is_expired(now_ms()))
            .map(|e| e.value.clone())
    }

    fn write(&mut self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let now = now_ms();
        let mut entries = self.load()?;
        entries.retain(|_, e| !e.is_expired(now));
        entries.insert(key.to_string(), StoredEntry::new(value, ttl));
        self.save(&entries)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_days_conversion() {
        assert_eq!(days(1), Duration::from_secs(86_400));
        assert_eq!(days(0), Duration::ZERO);
    }

    #[test]
    fn test_memory_roundtrip() {
        let mut s = MemoryStore::new();
        s.write("k", json!({"a": 1}), days(1)).unwrap();
        assert_eq!(s.read("k"), Some(json!({"a": 1})));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_memory_missing_key() {
        let s = MemoryStore::new();
        assert!(s.read("nope").is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn test_memory_zero_ttl_is_expired() {
        let mut s = MemoryStore::new();
        s.write("k", json!(1), Duration::ZERO).unwrap();
        assert!(s.read("k").is_none());
        assert!(s.entry("k").is_none(), "expired entry dropped on read");
    }

    #[test]
    fn test_memory_clones_share_entries() {
        let mut a = MemoryStore::new();
        let b = a.clone();
        a.write("k", json!("v"), days(1)).unwrap();
        assert_eq!(b.read("k"), Some(json!("v")));
    }

    #[test]
    fn test_memory_remove() {
        let mut s = MemoryStore::new();
        s.write("k", json!(1), days(1)).unwrap();
        s.remove("k").unwrap();
        assert!(s.read("k").is_none());
    }

    #[test]
    fn test_memory_expiry_recorded() {
        let mut s = MemoryStore::new();
        let before = now_ms();
        s.write("k", json!(1), days(365)).unwrap();
        let entry = s.entry("k").unwrap();
        assert!(entry.expires_at_ms >= before + 365 * 86_400_000);
    }

    #[test]
    fn test_file_roundtrip_and_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut a = FileStore::new(&path);
        a.write("tuned_tests", json!({"cta": 1}), days(100)).unwrap();

        let b = FileStore::new(&path);
        assert_eq!(b.read("tuned_tests"), Some(json!({"cta": 1})));
    }

    #[test]
    fn test_file_missing_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileStore::new(dir.path().join("absent.json"));
        assert!(s.read("k").is_none());
    }

    #[test]
    fn test_file_expired_not_returned() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = FileStore::new(dir.path().join("s.json"));
        s.write("k", json!(1), Duration::ZERO).unwrap();
        assert!(s.read("k").is_none());
    }

    #[test]
    fn test_file_corrupt_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let mut s = FileStore::new(&path);
        assert!(s.read("k").is_none());
        let err = s.write("k", json!(1), days(1)).unwrap_err();
        assert!(matches!(err, TuneError::Persistence(_)));
    }

    #[test]
    fn test_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/s.json");
        let mut s = FileStore::new(&path);
        s.write("k", json!(true), days(1)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_file_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = FileStore::new(dir.path().join("s.json"));
        s.write("a", json!(1), days(1)).unwrap();
        s.write("b", json!(2), days(1)).unwrap();
        s.remove("a").unwrap();
        assert!(s.read("a").is_none());
        assert_eq!(s.read("b"), Some(json!(2)));
    }
}
