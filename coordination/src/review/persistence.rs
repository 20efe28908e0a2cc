//! Review persistence: checkpoint and resume for interrupted reviews.
//!
//! Every backend stores the same versioned JSON envelope. Loading rejects
//! envelopes from a newer schema and states whose phase disagrees with their
//! checkpoint history, so a resumed review never starts from a drifted state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::state::{ReviewKey, ReviewState};

/// Error during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("deserialize failed: {0}")]
    Deserialize(String),

    #[error("version mismatch: expected <= {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Upsert/load/expire contract for review state.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Insert or replace the state stored under `key`.
    async fn save(&self, key: &ReviewKey, state: &ReviewState) -> Result<(), PersistenceError>;

    /// Load the state stored under `key`, if any.
    async fn load(&self, key: &ReviewKey) -> Result<Option<ReviewState>, PersistenceError>;

    /// Delete states not updated within `age`; returns how many were removed.
    async fn delete_older_than(&self, age: Duration) -> Result<usize, PersistenceError>;
}

/// Versioned on-disk representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedReview {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: ReviewState,
}

impl PersistedReview {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(state: &ReviewState) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::Serialize(e.to_string()))
    }

    /// Parse and validate an envelope.
    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let envelope: Self =
            serde_json::from_str(json).map_err(|e| PersistenceError::Deserialize(e.to_string()))?;
        if envelope.version > Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: envelope.version,
            });
        }
        envelope
            .state
            .validate()
            .map_err(PersistenceError::IntegrityCheckFailed)?;
        Ok(envelope)
    }
}

fn encode(state: &ReviewState) -> Result<String, PersistenceError> {
    PersistedReview::new(state).to_json()
}

fn decode(key: &ReviewKey, json: &str) -> Result<ReviewState, PersistenceError> {
    let envelope = PersistedReview::from_json(json)?;
    if &envelope.state.key != key {
        return Err(PersistenceError::IntegrityCheckFailed(format!(
            "stored review {} does not match requested {}",
            envelope.state.key, key
        )));
    }
    Ok(envelope.state)
}

/// Oldest `updated_at` that survives a purge of `age`.
fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}

/// Process-local persistence, mainly for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryStatePersistence {
    records: RwLock<HashMap<ReviewKey, String>>,
}

impl InMemoryStatePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StatePersistence for InMemoryStatePersistence {
    async fn save(&self, key: &ReviewKey, state: &ReviewState) -> Result<(), PersistenceError> {
        let json = encode(state)?;
        self.records.write().await.insert(key.clone(), json);
        Ok(())
    }

    async fn load(&self, key: &ReviewKey) -> Result<Option<ReviewState>, PersistenceError> {
        match self.records.read().await.get(key) {
            Some(json) => decode(key, json).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize, PersistenceError> {
        let Some(cutoff) = cutoff(age) else {
            return Ok(0);
        };
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|key, json| match decode(key, json) {
            Ok(state) => state.updated_at >= cutoff,
            Err(_) => false,
        });
        Ok(before - records.len())
    }
}

/// One pretty-printed JSON file per review under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStatePersistence {
    dir: PathBuf,
}

impl JsonFileStatePersistence {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &ReviewKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.storage_id()))
    }
}

#[async_trait]
impl StatePersistence for JsonFileStatePersistence {
    async fn save(&self, key: &ReviewKey, state: &ReviewState) -> Result<(), PersistenceError> {
        let json = encode(state)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        // Write-then-rename keeps the previous checkpoint intact on a crash.
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(review = %key, path = %path.display(), phase = %state.phase, "Review state saved");
        Ok(())
    }

    async fn load(&self, key: &ReviewKey) -> Result<Option<ReviewState>, PersistenceError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => decode(key, &json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize, PersistenceError> {
        let Some(cutoff) = cutoff(age) else {
            return Ok(0);
        };
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            let stale = match PersistedReview::from_json(&json) {
                Ok(envelope) => envelope.state.updated_at < cutoff,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable review state");
                    false
                }
            };
            if stale {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(feature = "heavy-state")]
pub use rocks::RocksDbStatePersistence;

#[cfg(feature = "heavy-state")]
mod rocks {
    use std::path::PathBuf;
    use std::sync::RwLock;
    use std::time::Duration;

    use async_trait::async_trait;
    use rocksdb::{IteratorMode, DB};

    use super::{cutoff, decode, encode, PersistedReview, PersistenceError, StatePersistence};
    use crate::review::state::{ReviewKey, ReviewState};

    impl From<rocksdb::Error> for PersistenceError {
        fn from(e: rocksdb::Error) -> Self {
            Self::Backend(e.to_string())
        }
    }

    /// RocksDB-backed persistence keyed by [`ReviewKey::storage_id`].
    pub struct RocksDbStatePersistence {
        db: RwLock<DB>,
        path: PathBuf,
    }

    impl RocksDbStatePersistence {
        /// Open or create a store at the given path.
        pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
            let path = path.into();
            let db = DB::open_default(&path)?;
            Ok(Self {
                db: RwLock::new(db),
                path,
            })
        }

        pub fn path(&self) -> &PathBuf {
            &self.path
        }

        fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, DB>, PersistenceError> {
            self.db
                .read()
                .map_err(|_| PersistenceError::Backend("lock poisoned".into()))
        }
    }

    #[async_trait]
    impl StatePersistence for RocksDbStatePersistence {
        async fn save(&self, key: &ReviewKey, state: &ReviewState) -> Result<(), PersistenceError> {
            let json = encode(state)?;
            self.read()?.put(key.storage_id().as_bytes(), json.as_bytes())?;
            Ok(())
        }

        async fn load(&self, key: &ReviewKey) -> Result<Option<ReviewState>, PersistenceError> {
            match self.read()?.get(key.storage_id().as_bytes())? {
                Some(bytes) => {
                    let json = String::from_utf8(bytes)
                        .map_err(|e| PersistenceError::Deserialize(e.to_string()))?;
                    decode(key, &json).map(Some)
                }
                None => Ok(None),
            }
        }

        async fn delete_older_than(&self, age: Duration) -> Result<usize, PersistenceError> {
            let Some(cutoff) = cutoff(age) else {
                return Ok(0);
            };
            let db = self.read()?;
            let mut stale = Vec::new();
            for item in db.iterator(IteratorMode::Start) {
                let (k, v) = item?;
                let Ok(json) = std::str::from_utf8(&v) else {
                    continue;
                };
                if let Ok(envelope) = PersistedReview::from_json(json) {
                    if envelope.state.updated_at < cutoff {
                        stale.push(k);
                    }
                }
            }
            for k in &stale {
                db.delete(k)?;
            }
            Ok(stale.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::state::ReviewPhase;

    fn key(id: &str) -> ReviewKey {
        ReviewKey::new("github", "acme/widgets", id)
    }

    fn state(id: &str) -> ReviewState {
        let mut s = ReviewState::new(key(id));
        s.transition_to(ReviewPhase::ContextGathering, "start").unwrap();
        s
    }

    #[test]
    fn test_envelope_roundtrip_validates() {
        let s = state("1");
        let json = PersistedReview::new(&s).to_json().unwrap();
        let restored = PersistedReview::from_json(&json).unwrap();
        assert_eq!(restored.state, s);
        assert_eq!(restored.version, PersistedReview::CURRENT_VERSION);
    }

    #[test]
    fn test_future_version_rejected() {
        let mut envelope = PersistedReview::new(&state("1"));
        envelope.version = 99;
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            PersistedReview::from_json(&json).unwrap_err(),
            PersistenceError::VersionMismatch {
                expected: 1,
                found: 99
            }
        );
    }

    #[test]
    fn test_drifted_phase_rejected() {
        let mut s = state("1");
        s.phase = ReviewPhase::Output;
        let json = serde_json::to_string(&PersistedReview::new(&s)).unwrap();
        assert!(matches!(
            PersistedReview::from_json(&json),
            Err(PersistenceError::IntegrityCheckFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_upsert_and_load() {
        let store = InMemoryStatePersistence::new();
        assert!(store.load(&key("1")).await.unwrap().is_none());

        let mut s = state("1");
        store.save(&key("1"), &s).await.unwrap();
        s.transition_to(ReviewPhase::Review, "next").unwrap();
        store.save(&key("1"), &s).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.load(&key("1")).await.unwrap().unwrap();
        assert_eq!(loaded.phase, ReviewPhase::Review);
        assert_eq!(loaded.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_delete_older_than() {
        let store = InMemoryStatePersistence::new();
        let mut old = state("old");
        old.updated_at = Utc::now() - chrono::Duration::days(10);
        store.save(&key("old"), &old).await.unwrap();
        store.save(&key("new"), &state("new")).await.unwrap();

        let removed = store
            .delete_older_than(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&key("old")).await.unwrap().is_none());
        assert!(store.load(&key("new")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_json_file_roundtrip_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStatePersistence::open(dir.path().join("reviews"))
            .await
            .unwrap();

        let s = state("7");
        store.save(&key("7"), &s).await.unwrap();
        assert_eq!(store.load(&key("7")).await.unwrap().unwrap(), s);
        assert!(store.load(&key("8")).await.unwrap().is_none());

        let mut old = state("8");
        old.updated_at = Utc::now() - chrono::Duration::days(30);
        store.save(&key("8"), &old).await.unwrap();
        let removed = store
            .delete_older_than(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&key("7")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_json_file_key_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStatePersistence::open(dir.path()).await.unwrap();
        // Write review "1" under the file of review "2".
        let json = PersistedReview::new(&state("1")).to_json().unwrap();
        tokio::fs::write(store.path_for(&key("2")), json).await.unwrap();
        assert!(matches!(
            store.load(&key("2")).await,
            Err(PersistenceError::IntegrityCheckFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_json_file_lookalike_keys_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStatePersistence::open(dir.path()).await.unwrap();
        let slash = ReviewKey::new("github", "acme/widgets", "42");
        let underscore = ReviewKey::new("github", "acme_widgets", "42");

        let first = ReviewState::new(slash.clone());
        let second = ReviewState::new(underscore.clone());
        store.save(&slash, &first).await.unwrap();
        store.save(&underscore, &second).await.unwrap();

        assert_eq!(store.load(&slash).await.unwrap().unwrap().run_id, first.run_id);
        assert_eq!(store.load(&underscore).await.unwrap().unwrap().run_id, second.run_id);
    }

    #[cfg(feature = "heavy-state")]
    #[tokio::test]
    async fn test_rocksdb_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStatePersistence::open(dir.path().join("db")).unwrap();
        let s = state("9");
        store.save(&key("9"), &s).await.unwrap();
        assert_eq!(store.load(&key("9")).await.unwrap().unwrap(), s);
        assert_eq!(store.delete_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
    }
}
