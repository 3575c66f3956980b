//! Idempotency ledger for management actions
//!
//! Records the retained output of every successfully applied action, keyed by
//! idempotency key. A caller must hold the key's reservation for the whole
//! "check, invoke, record" sequence, so two workers can never invoke the same
//! key concurrently.
//!
//! Committed records can optionally be persisted as JSON so that a restarted
//! driver replays instead of re-invoking.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

/// Errors from ledger persistence
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A committed action application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub key: String,
    pub parameters_hash: String,
    pub output: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Keyed store of committed action outputs
pub struct IdempotencyLedger {
    committed: DashMap<String, LedgerRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    persistence_path: Option<PathBuf>,
    write_lock: std::sync::Mutex<()>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyLedger {
    /// Create an in-memory ledger
    pub fn new() -> Self {
        Self {
            committed: DashMap::new(),
            locks: DashMap::new(),
            persistence_path: None,
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Create a ledger persisted at `path`, loading any existing records
    pub fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let ledger = Self {
            persistence_path: Some(path.clone()),
            ..Self::new()
        };

        if path.exists() {
            let records = load_records(&path)?;
            info!(path = %path.display(), records = records.len(), "Loaded idempotency ledger");
            for record in records {
                ledger.committed.insert(record.key.clone(), record);
            }
        }

        Ok(ledger)
    }

    /// Reserve `key` for the caller.
    ///
    /// Waits until no other worker holds the key. The reservation is released
    /// when dropped or committed.
    pub async fn reserve(&self, key: &str) -> KeyReservation<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        KeyReservation {
            ledger: self,
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Look up a committed record without reserving the key
    pub fn get(&self, key: &str) -> Option<LedgerRecord> {
        self.committed.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    fn record(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        debug!(key = %record.key, "Recording action in idempotency ledger");
        let key = record.key.clone();
        self.committed.insert(key.clone(), record);

        if let Some(path) = &self.persistence_path {
            // Workers committing different keys share one file
            let _write = self
                .write_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = self.save_to_disk(path) {
                error!(
                    key = %key,
                    path = %path.display(),
                    error = %e,
                    "Failed to persist idempotency ledger, record is held in memory only"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write all committed records atomically using a temp file
    fn save_to_disk(&self, path: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut records: Vec<LedgerRecord> =
            self.committed.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let json = serde_json::to_vec_pretty(&records)?;

        let temp_path = path.with_extension("tmp");
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: temp_path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        std::fs::rename(&temp_path, path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}

fn load_records(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let content = std::fs::read(path).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// Exclusive hold on one idempotency key
pub struct KeyReservation<'a> {
    ledger: &'a IdempotencyLedger,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyReservation<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Previously committed record for this key, if any
    pub fn recorded(&self) -> Option<LedgerRecord> {
        self.ledger.get(&self.key)
    }

    /// Record a successful application and release the key.
    ///
    /// With persistence enabled, an error means the record was kept in memory
    /// but did not reach disk, so a restarted driver would not replay it.
    pub fn commit(
        self,
        parameters_hash: String,
        output: Value,
    ) -> Result<LedgerRecord, LedgerError> {
        let record = LedgerRecord {
            key: self.key.clone(),
            parameters_hash,
            output,
            recorded_at: Utc::now(),
        };
        self.ledger.record(record.clone())?;
        Ok(record)
    }
}

impl Drop for KeyReservation<'_> {
    fn drop(&mut self) {
        // Only the map and this reservation hold the lock, so nobody is waiting
        self.ledger
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}
