//! In-process checkpoint store.
//!
//! Useful for dry runs and tests. Reads and writes can be made to fail so
//! callers can exercise the "store unreachable" paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{CheckpointRecord, CheckpointStore};
use crate::error::CheckpointError;

/// Checkpoint store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<(String, String), CheckpointRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get` fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `upsert` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful upserts.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot of all records, sorted by key.
    pub async fn records(&self) -> Vec<CheckpointRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.partition_key, &a.row_key).cmp(&(&b.partition_key, &b.row_key))
        });
        records
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn ensure_table(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn get(
        &self,
        container: &str,
        row_key: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable {
                message: "reads disabled".to_string(),
            });
        }
        let key = (container.to_string(), row_key.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn upsert(&self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable {
                message: "writes disabled".to_string(),
            });
        }
        let key = (record.partition_key.clone(), record.row_key.clone());
        self.records.write().await.insert(key, record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
