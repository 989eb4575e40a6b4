//! Delivered-object ledger.
//!
//! One [`CheckpointRecord`] per `(container, object)` records the fingerprint
//! of the version that was fully delivered. Records are upserted, never
//! appended. An object is skipped only when a record exists *and* its
//! fingerprint matches the listed one; a replaced object is delivered again.
//!
//! Store failures are surfaced as [`CheckpointError`] and must never be read
//! as "processed".

pub mod memory;
pub mod object;

pub use memory::MemoryCheckpointStore;
pub use object::{ObjectStoreCheckpointStore, open_checkpoint_store};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::sync::Arc;

use crate::error::{CheckpointError, InvalidRowKeySnafu, RowKeyUtf8Snafu};
use crate::source::Fingerprint;

/// Shared handle to a checkpoint store.
pub type CheckpointStoreRef = Arc<dyn CheckpointStore>;

/// Encode an object name into a key safe for table-style stores.
///
/// URL-safe base64 with padding: total, injective, and free of `/ \ # ?`.
pub fn encode_row_key(name: &str) -> String {
    URL_SAFE.encode(name.as_bytes())
}

/// Reverse [`encode_row_key`].
pub fn decode_row_key(row_key: &str) -> Result<String, CheckpointError> {
    let bytes = URL_SAFE
        .decode(row_key)
        .context(InvalidRowKeySnafu { row_key })?;
    String::from_utf8(bytes).context(RowKeyUtf8Snafu { row_key })
}

/// Persisted proof that one object version was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Container name.
    pub partition_key: String,
    /// [`encode_row_key`] of the object name.
    pub row_key: String,
    pub fingerprint: Fingerprint,
    pub last_modified: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(
        container: &str,
        name: &str,
        fingerprint: &Fingerprint,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key: container.to_string(),
            row_key: encode_row_key(name),
            fingerprint: fingerprint.clone(),
            last_modified,
            processed_at: Utc::now(),
        }
    }

    /// The object name this record refers to.
    pub fn object_name(&self) -> Result<String, CheckpointError> {
        decode_row_key(&self.row_key)
    }
}

/// Durable `(container, name) -> fingerprint` ledger.
///
/// Implementations are shared by every worker and must be safe for
/// concurrent use without external locking.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the backing table if needed. Idempotent.
    async fn ensure_table(&self) -> Result<(), CheckpointError>;

    /// Fetch the record for `(container, row_key)`, if any.
    async fn get(
        &self,
        container: &str,
        row_key: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Insert or replace a record.
    async fn upsert(&self, record: CheckpointRecord) -> Result<(), CheckpointError>;

    /// Whether this exact object version was already delivered.
    async fn is_processed(
        &self,
        container: &str,
        name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, CheckpointError> {
        let record = self.get(container, &encode_row_key(name)).await?;
        Ok(record.is_some_and(|r| &r.fingerprint == fingerprint))
    }

    /// Record that this object version was delivered.
    async fn mark_processed(
        &self,
        container: &str,
        name: &str,
        fingerprint: &Fingerprint,
        last_modified: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        self.upsert(CheckpointRecord::new(
            container,
            name,
            fingerprint,
            last_modified,
        ))
        .await
    }
}
