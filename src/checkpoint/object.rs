//! Checkpoint store on top of `object_store`.
//!
//! Each record is a small JSON document at
//! `{prefix}/{table}/{partition_key}/{row_key}.json`. Row keys longer than
//! [`MAX_SEGMENT_LEN`] are split into nested segments so that no file name
//! exceeds the 255-byte limit of local disks and hierarchical-namespace
//! accounts. A single `put` replaces
//! the document atomically, which gives upsert semantics on every backend.
//! The table itself is a marker object created with create-if-absent.

use async_trait::async_trait;
use chrono::Utc;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutPayload};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CheckpointRecord, CheckpointStore, CheckpointStoreRef};
use crate::config::CheckpointConfig;
use crate::error::{
    BackendSnafu, CheckpointError, CreateTableSnafu, EncodeSnafu, InvalidUrlSnafu, LocalDirSnafu,
    ReadRecordSnafu, WriteRecordSnafu,
};
use crate::source::blob::azure_store;

/// Name of the marker object that represents the table.
const TABLE_MARKER: &str = "_table.json";

/// Longest row-key segment in a record path.
const MAX_SEGMENT_LEN: usize = 200;

/// Where checkpoint documents live, parsed from `checkpoint.url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointLocation {
    Memory,
    Local(PathBuf),
    Azure {
        account: String,
        container: String,
        prefix: Option<String>,
    },
}

impl CheckpointLocation {
    /// Parse a checkpoint URL.
    ///
    /// Accepted forms: `memory://`, `file:///dir`, `/dir`,
    /// `az://container@account[/prefix]` (also `abfs://`, `abfss://`), and
    /// `https://account.blob.core.windows.net/container[/prefix]`.
    pub fn parse(url: &str) -> Result<Self, CheckpointError> {
        let trimmed = url.trim();

        if trimmed == "memory://" {
            return Ok(CheckpointLocation::Memory);
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            ensure!(!path.is_empty(), InvalidUrlSnafu { url });
            return Ok(CheckpointLocation::Local(PathBuf::from(path)));
        }
        if trimmed.starts_with('/') {
            return Ok(CheckpointLocation::Local(PathBuf::from(trimmed)));
        }

        if let Some(rest) = ["az://", "abfs://", "abfss://"]
            .iter()
            .find_map(|scheme| trimmed.strip_prefix(scheme))
        {
            let (authority, prefix) = split_path(rest);
            let (container, host) = authority
                .split_once('@')
                .context(InvalidUrlSnafu { url })?;
            let account = host.split('.').next().unwrap_or_default();
            return Self::azure(url, account, container, prefix);
        }

        if let Some(rest) = trimmed.strip_prefix("https://")
            && let Some((host, path)) = rest.split_once('/')
            && host.ends_with(".blob.core.windows.net")
        {
            let account = host.split('.').next().unwrap_or_default();
            let (container, prefix) = split_path(path);
            return Self::azure(url, account, container, prefix);
        }

        InvalidUrlSnafu { url }.fail()
    }

    fn azure(
        url: &str,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Self, CheckpointError> {
        ensure!(
            !account.is_empty() && !container.is_empty(),
            InvalidUrlSnafu { url }
        );
        Ok(CheckpointLocation::Azure {
            account: account.to_string(),
            container: container.to_string(),
            prefix: prefix.map(str::to_string),
        })
    }
}

/// Split `head/rest/of/path` into `("head", Some("rest/of/path"))`.
fn split_path(s: &str) -> (&str, Option<&str>) {
    match s.split_once('/') {
        Some((head, rest)) => {
            let rest = rest.trim_matches('/');
            (head, (!rest.is_empty()).then_some(rest))
        }
        None => (s, None),
    }
}

/// Build the checkpoint store described by `config`.
pub fn open_checkpoint_store(
    config: &CheckpointConfig,
) -> Result<CheckpointStoreRef, CheckpointError> {
    let url = config.url.as_str();
    let location = CheckpointLocation::parse(url)?;

    let (store, prefix): (Arc<dyn ObjectStore>, Option<String>) = match location {
        CheckpointLocation::Memory => (Arc::new(InMemory::new()), None),
        CheckpointLocation::Local(path) => {
            std::fs::create_dir_all(&path).context(LocalDirSnafu { path: &path })?;
            let fs = LocalFileSystem::new_with_prefix(&path).context(BackendSnafu { url })?;
            (Arc::new(fs), None)
        }
        CheckpointLocation::Azure {
            account,
            container,
            prefix,
        } => {
            let azure = azure_store(&account, &container, &config.credential)
                .context(BackendSnafu { url })?;
            (Arc::new(azure), prefix)
        }
    };

    info!(url, table = %config.table, "Opened checkpoint store");
    Ok(Arc::new(ObjectStoreCheckpointStore::new(
        store,
        prefix.as_deref(),
        &config.table,
    )))
}

/// Checkpoint store that keeps one JSON document per record.
pub struct ObjectStoreCheckpointStore {
    store: Arc<dyn ObjectStore>,
    table: String,
    root: Path,
}

impl std::fmt::Debug for ObjectStoreCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreCheckpointStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreCheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<&str>, table: &str) -> Self {
        let root = match prefix {
            Some(prefix) => Path::from(prefix).child(table),
            None => Path::from(table),
        };
        Self {
            store,
            table: table.to_string(),
            root,
        }
    }

    fn record_path(&self, container: &str, row_key: &str) -> Path {
        let mut path = self.root.child(container);
        let mut rest = row_key;
        while let Some((cut, _)) = rest.char_indices().nth(MAX_SEGMENT_LEN) {
            let (head, tail) = rest.split_at(cut);
            path = path.child(head);
            rest = tail;
        }
        path.child(format!("{rest}.json"))
    }

    fn marker_path(&self) -> Path {
        self.root.child(TABLE_MARKER)
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreCheckpointStore {
    async fn ensure_table(&self) -> Result<(), CheckpointError> {
        let marker = serde_json::json!({
            "table": self.table,
            "created_at": Utc::now(),
        });
        let body = serde_json::to_vec(&marker).context(EncodeSnafu)?;

        match self
            .store
            .put_opts(&self.marker_path(), PutPayload::from(body), PutMode::Create.into())
            .await
        {
            Ok(_) => {
                info!(table = %self.table, "Created checkpoint table");
                Ok(())
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!(table = %self.table, "Checkpoint table already exists");
                Ok(())
            }
            Err(source) => Err(source).context(CreateTableSnafu { table: &self.table }),
        }
    }

    async fn get(
        &self,
        container: &str,
        row_key: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.record_path(container, row_key);

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => {
                return Err(source).context(ReadRecordSnafu {
                    key: path.to_string(),
                });
            }
        };

        let bytes = result.bytes().await.context(ReadRecordSnafu {
            key: path.to_string(),
        })?;

        match serde_json::from_slice::<CheckpointRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    key = %path,
                    error = %e,
                    "Failed to parse checkpoint record, treating object as unprocessed"
                );
                Ok(None)
            }
        }
    }

    async fn upsert(&self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.record_path(&record.partition_key, &record.row_key);
        let body = serde_json::to_vec_pretty(&record).context(EncodeSnafu)?;

        self.store
            .put(&path, PutPayload::from(body))
            .await
            .context(WriteRecordSnafu {
                key: path.to_string(),
            })?;

        debug!(key = %path, etag = %record.fingerprint.etag, "Saved checkpoint");
        Ok(())
    }
}
