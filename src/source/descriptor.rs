//! Listed object metadata.

use chrono::{DateTime, Utc};
use object_store::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Version identity of an object: opaque version token plus byte count.
///
/// Two listings of the same name with equal fingerprints are the same
/// content as far as delivery is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub etag: String,
    pub size: u64,
}

impl Fingerprint {
    pub fn new(etag: impl Into<String>, size: u64) -> Self {
        Self {
            etag: etag.into(),
            size,
        }
    }
}

/// One object as seen by a listing. Immutable once listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub container: String,
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Informational only; never used for identity.
    pub last_modified: DateTime<Utc>,
}

impl ObjectDescriptor {
    /// Build a descriptor from `object_store` metadata.
    ///
    /// Backends that report no ETag fall back to the version id, then to the
    /// modification time.
    pub fn from_meta(container: &str, meta: ObjectMeta) -> Self {
        let etag = meta
            .e_tag
            .or(meta.version)
            .unwrap_or_else(|| meta.last_modified.to_rfc3339());

        Self {
            container: container.to_string(),
            name: meta.location.to_string(),
            fingerprint: Fingerprint::new(etag, meta.size as u64),
            last_modified: meta.last_modified,
        }
    }

    pub fn size(&self) -> u64 {
        self.fingerprint.size
    }
}
