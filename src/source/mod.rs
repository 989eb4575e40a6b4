//! Object sources: listing and streaming blobs from storage accounts.
//!
//! The pipeline only sees the [`ObjectSource`] trait. [`blob`] implements it
//! over `object_store` (Azure, local directories, in-memory stores) and
//! [`registry`] maps configured account names to sources.

pub mod blob;
pub mod descriptor;
pub mod registry;

pub use blob::ObjectStoreSource;
pub use descriptor::{Fingerprint, ObjectDescriptor};
pub use registry::SourceRegistry;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::SourceError;

/// Stream of listed objects, in source order.
pub type ObjectListing = BoxStream<'static, Result<ObjectDescriptor, SourceError>>;

/// Stream of raw content chunks with arbitrary boundaries.
pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Shared handle to an object source.
pub type ObjectSourceRef = Arc<dyn ObjectSource>;

/// Lists and streams objects in the containers of one storage account.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// List objects in `container` whose name starts with `prefix`.
    async fn list(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<ObjectListing, SourceError>;

    /// Stream the content of one object.
    async fn open_stream(&self, container: &str, name: &str) -> Result<ByteStream, SourceError>;

    /// Whether an object currently exists.
    async fn exists(&self, container: &str, name: &str) -> Result<bool, SourceError>;
}
