//! `object_store`-backed sources.
//!
//! A storage account maps to one [`ObjectStoreSource`]; each container gets
//! its own `ObjectStore` client, created on first use and cached so every
//! poll cycle reuses the same HTTP connections.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::azure::{MicrosoftAzure, MicrosoftAzureBuilder};
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ByteStream, ObjectDescriptor, ObjectListing, ObjectSource};
use crate::config::AzureCredential;
use crate::error::{
    AzureConfigSnafu, HeadSnafu, LocalConfigSnafu, OpenSnafu, SourceError, StreamSnafu,
    UnknownContainerSnafu,
};

/// Build an Azure Blob client for one container.
pub fn azure_store(
    account: &str,
    container: &str,
    credential: &AzureCredential,
) -> Result<MicrosoftAzure, object_store::Error> {
    let builder = match credential {
        AzureCredential::Environment => MicrosoftAzureBuilder::from_env(),
        AzureCredential::AccessKey { key } => MicrosoftAzureBuilder::new().with_access_key(key),
        AzureCredential::BearerToken { token } => {
            MicrosoftAzureBuilder::new().with_bearer_token_authorization(token)
        }
        AzureCredential::Emulator => MicrosoftAzureBuilder::new().with_use_emulator(true),
    };

    builder
        .with_account(account)
        .with_container_name(container)
        .with_retry(RetryConfig::default())
        .build()
}

/// How container stores are created.
enum StoreFactory {
    Azure { credential: AzureCredential },
    Local { root: PathBuf },
    Fixed,
}

/// Object source for one storage account.
pub struct ObjectStoreSource {
    account: String,
    factory: StoreFactory,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl std::fmt::Debug for ObjectStoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreSource")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreSource {
    /// Azure Blob Storage account.
    pub fn azure(account: impl Into<String>, credential: AzureCredential) -> Self {
        Self::with_factory(account, StoreFactory::Azure { credential })
    }

    /// Local directory; container `c` is the directory `root/c`.
    pub fn local(account: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::with_factory(account, StoreFactory::Local { root: root.into() })
    }

    /// A fixed set of prebuilt container stores.
    pub fn from_stores<I, S>(account: impl Into<String>, stores: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn ObjectStore>)>,
        S: Into<String>,
    {
        let stores = stores.into_iter().map(|(c, s)| (c.into(), s)).collect();
        Self {
            account: account.into(),
            factory: StoreFactory::Fixed,
            stores: RwLock::new(stores),
        }
    }

    fn with_factory(account: impl Into<String>, factory: StoreFactory) -> Self {
        Self {
            account: account.into(),
            factory,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Build (or fetch) the store for `container`, surfacing setup errors early.
    pub async fn warm(&self, container: &str) -> Result<(), SourceError> {
        self.store_for(container).await.map(|_| ())
    }

    async fn store_for(&self, container: &str) -> Result<Arc<dyn ObjectStore>, SourceError> {
        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(container) {
                return Ok(store.clone());
            }
        }

        let mut stores = self.stores.write().await;
        // Another task may have won the race for the write lock.
        if let Some(store) = stores.get(container) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match &self.factory {
            StoreFactory::Azure { credential } => Arc::new(
                azure_store(&self.account, container, credential).context(AzureConfigSnafu {
                    account: &self.account,
                })?,
            ),
            StoreFactory::Local { root } => {
                let dir = root.join(container);
                Arc::new(
                    LocalFileSystem::new_with_prefix(&dir).context(LocalConfigSnafu {
                        path: dir.display().to_string(),
                    })?,
                )
            }
            StoreFactory::Fixed => {
                return UnknownContainerSnafu {
                    account: &self.account,
                    container,
                }
                .fail();
            }
        };

        debug!(account = %self.account, container, "Created container store");
        stores.insert(container.to_string(), store.clone());
        Ok(store)
    }
}

/// Parse an object name back into a store path.
fn object_path(name: &str) -> Path {
    Path::parse(name).unwrap_or_else(|_| Path::from(name))
}

/// The directory to list for a raw string prefix.
///
/// Stores list by path segment, while prefixes match on the raw name
/// (`logs/2024-0` must match `logs/2024-01.json`), so list the deepest
/// complete directory and filter the rest.
fn listing_dir(prefix: &str) -> Option<Path> {
    prefix
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
        .map(Path::from)
}

#[async_trait]
impl ObjectSource for ObjectStoreSource {
    async fn list(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<ObjectListing, SourceError> {
        let store = self.store_for(container).await?;

        let prefix = prefix.unwrap_or_default().to_string();
        let dir = listing_dir(&prefix);
        let container = container.to_string();

        let listing = store
            .list(dir.as_ref())
            .try_filter({
                let prefix = prefix.clone();
                move |meta| std::future::ready(meta.location.as_ref().starts_with(&prefix))
            })
            .map(move |result| match result {
                Ok(meta) => Ok(ObjectDescriptor::from_meta(&container, meta)),
                Err(source) => Err(SourceError::List {
                    container: container.clone(),
                    prefix: prefix.clone(),
                    source,
                }),
            })
            .boxed();

        Ok(listing)
    }

    async fn open_stream(&self, container: &str, name: &str) -> Result<ByteStream, SourceError> {
        let store = self.store_for(container).await?;
        let result = store
            .get(&object_path(name))
            .await
            .context(OpenSnafu { container, name })?;

        let container = container.to_string();
        let name = name.to_string();
        let stream = result
            .into_stream()
            .map(move |chunk| {
                chunk.context(StreamSnafu {
                    container: &container,
                    name: &name,
                })
            })
            .boxed();

        Ok(stream)
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool, SourceError> {
        let store = self.store_for(container).await?;
        match store.head(&object_path(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(source).context(HeadSnafu { container, name }),
        }
    }
}
