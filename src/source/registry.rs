//! Storage account name to source mapping.

use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{ObjectSource, ObjectSourceRef, ObjectStoreSource};
use crate::config::{AccountBackend, Config};
use crate::error::{SourceError, UnknownAccountSnafu};

/// Resolves configured storage accounts to their sources.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, ObjectSourceRef>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source per configured storage account and create a client for
    /// every configured container.
    pub async fn from_config(config: &Config) -> Result<Self, SourceError> {
        let mut registry = Self::new();

        for tenant in &config.tenants {
            for account in &tenant.storage_accounts {
                let source = match &account.backend {
                    AccountBackend::Azure { credential } => {
                        ObjectStoreSource::azure(&account.name, credential.clone())
                    }
                    AccountBackend::Local { root } => {
                        ObjectStoreSource::local(&account.name, root.clone())
                    }
                };

                for container in &account.containers {
                    source.warm(&container.name).await?;
                }

                info!(
                    tenant = %tenant.name,
                    account = %account.name,
                    containers = account.containers.len(),
                    "Registered storage account"
                );
                registry.insert(&account.name, Arc::new(source));
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, account: impl Into<String>, source: Arc<dyn ObjectSource>) {
        self.sources.insert(account.into(), source);
    }

    pub fn get(&self, account: &str) -> Result<ObjectSourceRef, SourceError> {
        self.sources
            .get(account)
            .cloned()
            .context(UnknownAccountSnafu { account })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
