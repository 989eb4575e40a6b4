//! Configuration for the forwarder.
//!
//! Loading is three steps: `${VAR}` interpolation over the raw YAML, parsing,
//! then a small set of environment overrides, followed by validation.
//!
//! ```yaml
//! tenants:
//!   - name: contoso
//!     storage_accounts:
//!       - name: contosologs
//!         containers:
//!           - name: insights-logs-signinlogs
//!             prefixes: ["resourceId=/TENANTS/"]
//!             log_type: AZURE_AD
//! ingestion:
//!   endpoint: https://ingest.example.com/v2/unstructuredlogentries:batchCreate
//!   customer_id: ${CUSTOMER_ID}
//! checkpoint:
//!   url: az://forwarder@contosostate
//! ```

pub mod path;
pub mod vars;

pub use path::CliArgs;
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::batch::envelope_overhead;
use crate::error::{
    BatchBudgetTooSmallSnafu, ConfigError, DuplicateAccountSnafu, EmptyCheckpointUrlSnafu,
    EmptyCustomerIdSnafu, EmptyEndpointSnafu, EmptyLogTypeSnafu, EnvInterpolationSnafu,
    EnvOverrideSnafu, NoContainersSnafu, NoStorageAccountsSnafu, NoTenantsSnafu, ReadFileSnafu,
    UnsupportedFormatSnafu, YamlParseSnafu, ZeroAttemptsSnafu, ZeroConcurrencySnafu,
};
use crate::metrics::server::DEFAULT_METRICS_ADDR;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Largest request body the ingestion API accepts.
pub const MAX_PAYLOAD_BYTES: usize = 10 * MB;

/// Default name of the checkpoint table.
pub const DEFAULT_CHECKPOINT_TABLE: &str = "forwarderstate";

/// Overrides `ingestion.customer_id`.
pub const ENV_CUSTOMER_ID: &str = "FLURRY_CUSTOMER_ID";
/// Overrides `forwarder.poll_interval_secs`.
pub const ENV_POLL_INTERVAL: &str = "FLURRY_POLL_INTERVAL_SECS";
/// Overrides `checkpoint.table`.
pub const ENV_CHECKPOINT_TABLE: &str = "FLURRY_CHECKPOINT_TABLE";

/// Credential used to reach an Azure storage account.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AzureCredential {
    /// Resolve credentials from `AZURE_*` environment variables
    /// (workload identity, managed identity, client secret).
    #[default]
    Environment,
    /// Shared account key.
    AccessKey { key: String },
    /// Pre-issued bearer token.
    BearerToken { token: String },
    /// Local Azurite emulator with its well-known key.
    Emulator,
}

impl std::fmt::Debug for AzureCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureCredential::Environment => f.write_str("Environment"),
            AzureCredential::AccessKey { .. } => f.write_str("AccessKey(<redacted>)"),
            AzureCredential::BearerToken { .. } => f.write_str("BearerToken(<redacted>)"),
            AzureCredential::Emulator => f.write_str("Emulator"),
        }
    }
}

/// Where a storage account's containers live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AccountBackend {
    /// Azure Blob Storage; the account name is the storage account's `name`.
    Azure {
        #[serde(default)]
        credential: AzureCredential,
    },
    /// Local directory; each container is a subdirectory of `root`.
    Local { root: PathBuf },
}

impl Default for AccountBackend {
    fn default() -> Self {
        AccountBackend::Azure {
            credential: AzureCredential::default(),
        }
    }
}

/// How object bytes are decoded before line splitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// Plain NDJSON.
    None,
    /// Gzip-compressed NDJSON.
    Gzip,
    /// Gzip when the object name ends in `.gz`, plain otherwise.
    #[default]
    Auto,
}

impl CompressionFormat {
    /// Whether `name` should be gunzipped.
    pub fn is_gzip(self, name: &str) -> bool {
        match self {
            CompressionFormat::None => false,
            CompressionFormat::Gzip => true,
            CompressionFormat::Auto => name.ends_with(".gz"),
        }
    }
}

/// A container to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub name: String,
    /// Prefixes listed in order; empty means one unscoped listing.
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Record type sent with every batch from this container.
    pub log_type: String,
    #[serde(default)]
    pub compression: CompressionFormat,
}

/// A storage account and the containers to poll in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageAccountConfig {
    pub name: String,
    #[serde(default)]
    pub backend: AccountBackend,
    pub containers: Vec<ContainerConfig>,
}

/// A tenant groups storage accounts for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub storage_accounts: Vec<StorageAccountConfig>,
}

fn default_metadata_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

/// How the ingestion bearer token is obtained.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AuthConfig {
    /// A fixed token that never expires.
    Static { token: String },
    /// The instance metadata server of the host.
    MetadataServer {
        #[serde(default = "default_metadata_url")]
        url: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::MetadataServer {
            url: default_metadata_url(),
            scopes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::Static { .. } => f.write_str("Static(<redacted>)"),
            AuthConfig::MetadataServer { url, scopes } => f
                .debug_struct("MetadataServer")
                .field("url", url)
                .field("scopes", scopes)
                .finish(),
        }
    }
}

/// Retry behaviour for batch delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// The remote ingestion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestionConfig {
    pub endpoint: String,
    pub customer_id: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// Where delivered-object records are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// `az://container@account`, `https://account.blob.core.windows.net/container`,
    /// `file:///path`, or `memory://`.
    pub url: String,
    #[serde(default = "default_checkpoint_table")]
    pub table: String,
    #[serde(default)]
    pub credential: AzureCredential,
}

fn default_checkpoint_table() -> String {
    DEFAULT_CHECKPOINT_TABLE.to_string()
}

/// Poll loop and batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwarderConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Random extra delay (0..N seconds) added to every sleep.
    #[serde(default)]
    pub poll_jitter_secs: u64,
    /// Serialized request budget, envelope included. Capped at 10 MiB.
    #[serde(default = "default_max_bytes_per_batch")]
    pub max_bytes_per_batch: usize,
    #[serde(default)]
    pub max_entries_per_batch: Option<usize>,
    /// Containers processed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_bytes_per_batch() -> usize {
    1_000_000
}

fn default_concurrency() -> usize {
    4
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_jitter_secs: 0,
            max_bytes_per_batch: default_max_bytes_per_batch(),
            max_entries_per_batch: None,
            concurrency: default_concurrency(),
        }
    }
}

impl ForwarderConfig {
    /// The batch budget actually applied.
    pub fn effective_max_bytes(&self) -> usize {
        self.max_bytes_per_batch.min(MAX_PAYLOAD_BYTES)
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Free-form deployment label (e.g. `prod`), logged at startup.
    #[serde(default)]
    pub env: Option<String>,
    pub tenants: Vec<TenantConfig>,
    pub ingestion: IngestionConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        ensure!(
            path::is_yaml_file(path),
            UnsupportedFormatSnafu {
                path: path.to_path_buf()
            }
        );
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu {
            path: path.to_path_buf(),
        })?;
        Self::parse(&contents)
    }

    /// Parse configuration against the process environment.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Self::parse_with(contents, |name| std::env::var(name).ok())
    }

    /// Parse configuration, resolving variables through `lookup`.
    pub fn parse_with<F>(contents: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let result = interpolate_with(contents, &lookup);
        ensure!(
            result.is_ok(),
            EnvInterpolationSnafu {
                message: result.errors.join("\n")
            }
        );

        let mut config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
        config.apply_env_overrides(&lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply the `FLURRY_*` overrides. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(customer_id) = get(ENV_CUSTOMER_ID) {
            self.ingestion.customer_id = customer_id;
        }

        if let Some(value) = get(ENV_POLL_INTERVAL) {
            self.forwarder.poll_interval_secs =
                value.trim().parse().map_err(|_| {
                    EnvOverrideSnafu {
                        var: ENV_POLL_INTERVAL,
                        value: value.clone(),
                    }
                    .build()
                })?;
        }

        if let Some(table) = get(ENV_CHECKPOINT_TABLE) {
            self.checkpoint.table = table;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.tenants.is_empty(), NoTenantsSnafu);
        ensure!(!self.ingestion.endpoint.trim().is_empty(), EmptyEndpointSnafu);
        ensure!(
            !self.ingestion.customer_id.trim().is_empty(),
            EmptyCustomerIdSnafu
        );
        ensure!(!self.checkpoint.url.trim().is_empty(), EmptyCheckpointUrlSnafu);
        ensure!(self.forwarder.concurrency > 0, ZeroConcurrencySnafu);
        ensure!(self.ingestion.retry.max_attempts > 0, ZeroAttemptsSnafu);

        let max = self.forwarder.effective_max_bytes();
        let mut accounts = HashSet::new();

        for tenant in &self.tenants {
            ensure!(
                !tenant.storage_accounts.is_empty(),
                NoStorageAccountsSnafu {
                    tenant: tenant.name.clone()
                }
            );

            for account in &tenant.storage_accounts {
                ensure!(
                    accounts.insert(account.name.as_str()),
                    DuplicateAccountSnafu {
                        account: account.name.clone()
                    }
                );
                ensure!(
                    !account.containers.is_empty(),
                    NoContainersSnafu {
                        account: account.name.clone()
                    }
                );

                for container in &account.containers {
                    ensure!(
                        !container.log_type.trim().is_empty(),
                        EmptyLogTypeSnafu {
                            container: container.name.clone()
                        }
                    );

                    // Room for at least the smallest entry, `{}`.
                    let overhead =
                        envelope_overhead(&self.ingestion.customer_id, &container.log_type);
                    ensure!(max >= overhead + 2, BatchBudgetTooSmallSnafu { max, overhead });
                }
            }
        }

        Ok(())
    }

    /// Iterate `(tenant, account, container)` in configuration order.
    pub fn containers(
        &self,
    ) -> impl Iterator<Item = (&TenantConfig, &StorageAccountConfig, &ContainerConfig)> {
        self.tenants.iter().flat_map(|tenant| {
            tenant.storage_accounts.iter().flat_map(move |account| {
                account
                    .containers
                    .iter()
                    .map(move |container| (tenant, account, container))
            })
        })
    }

    /// Total number of configured containers.
    pub fn container_count(&self) -> usize {
        self.containers().count()
    }
}
