//! Error types for the forwarder.
//!
//! Each concern owns a snafu enum. Object-level failures are wrapped in
//! [`ObjectError`], which records the stage the object failed at; only
//! [`ForwarderError`] is allowed to end the process.

use snafu::prelude::*;

use crate::metrics::events::FailureStage;

// ============ Source Errors ============

/// Errors raised while listing or streaming source objects.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Listing a container (optionally under a prefix) failed.
    #[snafu(display("Failed to list {container}/{prefix}: {source}"))]
    List {
        container: String,
        prefix: String,
        source: object_store::Error,
    },

    /// Opening an object for reading failed.
    #[snafu(display("Failed to open {container}/{name}: {source}"))]
    Open {
        container: String,
        name: String,
        source: object_store::Error,
    },

    /// A chunk failed while the object was being streamed.
    #[snafu(display("Stream of {container}/{name} failed: {source}"))]
    Stream {
        container: String,
        name: String,
        source: object_store::Error,
    },

    /// Checking whether an object exists failed.
    #[snafu(display("Failed to stat {container}/{name}: {source}"))]
    Head {
        container: String,
        name: String,
        source: object_store::Error,
    },

    /// Gzip decompression failed.
    #[snafu(display("Failed to decompress {name}: {source}"))]
    Decompress {
        name: String,
        source: std::io::Error,
    },

    /// The Azure client for an account could not be built.
    #[snafu(display("Azure configuration error for account '{account}': {source}"))]
    AzureConfig {
        account: String,
        source: object_store::Error,
    },

    /// A local directory could not be opened as a store.
    #[snafu(display("Local storage error for {path}: {source}"))]
    LocalConfig {
        path: String,
        source: object_store::Error,
    },

    /// A fixed-store source has no store for the container.
    #[snafu(display("Container '{container}' is not known to account '{account}'"))]
    UnknownContainer { account: String, container: String },

    /// No source is registered under the given account name.
    #[snafu(display("No source registered for storage account '{account}'"))]
    UnknownAccount { account: String },
}

impl SourceError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            SourceError::Open { source, .. }
            | SourceError::Head { source, .. }
            | SourceError::List { source, .. } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Checkpoint Errors ============

/// Errors raised by a checkpoint store.
///
/// These are never folded into a processed/unprocessed answer; callers treat
/// them as "retry next cycle".
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Reading a checkpoint record failed for a reason other than "absent".
    #[snafu(display("Failed to read checkpoint {key}: {source}"))]
    ReadRecord {
        key: String,
        source: object_store::Error,
    },

    /// Writing a checkpoint record failed.
    #[snafu(display("Failed to write checkpoint {key}: {source}"))]
    WriteRecord {
        key: String,
        source: object_store::Error,
    },

    /// Creating the checkpoint table marker failed.
    #[snafu(display("Failed to create checkpoint table '{table}': {source}"))]
    CreateTable {
        table: String,
        source: object_store::Error,
    },

    /// A record could not be serialized.
    #[snafu(display("Failed to encode checkpoint record: {source}"))]
    Encode { source: serde_json::Error },

    /// A row key was not valid URL-safe base64.
    #[snafu(display("Invalid row key '{row_key}': {source}"))]
    InvalidRowKey {
        row_key: String,
        source: base64::DecodeError,
    },

    /// A decoded row key was not valid UTF-8.
    #[snafu(display("Row key '{row_key}' does not decode to UTF-8"))]
    RowKeyUtf8 {
        row_key: String,
        source: std::string::FromUtf8Error,
    },

    /// The checkpoint URL does not name a supported backend.
    #[snafu(display("Unsupported checkpoint URL: {url}"))]
    InvalidUrl { url: String },

    /// A local checkpoint directory could not be created.
    #[snafu(display("Failed to create checkpoint directory {}: {source}", path.display()))]
    LocalDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The checkpoint backend could not be constructed.
    #[snafu(display("Failed to build checkpoint backend for {url}: {source}"))]
    Backend {
        url: String,
        source: object_store::Error,
    },

    /// The backing store is unavailable (used by in-memory test doubles).
    #[snafu(display("Checkpoint store unavailable: {message}"))]
    Unavailable { message: String },
}

// ============ Batch Errors ============

/// A single record does not fit in an empty envelope.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[snafu(display("Record of {size} bytes exceeds the batch budget of {max} bytes"))]
pub struct OversizedRecord {
    pub size: usize,
    pub max: usize,
}

// ============ Auth Errors ============

/// Errors raised while obtaining a bearer token.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AuthError {
    /// The token request could not be sent.
    #[snafu(display("Token request failed: {source}"))]
    TokenRequest { source: reqwest::Error },

    /// The token endpoint answered with a non-success status.
    #[snafu(display("Token endpoint returned HTTP {status}"))]
    TokenStatus { status: u16 },

    /// The token response body was not the expected JSON.
    #[snafu(display("Failed to decode token response: {source}"))]
    TokenDecode { source: reqwest::Error },

    /// The token endpoint returned an empty token.
    #[snafu(display("Token endpoint returned an empty access token"))]
    EmptyToken,
}

// ============ Delivery Errors ============

/// Errors raised while delivering a batch to the ingestion endpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeliveryError {
    /// The endpoint answered with a non-success status.
    #[snafu(display("Ingestion endpoint returned HTTP {status}: {body}"))]
    Status { status: u16, body: String },

    /// The request never produced a response.
    #[snafu(display("Transport error: {source}"))]
    Transport { source: reqwest::Error },

    /// The batch envelope could not be serialized.
    #[snafu(display("Failed to serialize batch: {source}"))]
    Serialize { source: serde_json::Error },

    /// A bearer token could not be obtained.
    #[snafu(display("Authentication failed: {source}"))]
    Auth { source: AuthError },

    /// Every attempt allowed by the retry policy failed.
    #[snafu(display("Delivery failed after {attempts} attempts: {source}"))]
    RetriesExhausted {
        attempts: u32,
        #[snafu(source(from(DeliveryError, Box::new)))]
        source: Box<DeliveryError>,
    },
}

impl DeliveryError {
    /// Whether this outcome is transient and worth another attempt.
    ///
    /// Rate limiting and server errors are transient, as are timeouts and
    /// refused connections. Every other status is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Status { status, .. } => is_retryable_status(*status),
            DeliveryError::Transport { source } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Status { status: 429, .. } => "rate_limited",
            DeliveryError::Status { status, .. } if *status >= 500 => "server_error",
            DeliveryError::Status { .. } => "client_error",
            DeliveryError::Transport { .. } => "transport",
            DeliveryError::Serialize { .. } => "serialize",
            DeliveryError::Auth { .. } => "auth",
            DeliveryError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Statuses retried by default: 429 and the 5xx class.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

// ============ Object Errors ============

/// Failure of a single object, tagged with the stage it failed at.
///
/// Never escapes the per-object unit: the orchestrator logs and counts it and
/// leaves the checkpoint untouched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ObjectError {
    /// The checkpoint lookup failed before any work was done.
    #[snafu(display("Checkpoint lookup failed: {source}"))]
    Lookup { source: CheckpointError },

    /// Reading the object failed part way.
    #[snafu(display("Read failed: {source}"))]
    Read { source: SourceError },

    /// A batch could not be delivered.
    #[snafu(display("Delivery failed: {source}"))]
    Deliver { source: DeliveryError },

    /// A record cannot fit into any batch.
    #[snafu(display("Undeliverable record: {source}"))]
    Oversized { source: OversizedRecord },

    /// All batches were delivered but the checkpoint write failed.
    #[snafu(display("Checkpoint write failed after delivery: {source}"))]
    MarkProcessed { source: CheckpointError },
}

impl ObjectError {
    /// Stage at which the object failed.
    pub fn stage(&self) -> FailureStage {
        match self {
            ObjectError::Lookup { .. } => FailureStage::Lookup,
            ObjectError::Read { .. } => FailureStage::Read,
            ObjectError::Deliver { .. } => FailureStage::Deliver,
            ObjectError::Oversized { .. } => FailureStage::Oversized,
            ObjectError::MarkProcessed { .. } => FailureStage::Checkpoint,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// An environment override held an unusable value.
    #[snafu(display("Invalid value '{value}' for {var}"))]
    EnvOverride { var: String, value: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// No tenants are configured.
    #[snafu(display("At least one tenant must be configured"))]
    NoTenants,

    /// A tenant has no storage accounts.
    #[snafu(display("Tenant '{tenant}' has no storage accounts"))]
    NoStorageAccounts { tenant: String },

    /// A storage account has no containers.
    #[snafu(display("Storage account '{account}' has no containers"))]
    NoContainers { account: String },

    /// The same storage account name appears twice.
    #[snafu(display("Storage account '{account}' is configured more than once"))]
    DuplicateAccount { account: String },

    /// A container has an empty log type.
    #[snafu(display("Container '{container}' has an empty log_type"))]
    EmptyLogType { container: String },

    /// Ingestion endpoint is empty.
    #[snafu(display("Ingestion endpoint cannot be empty"))]
    EmptyEndpoint,

    /// Customer id is empty.
    #[snafu(display("Ingestion customer_id cannot be empty"))]
    EmptyCustomerId,

    /// Checkpoint URL is empty.
    #[snafu(display("Checkpoint url cannot be empty"))]
    EmptyCheckpointUrl,

    /// The batch budget cannot hold even one entry.
    #[snafu(display(
        "max_bytes_per_batch ({max}) must exceed the envelope overhead ({overhead} bytes)"
    ))]
    BatchBudgetTooSmall { max: usize, overhead: usize },

    /// Concurrency must be at least one.
    #[snafu(display("concurrency must be at least 1"))]
    ZeroConcurrency,

    /// Retry policy must allow at least one attempt.
    #[snafu(display("retry.max_attempts must be at least 1"))]
    ZeroAttempts,
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics already initialized.
    #[snafu(display("Metrics already initialized"))]
    AlreadyInitialized,

    /// Metrics not initialized.
    #[snafu(display("Metrics not initialized"))]
    NotInitialized,
}

// ============ Forwarder Errors ============

/// Fatal errors that abort startup or the run loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ForwarderError {
    /// Configuration could not be loaded.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// The metrics address did not parse.
    #[snafu(display("Invalid metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics could not be initialized.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// The checkpoint store could not be built or created.
    #[snafu(display("Checkpoint store error: {source}"))]
    CheckpointSetup { source: CheckpointError },

    /// A source could not be built.
    #[snafu(display("Source setup error: {source}"))]
    SourceSetup { source: SourceError },

    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },
}
