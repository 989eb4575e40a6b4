//! flurry: forward NDJSON logs from blob containers to an ingestion API.
//!
//! Each poll cycle lists the configured containers, streams every object
//! whose current version has no checkpoint, decodes it line by line, packs
//! the records into size-bounded batches and delivers them over HTTP. An
//! object is checkpointed only after all of its batches were accepted.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, Forwarder, ForwarderContext, WorkItem};
//!
//! let config = Config::from_file("config.yaml".as_ref())?;
//! let items = WorkItem::from_config(&config);
//! let forwarder = Forwarder::new(context, items, config.forwarder.concurrency, shutdown);
//! let report = forwarder.run_cycle().await;
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod delivery;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod signal;
pub mod source;
pub mod tracing;

pub use config::Config;
pub use pipeline::{BatchSettings, CycleReport, Forwarder, ForwarderContext, WorkItem};
pub use polling::{run_forwarder, run_polling_loop};
