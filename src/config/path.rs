//! Command line arguments.

use clap::Parser;
use std::path::PathBuf;

use crate::tracing::LogFormat;

/// Poll blob containers and forward NDJSON records to an ingestion API.
#[derive(Parser, Debug)]
#[command(name = "flurry", version, about)]
pub struct CliArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Validate the configuration, print the work items, and exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
