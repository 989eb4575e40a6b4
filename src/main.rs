//! flurry: poll blob containers and forward NDJSON records to an ingestion API.

use clap::Parser;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flurry::checkpoint::open_checkpoint_store;
use flurry::config::{CliArgs, Config};
use flurry::delivery::DeliveryClient;
use flurry::emit;
use flurry::error::{
    AddressParseSnafu, CheckpointSetupSnafu, ConfigSnafu, ForwarderError, HttpClientSnafu,
    MetricsSnafu, SourceSetupSnafu,
};
use flurry::metrics::events::ForwarderUp;
use flurry::signal::spawn_shutdown_handler;
use flurry::source::SourceRegistry;
use flurry::tracing::init_tracing;
use flurry::{BatchSettings, Forwarder, ForwarderContext, WorkItem, run_forwarder};

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), ForwarderError> {
    let args = CliArgs::parse();
    init_tracing(args.log_format);

    info!(config = %args.config.display(), "flurry starting");
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    let items = WorkItem::from_config(&config);

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!(env = ?config.env, endpoint = %config.ingestion.endpoint, "Ingestion");
        info!(url = %config.checkpoint.url, table = %config.checkpoint.table, "Checkpoint");
        for item in &items {
            info!(
                tenant = %item.tenant,
                storage_account = %item.account,
                container = %item.container,
                prefixes = ?item.prefixes,
                log_type = %item.log_type,
                "Work item"
            );
        }
        info!("Configuration is valid");
        return Ok(());
    }

    let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
    flurry::metrics::init_global(addr).context(MetricsSnafu)?;
    info!(
        "Metrics endpoint listening on http://{}/metrics",
        config.metrics.address
    );

    let checkpoints = open_checkpoint_store(&config.checkpoint).context(CheckpointSetupSnafu)?;
    checkpoints
        .ensure_table()
        .await
        .context(CheckpointSetupSnafu)?;

    let sources = SourceRegistry::from_config(&config)
        .await
        .context(SourceSetupSnafu)?;
    let delivery = DeliveryClient::from_config(&config.ingestion).context(HttpClientSnafu)?;

    let context = Arc::new(ForwarderContext::new(
        sources,
        checkpoints,
        Arc::new(delivery),
        BatchSettings::from(&config.forwarder),
    ));

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());

    let mut forwarder = Forwarder::new(context, items, config.forwarder.concurrency, shutdown);

    info!(
        env = ?config.env,
        containers = config.container_count(),
        poll_interval_secs = config.forwarder.poll_interval_secs,
        concurrency = config.forwarder.concurrency,
        "Forwarder running"
    );
    emit!(ForwarderUp { up: true });

    run_forwarder(
        &mut forwarder,
        Duration::from_secs(config.forwarder.poll_interval_secs),
        config.forwarder.poll_jitter_secs,
    )
    .await;

    emit!(ForwarderUp { up: false });
    info!("flurry stopped");
    Ok(())
}
