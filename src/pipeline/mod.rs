//! Poll-cycle orchestration.
//!
//! Every configured container becomes a [`WorkItem`]. A cycle runs one unit
//! per work item on a [`JoinSet`], gated by a semaphore of `concurrency`
//! permits, and waits for every unit before returning. Units never fail the
//! cycle: failures are logged, counted and retried next cycle.
//!
//! Cancellation is cooperative. Units that have not yet acquired a permit are
//! abandoned; running units stop at the next prefix or object boundary, so an
//! in-flight delivery always completes.

mod container;
mod object;

pub use container::{ContainerReport, process_container};
pub use object::{DeliveryStats, ObjectOutcome, process_object};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStoreRef;
use crate::config::{CompressionFormat, Config, ForwarderConfig};
use crate::delivery::DeliveryClientRef;
use crate::emit;
use crate::metrics::events::ActiveUnits;
use crate::source::SourceRegistry;

/// One container to poll, flattened from the tenant/account tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub tenant: String,
    pub account: String,
    pub container: String,
    pub prefixes: Vec<String>,
    pub log_type: String,
    pub compression: CompressionFormat,
}

impl WorkItem {
    /// Enumerate work items in configuration order.
    pub fn from_config(config: &Config) -> Vec<WorkItem> {
        config
            .containers()
            .map(|(tenant, account, container)| WorkItem {
                tenant: tenant.name.clone(),
                account: account.name.clone(),
                container: container.name.clone(),
                prefixes: container.prefixes.clone(),
                log_type: container.log_type.clone(),
                compression: container.compression,
            })
            .collect()
    }

    /// Prefixes to list, in order. No prefixes means one unscoped listing.
    pub fn listing_prefixes(&self) -> Vec<Option<&str>> {
        if self.prefixes.is_empty() {
            vec![None]
        } else {
            self.prefixes.iter().map(|p| Some(p.as_str())).collect()
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account, self.container)
    }
}

/// Batch sizing applied to every object.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub max_bytes: usize,
    pub max_entries: Option<usize>,
}

impl From<&ForwarderConfig> for BatchSettings {
    fn from(config: &ForwarderConfig) -> Self {
        Self {
            max_bytes: config.effective_max_bytes(),
            max_entries: config.max_entries_per_batch,
        }
    }
}

/// Shared handles used by every unit.
pub struct ForwarderContext {
    pub sources: SourceRegistry,
    pub checkpoints: CheckpointStoreRef,
    pub delivery: DeliveryClientRef,
    pub batching: BatchSettings,
    active_units: AtomicUsize,
}

impl ForwarderContext {
    pub fn new(
        sources: SourceRegistry,
        checkpoints: CheckpointStoreRef,
        delivery: DeliveryClientRef,
        batching: BatchSettings,
    ) -> Self {
        Self {
            sources,
            checkpoints,
            delivery,
            batching,
            active_units: AtomicUsize::new(0),
        }
    }

    fn unit_started(&self) {
        let count = self.active_units.fetch_add(1, Ordering::Relaxed) + 1;
        emit!(ActiveUnits { count });
    }

    fn unit_finished(&self) {
        let count = self.active_units.fetch_sub(1, Ordering::Relaxed) - 1;
        emit!(ActiveUnits { count });
    }
}

/// Totals for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub units: usize,
    pub abandoned: usize,
    pub unit_errors: usize,
    pub discovered: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub listing_failures: usize,
    pub records: u64,
    pub batches: u64,
}

impl CycleReport {
    fn absorb(&mut self, report: &ContainerReport) {
        self.units += 1;
        self.discovered += report.discovered;
        self.delivered += report.delivered;
        self.skipped += report.skipped;
        self.failed += report.failed;
        self.listing_failures += report.listing_failures;
        self.records += report.records;
        self.batches += report.batches;
    }

    /// Whether any object was delivered this cycle.
    pub fn did_work(&self) -> bool {
        self.delivered > 0
    }
}

enum UnitResult {
    Finished(ContainerReport),
    Abandoned,
    Failed(crate::error::SourceError),
}

/// Runs poll cycles over a fixed set of work items.
pub struct Forwarder {
    context: Arc<ForwarderContext>,
    items: Vec<WorkItem>,
    concurrency: usize,
    shutdown: CancellationToken,
}

impl Forwarder {
    pub fn new(
        context: Arc<ForwarderContext>,
        items: Vec<WorkItem>,
        concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            context,
            items,
            concurrency: concurrency.max(1),
            shutdown,
        }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run every unit once and wait for all of them.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut units: JoinSet<(WorkItem, UnitResult)> = JoinSet::new();

        for item in self.items.iter().cloned() {
            let context = self.context.clone();
            let permits = permits.clone();
            let shutdown = self.shutdown.clone();

            units.spawn(async move {
                let Some(Ok(_permit)) = shutdown
                    .run_until_cancelled(permits.acquire_owned())
                    .await
                else {
                    return (item, UnitResult::Abandoned);
                };

                context.unit_started();
                let result = process_container(&context, &item, &shutdown).await;
                context.unit_finished();

                let result = match result {
                    Ok(report) => UnitResult::Finished(report),
                    Err(e) => UnitResult::Failed(e),
                };
                (item, result)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((_, UnitResult::Finished(unit))) => report.absorb(&unit),
                Ok((_, UnitResult::Abandoned)) => report.abandoned += 1,
                Ok((item, UnitResult::Failed(e))) => {
                    report.unit_errors += 1;
                    error!(
                        tenant = %item.tenant,
                        storage_account = %item.account,
                        container = %item.container,
                        error = %e,
                        "Container unit failed"
                    );
                }
                Err(e) => {
                    report.unit_errors += 1;
                    error!(error = %e, "Container unit panicked");
                }
            }
        }

        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Shutdown abandoned pending units");
        }
        info!(
            units = report.units,
            discovered = report.discovered,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            records = report.records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Poll cycle complete"
        );

        report
    }
}
