//! One container unit: list each prefix and process its objects in order.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::object::{ObjectOutcome, process_object};
use super::{ForwarderContext, WorkItem};
use crate::emit;
use crate::error::SourceError;
use crate::metrics::events::{
    ListingFailed, ObjectFailed, ObjectProcessed, ObjectStatus, ObjectsDiscovered,
};

/// What one container unit did in a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerReport {
    pub discovered: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub listing_failures: usize,
    pub records: u64,
    pub batches: u64,
    /// The unit stopped early because shutdown was requested.
    pub interrupted: bool,
}

/// Process every prefix of one container.
///
/// Listing failures end the current prefix only. Object failures are logged
/// and counted; the checkpoint is left untouched so the object is retried
/// next cycle. Only an unknown storage account fails the unit.
pub async fn process_container(
    context: &ForwarderContext,
    item: &WorkItem,
    shutdown: &CancellationToken,
) -> Result<ContainerReport, SourceError> {
    let source = context.sources.get(&item.account)?;
    let mut report = ContainerReport::default();

    debug!(
        storage_account = %item.account,
        container = %item.container,
        prefixes = item.prefixes.len(),
        "Checking container"
    );

    'prefixes: for prefix in item.listing_prefixes() {
        if shutdown.is_cancelled() {
            report.interrupted = true;
            break;
        }

        let mut listing = match source.list(&item.container, prefix).await {
            Ok(listing) => listing,
            Err(e) => {
                listing_failed(item, &mut report, &e);
                continue;
            }
        };

        while let Some(listed) = listing.next().await {
            let object = match listed {
                Ok(object) => object,
                Err(e) => {
                    listing_failed(item, &mut report, &e);
                    continue 'prefixes;
                }
            };

            if shutdown.is_cancelled() {
                report.interrupted = true;
                break 'prefixes;
            }

            report.discovered += 1;
            emit!(ObjectsDiscovered {
                count: 1,
                container: item.container.clone(),
                storage_account: item.account.clone(),
            });

            match process_object(context, source.as_ref(), item, &object).await {
                Ok(ObjectOutcome::Skipped) => {
                    report.skipped += 1;
                    emit!(ObjectProcessed {
                        status: ObjectStatus::Skipped,
                        container: item.container.clone(),
                        storage_account: item.account.clone(),
                    });
                }
                Ok(ObjectOutcome::Delivered(stats)) => {
                    report.delivered += 1;
                    report.records += stats.records;
                    report.batches += stats.batches;
                    info!(
                        storage_account = %item.account,
                        container = %item.container,
                        object = %object.name,
                        records = stats.records,
                        batches = stats.batches,
                        skipped_lines = stats.skipped_lines,
                        "Object delivered"
                    );
                    emit!(ObjectProcessed {
                        status: ObjectStatus::Delivered,
                        container: item.container.clone(),
                        storage_account: item.account.clone(),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    let stage = e.stage();
                    warn!(
                        storage_account = %item.account,
                        container = %item.container,
                        object = %object.name,
                        stage = stage.as_str(),
                        error = %e,
                        "Object failed, will retry next cycle"
                    );
                    emit!(ObjectFailed {
                        stage,
                        container: item.container.clone(),
                        storage_account: item.account.clone(),
                    });
                    emit!(ObjectProcessed {
                        status: ObjectStatus::Failed,
                        container: item.container.clone(),
                        storage_account: item.account.clone(),
                    });
                }
            }
        }
    }

    if report.interrupted {
        info!(
            storage_account = %item.account,
            container = %item.container,
            "Shutdown requested, stopping container"
        );
    }

    Ok(report)
}

fn listing_failed(item: &WorkItem, report: &mut ContainerReport, error: &SourceError) {
    report.listing_failures += 1;
    warn!(
        storage_account = %item.account,
        container = %item.container,
        error = %error,
        "Listing failed"
    );
    emit!(ListingFailed {
        container: item.container.clone(),
        storage_account: item.account.clone(),
    });
}
