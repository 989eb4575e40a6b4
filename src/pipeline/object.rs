//! Per-object flow: checkpoint gate, stream, decode, batch, deliver, checkpoint.

use futures::StreamExt;
use snafu::prelude::*;
use std::time::Instant;
use tracing::{debug, warn};

use super::{ForwarderContext, WorkItem};
use crate::batch::{Batch, BoundedBatcher};
use crate::decode::{RecordStream, gunzip};
use crate::emit;
use crate::error::{DeliverSnafu, LookupSnafu, MarkProcessedSnafu, ObjectError, ReadSnafu};
use crate::metrics::events::{
    CheckpointWritten, ObjectDuration, ObjectSize, RecordsOversized, RecordsSkipped,
};
use crate::source::{ByteStream, ObjectDescriptor, ObjectSource};

/// Counts for one delivered object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub records: u64,
    pub batches: u64,
    pub skipped_lines: u64,
}

/// Terminal state of an object that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// This exact version was already delivered.
    Skipped,
    /// Every batch was delivered and the checkpoint written.
    Delivered(DeliveryStats),
}

/// Deliver one object unless its current version is already checkpointed.
///
/// The checkpoint is written only after every decoded record was accepted. A
/// failure at any stage leaves it untouched, so the whole object is retried
/// next cycle.
pub async fn process_object(
    context: &ForwarderContext,
    source: &dyn ObjectSource,
    item: &WorkItem,
    object: &ObjectDescriptor,
) -> Result<ObjectOutcome, ObjectError> {
    let processed = context
        .checkpoints
        .is_processed(&object.container, &object.name, &object.fingerprint)
        .await
        .context(LookupSnafu)?;
    if processed {
        debug!(container = %object.container, object = %object.name, "Already processed");
        return Ok(ObjectOutcome::Skipped);
    }

    debug!(
        container = %object.container,
        object = %object.name,
        size = object.size(),
        "Processing object"
    );
    emit!(ObjectSize {
        bytes: object.size(),
        container: item.container.clone(),
    });
    let started = Instant::now();

    let result = forward(context, source, item, object).await;

    emit!(ObjectDuration {
        duration: started.elapsed(),
        container: item.container.clone(),
    });
    result.map(ObjectOutcome::Delivered)
}

async fn forward(
    context: &ForwarderContext,
    source: &dyn ObjectSource,
    item: &WorkItem,
    object: &ObjectDescriptor,
) -> Result<DeliveryStats, ObjectError> {
    let mut chunks: ByteStream = source
        .open_stream(&object.container, &object.name)
        .await
        .context(ReadSnafu)?;
    if item.compression.is_gzip(&object.name) {
        chunks = gunzip(object.name.clone(), chunks);
    }

    let mut records = RecordStream::new(chunks);
    let mut stats = DeliveryStats::default();
    let delivered = deliver_records(context, item, object, &mut records, &mut stats).await;

    // Malformed lines seen before a failure still count.
    stats.skipped_lines = records.skipped();
    if stats.skipped_lines > 0 {
        warn!(
            container = %object.container,
            object = %object.name,
            skipped = stats.skipped_lines,
            "Skipped malformed lines"
        );
        emit!(RecordsSkipped {
            count: stats.skipped_lines,
            container: item.container.clone(),
        });
    }
    delivered?;

    context
        .checkpoints
        .mark_processed(
            &object.container,
            &object.name,
            &object.fingerprint,
            object.last_modified,
        )
        .await
        .context(MarkProcessedSnafu)?;
    emit!(CheckpointWritten {
        container: item.container.clone(),
    });

    Ok(stats)
}

async fn deliver_records(
    context: &ForwarderContext,
    item: &WorkItem,
    object: &ObjectDescriptor,
    records: &mut RecordStream<ByteStream>,
    stats: &mut DeliveryStats,
) -> Result<(), ObjectError> {
    let mut batcher = BoundedBatcher::new(
        context.delivery.customer_id(),
        &item.log_type,
        context.batching.max_bytes,
    )
    .with_max_entries(context.batching.max_entries);

    while let Some(record) = records.next().await {
        let record = record.context(ReadSnafu)?;
        match batcher.push(record) {
            Ok(Some(batch)) => deliver(context, item, &batch, stats).await?,
            Ok(None) => {}
            Err(source) => {
                warn!(
                    container = %object.container,
                    object = %object.name,
                    size = source.size,
                    max = source.max,
                    "Record larger than the batch budget"
                );
                emit!(RecordsOversized {
                    count: 1,
                    container: item.container.clone(),
                });
                return Err(ObjectError::Oversized { source });
            }
        }
    }
    if let Some(batch) = batcher.finish() {
        deliver(context, item, &batch, stats).await?;
    }
    Ok(())
}

async fn deliver(
    context: &ForwarderContext,
    item: &WorkItem,
    batch: &Batch,
    stats: &mut DeliveryStats,
) -> Result<(), ObjectError> {
    context
        .delivery
        .deliver(&item.log_type, batch)
        .await
        .context(DeliverSnafu)?;
    stats.records += batch.len() as u64;
    stats.batches += 1;
    Ok(())
}
