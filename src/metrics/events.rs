//! Internal events for forwarder metrics emission.
//!
//! Each event struct represents a measurable occurrence in the forwarding
//! pipeline and implements [`InternalEvent`], which records the matching
//! Prometheus metric. Object-level metrics carry `container` and
//! `storage_account` labels; delivery metrics carry `log_type`.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted once per listed object.
pub struct ObjectsDiscovered {
    pub count: u64,
    pub container: String,
    pub storage_account: String,
}

impl InternalEvent for ObjectsDiscovered {
    fn emit(self) {
        trace!(count = self.count, container = %self.container, "Objects discovered");
        counter!(
            "flurry_objects_found_total",
            "container" => self.container,
            "storage_account" => self.storage_account
        )
        .increment(self.count);
    }
}

/// Outcome of one object within a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Every batch was delivered and the checkpoint was written.
    Delivered,
    /// A matching checkpoint already existed.
    Skipped,
    /// The object failed; it will be retried next cycle.
    Failed,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Delivered => "delivered",
            ObjectStatus::Skipped => "skipped",
            ObjectStatus::Failed => "failed",
        }
    }
}

/// Event emitted when an object reaches a terminal state.
pub struct ObjectProcessed {
    pub status: ObjectStatus,
    pub container: String,
    pub storage_account: String,
}

impl InternalEvent for ObjectProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), container = %self.container, "Object processed");
        counter!(
            "flurry_objects_processed_total",
            "status" => self.status.as_str(),
            "container" => self.container,
            "storage_account" => self.storage_account
        )
        .increment(1);
    }
}

/// Stage at which an object failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Lookup,
    Read,
    Deliver,
    Oversized,
    Checkpoint,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Lookup => "lookup",
            FailureStage::Read => "read",
            FailureStage::Deliver => "deliver",
            FailureStage::Oversized => "oversized",
            FailureStage::Checkpoint => "checkpoint",
        }
    }
}

/// Event emitted when an object fails.
pub struct ObjectFailed {
    pub stage: FailureStage,
    pub container: String,
    pub storage_account: String,
}

impl InternalEvent for ObjectFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), container = %self.container, "Object failed");
        counter!(
            "flurry_objects_failed_total",
            "stage" => self.stage.as_str(),
            "container" => self.container,
            "storage_account" => self.storage_account
        )
        .increment(1);
    }
}

/// Event emitted when a container listing fails.
pub struct ListingFailed {
    pub container: String,
    pub storage_account: String,
}

impl InternalEvent for ListingFailed {
    fn emit(self) {
        trace!(container = %self.container, "Listing failed");
        counter!(
            "flurry_listing_failures_total",
            "container" => self.container,
            "storage_account" => self.storage_account
        )
        .increment(1);
    }
}

/// Size of an object selected for processing.
pub struct ObjectSize {
    pub bytes: u64,
    pub container: String,
}

impl InternalEvent for ObjectSize {
    fn emit(self) {
        histogram!("flurry_object_size_bytes", "container" => self.container)
            .record(self.bytes as f64);
    }
}

/// Wall time spent on one object, from open to checkpoint.
pub struct ObjectDuration {
    pub duration: Duration,
    pub container: String,
}

impl InternalEvent for ObjectDuration {
    fn emit(self) {
        histogram!("flurry_processing_time_seconds", "container" => self.container)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when records are accepted by the ingestion endpoint.
pub struct RecordsDelivered {
    pub count: u64,
    pub log_type: String,
}

impl InternalEvent for RecordsDelivered {
    fn emit(self) {
        trace!(count = self.count, log_type = %self.log_type, "Records delivered");
        counter!("flurry_log_entries_processed_total", "log_type" => self.log_type)
            .increment(self.count);
    }
}

/// Event emitted when malformed lines are discarded by the decoder.
pub struct RecordsSkipped {
    pub count: u64,
    pub container: String,
}

impl InternalEvent for RecordsSkipped {
    fn emit(self) {
        trace!(count = self.count, container = %self.container, "Malformed records skipped");
        counter!("flurry_log_entries_skipped_total", "container" => self.container)
            .increment(self.count);
    }
}

/// Event emitted when a record is too large for any batch.
pub struct RecordsOversized {
    pub count: u64,
    pub container: String,
}

impl InternalEvent for RecordsOversized {
    fn emit(self) {
        trace!(count = self.count, container = %self.container, "Oversized records rejected");
        counter!("flurry_log_entries_oversized_total", "container" => self.container)
            .increment(self.count);
    }
}

/// Event emitted when a batch is accepted.
pub struct BatchSent {
    pub bytes: usize,
    pub log_type: String,
}

impl InternalEvent for BatchSent {
    fn emit(self) {
        trace!(bytes = self.bytes, log_type = %self.log_type, "Batch sent");
        counter!("flurry_batches_sent_total", "log_type" => self.log_type.clone()).increment(1);
        histogram!("flurry_batch_size_bytes", "log_type" => self.log_type)
            .record(self.bytes as f64);
    }
}

/// Event emitted when a batch fails after retries.
pub struct BatchFailed {
    pub kind: &'static str,
    pub log_type: String,
}

impl InternalEvent for BatchFailed {
    fn emit(self) {
        trace!(kind = self.kind, log_type = %self.log_type, "Batch failed");
        counter!(
            "flurry_batches_failed_total",
            "kind" => self.kind,
            "log_type" => self.log_type
        )
        .increment(1);
    }
}

/// Event emitted before a delivery attempt is retried.
pub struct DeliveryRetried {
    pub kind: &'static str,
    pub log_type: String,
}

impl InternalEvent for DeliveryRetried {
    fn emit(self) {
        trace!(kind = self.kind, log_type = %self.log_type, "Delivery retried");
        counter!(
            "flurry_delivery_retries_total",
            "kind" => self.kind,
            "log_type" => self.log_type
        )
        .increment(1);
    }
}

/// Event emitted when a bearer token is fetched.
pub struct TokenRefreshed;

impl InternalEvent for TokenRefreshed {
    fn emit(self) {
        trace!("Token refreshed");
        counter!("flurry_token_refreshes_total").increment(1);
    }
}

/// Event emitted when a checkpoint record is written.
pub struct CheckpointWritten {
    pub container: String,
}

impl InternalEvent for CheckpointWritten {
    fn emit(self) {
        trace!(container = %self.container, "Checkpoint written");
        counter!("flurry_checkpoints_written_total", "container" => self.container).increment(1);
    }
}

/// Event emitted after every poll cycle.
pub struct CycleCompleted {
    pub duration: Duration,
}

impl InternalEvent for CycleCompleted {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis() as u64, "Cycle completed");
        counter!("flurry_cycles_total").increment(1);
        histogram!("flurry_cycle_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Number of container units currently running.
pub struct ActiveUnits {
    pub count: usize,
}

impl InternalEvent for ActiveUnits {
    fn emit(self) {
        gauge!("flurry_active_units").set(self.count as f64);
    }
}

/// Liveness gauge, set to 1 while the run loop is alive.
pub struct ForwarderUp {
    pub up: bool,
}

impl InternalEvent for ForwarderUp {
    fn emit(self) {
        gauge!("flurry_up").set(if self.up { 1.0 } else { 0.0 });
    }
}
