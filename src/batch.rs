//! Byte-budget batching of decoded records.
//!
//! Every batch is sized exactly as it will appear on the wire:
//!
//! ```text
//! {"customer_id":"..","log_type":"..","entries":[r1,r2,...]}
//! ```
//!
//! The empty envelope is serialized once to get the fixed overhead; each
//! record then adds its own serialized length plus one byte for the comma
//! that separates it from the previous entry.

use serde::Serialize;
use serde_json::Value;
use snafu::ensure;

use crate::error::{OversizedRecord, OversizedRecordSnafu};

/// Wire envelope for one delivery request.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub customer_id: &'a str,
    pub log_type: &'a str,
    pub entries: &'a [Value],
}

impl Envelope<'_> {
    /// Serialize to the exact request body.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Serialized size of an envelope with no entries.
pub fn envelope_overhead(customer_id: &str, log_type: &str) -> usize {
    let empty = Envelope {
        customer_id,
        log_type,
        entries: &[],
    };
    serialized_len(&empty)
}

/// Serialized length of `value` without materializing it.
fn serialized_len<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, value).expect("string-keyed JSON always serializes");
    counter.0
}

struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An ordered group of records ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    entries: Vec<Value>,
    size: usize,
}

impl Batch {
    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Value> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact serialized size of the envelope carrying this batch.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Groups records into batches that never exceed `max_bytes` on the wire.
///
/// Feed records with [`push`](Self::push); each call returns the previous
/// batch when the new record would not fit. Call [`finish`](Self::finish) once
/// the input is exhausted.
#[derive(Debug)]
pub struct BoundedBatcher {
    max_bytes: usize,
    max_entries: Option<usize>,
    base_overhead: usize,
    entries: Vec<Value>,
    current_size: usize,
}

impl BoundedBatcher {
    pub fn new(customer_id: &str, log_type: &str, max_bytes: usize) -> Self {
        let base_overhead = envelope_overhead(customer_id, log_type);
        Self {
            max_bytes,
            max_entries: None,
            base_overhead,
            entries: Vec::new(),
            current_size: base_overhead,
        }
    }

    /// Also flush once a batch holds `max_entries` records.
    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries.filter(|n| *n > 0);
        self
    }

    pub fn base_overhead(&self) -> usize {
        self.base_overhead
    }

    /// Size the open batch would have if flushed now.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Add a record, returning the batch it displaced if any.
    ///
    /// A record that cannot fit even into an empty envelope is rejected and
    /// the open batch is left untouched.
    pub fn push(&mut self, record: Value) -> Result<Option<Batch>, OversizedRecord> {
        let record_size = serialized_len(&record);
        ensure!(
            self.base_overhead + record_size <= self.max_bytes,
            OversizedRecordSnafu {
                size: record_size,
                max: self.max_bytes,
            }
        );

        let separator = usize::from(!self.entries.is_empty());
        let over_budget = self.current_size + separator + record_size > self.max_bytes;
        let over_count = self
            .max_entries
            .is_some_and(|max| self.entries.len() >= max);

        let flushed = if !self.entries.is_empty() && (over_budget || over_count) {
            self.take()
        } else {
            None
        };

        if !self.entries.is_empty() {
            self.current_size += 1;
        }
        self.current_size += record_size;
        self.entries.push(record);

        Ok(flushed)
    }

    /// Flush the open batch, if it holds anything.
    pub fn finish(&mut self) -> Option<Batch> {
        self.take()
    }

    fn take(&mut self) -> Option<Batch> {
        if self.entries.is_empty() {
            return None;
        }
        let batch = Batch {
            entries: std::mem::take(&mut self.entries),
            size: self.current_size,
        };
        self.current_size = self.base_overhead;
        Some(batch)
    }
}
