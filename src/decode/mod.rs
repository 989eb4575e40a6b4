//! Streaming NDJSON decoding.
//!
//! Chunks arrive with arbitrary boundaries, so splitting happens on raw bytes
//! and text decoding happens per complete line. A multibyte character cut in
//! half by a chunk boundary is therefore reassembled before it is decoded.
//! Invalid UTF-8 is replaced rather than rejected; lines that are not valid
//! JSON are counted and dropped.

pub mod compression;

pub use compression::gunzip;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::debug;

use crate::error::SourceError;

/// Incremental line splitter and parser.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    decoded: u64,
    skipped: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records parsed so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Non-blank lines that failed to parse.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Append a chunk and emit every record completed by it.
    pub fn feed(&mut self, chunk: &[u8], out: &mut impl Extend<Value>) {
        // The carried-over remainder holds no newline, so only the new bytes
        // need scanning.
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut line_start = 0;
        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let line_end = search_from + offset;
            if let Some(record) = self.parse_line(line_start, line_end) {
                out.extend(Some(record));
            }
            line_start = line_end + 1;
            search_from = line_start;
        }

        self.buffer.drain(..line_start);
    }

    /// Parse whatever is left after the last newline.
    pub fn finish(&mut self) -> Option<Value> {
        let end = self.buffer.len();
        let record = self.parse_line(0, end);
        self.buffer.clear();
        record
    }

    fn parse_line(&mut self, start: usize, end: usize) -> Option<Value> {
        let mut line = &self.buffer[start..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        let text = String::from_utf8_lossy(line);
        if text.trim().is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(record) => {
                self.decoded += 1;
                Some(record)
            }
            Err(e) => {
                self.skipped += 1;
                debug!(error = %e, line_len = line.len(), "Skipping malformed line");
                None
            }
        }
    }
}

/// A lazy, single-pass stream of records decoded from a byte stream.
///
/// At most the records completed by one chunk are held at a time. A source
/// error is yielded once and ends the stream.
pub struct RecordStream<S> {
    chunks: Option<S>,
    decoder: LineDecoder,
    ready: VecDeque<Value>,
}

impl<S> RecordStream<S>
where
    S: Stream<Item = Result<Bytes, SourceError>> + Unpin,
{
    pub fn new(chunks: S) -> Self {
        Self {
            chunks: Some(chunks),
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// Malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.decoder.skipped()
    }

    /// Records decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoder.decoded()
    }
}

impl<S> Stream for RecordStream<S>
where
    S: Stream<Item = Result<Bytes, SourceError>> + Unpin,
{
    type Item = Result<Value, SourceError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(record) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(record)));
            }

            let Some(chunks) = this.chunks.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(chunks.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => this.decoder.feed(&chunk, &mut this.ready),
                Some(Err(e)) => {
                    this.chunks = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.chunks = None;
                    if let Some(record) = this.decoder.finish() {
                        return Poll::Ready(Some(Ok(record)));
                    }
                }
            }
        }
    }
}
