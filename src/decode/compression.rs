//! Streaming gzip decompression.
//!
//! Compressed chunks are pushed through a write-side decoder so output is
//! produced chunk by chunk and the whole object is never buffered.

use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use snafu::ResultExt;
use std::io::Write;

use crate::error::{DecompressSnafu, SourceError};

type Chunks = BoxStream<'static, Result<Bytes, SourceError>>;

/// Decompress a gzip byte stream.
///
/// `name` is only used in error messages.
pub fn gunzip<S>(name: impl Into<String>, input: S) -> Chunks
where
    S: Stream<Item = Result<Bytes, SourceError>> + Send + 'static,
{
    let name = name.into();
    let state = Some((input.boxed(), GzDecoder::new(Vec::new())));

    stream::unfold(state, move |state| {
        let name = name.clone();
        async move {
            let (mut input, mut decoder) = state?;
            loop {
                match input.next().await {
                    Some(Ok(chunk)) => {
                        let written = decoder
                            .write_all(&chunk)
                            .context(DecompressSnafu { name: &name });
                        if let Err(e) = written {
                            return Some((Err(e), None));
                        }
                        let out = std::mem::take(decoder.get_mut());
                        if !out.is_empty() {
                            return Some((Ok(Bytes::from(out)), Some((input, decoder))));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => {
                        let finished = decoder.try_finish().context(DecompressSnafu { name: &name });
                        if let Err(e) = finished {
                            return Some((Err(e), None));
                        }
                        let out = std::mem::take(decoder.get_mut());
                        return (!out.is_empty()).then(|| (Ok(Bytes::from(out)), None));
                    }
                }
            }
        }
    })
    .boxed()
}
