//! Adaptive decode driver.
//!
//! Submits a batch to the engine in chunks of at most `n_batch` entries. When
//! the engine reports cache exhaustion, the chunk size is halved and the same
//! range is retried: a fragmented cache may still fit a smaller contiguous
//! allocation. Exhaustion at chunk size 1, or any fatal status, aborts.
//!
//! ```text
//!  batch:  [0 ........................................ 19]
//!  n=8     [0 ....... 7]  ok
//!  n=8                   [8 ...... 15]  exhausted -> n=4, miss+1
//!  n=4                   [8 .. 11]  ok
//!  n=4                             [12 .. 15]  ok
//!  n=4                                        [16 .. 19]  ok
//! ```
//!
//! The reduced size holds for the rest of the tick; every tick starts again
//! from the configured size.

use std::ops::Range;

use tracing::{debug, error, warn};

use crate::core::batch::Batch;
use crate::engine::{DecodeStatus, Engine};
use crate::error::{Error, Result};

/// Something that happened while decoding a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// The chunk covering `range` was decoded; its logits are readable until the next decode.
    Chunk(Range<usize>),
    /// The engine ran out of cache space; the chunk is retried at `n_batch`.
    Retry { n_batch: usize },
}

/// Outcome of decoding a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeReport {
    /// Successful decode calls.
    pub n_chunks: usize,
    /// Retries caused by exhaustion.
    pub n_cache_miss: usize,
    /// Chunk size in effect at the end of the batch.
    pub final_n_batch: usize,
}

/// Chunked decode with halving retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveDecoder {
    n_batch: usize,
}

impl AdaptiveDecoder {
    /// Create a driver with the configured chunk size (at least 1).
    pub fn new(n_batch: usize) -> Self {
        Self {
            n_batch: n_batch.max(1),
        }
    }

    /// Configured chunk size.
    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    /// Decode `batch`, calling `on_event` after every successful chunk and before every retry.
    ///
    /// Chunk events arrive in batch order, so slots are served strictly by batch position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on a fatal status or on exhaustion at chunk size 1,
    /// and propagates any error from `on_event`.
    pub fn decode<E, F>(&self, engine: &mut E, batch: &Batch, mut on_event: F) -> Result<DecodeReport>
    where
        E: Engine + ?Sized,
        F: FnMut(&mut E, DecodeEvent) -> Result<()>,
    {
        let mut n_batch = self.n_batch;
        let mut report = DecodeReport {
            n_chunks: 0,
            n_cache_miss: 0,
            final_n_batch: n_batch,
        };

        let mut i = 0;
        while i < batch.len() {
            let n_tokens = n_batch.min(batch.len() - i);
            let range = i..i + n_tokens;

            match engine.decode(batch.view(range.clone())) {
                DecodeStatus::Ok => {
                    debug!(n_tokens, "decoded batch chunk");
                    report.n_chunks += 1;
                    on_event(engine, DecodeEvent::Chunk(range))?;
                    i += n_tokens;
                }
                DecodeStatus::Exhausted(code) if n_batch > 1 => {
                    n_batch /= 2;
                    warn!(code, n_batch, "failed to decode the batch, retrying with smaller chunk");
                    report.n_cache_miss += 1;
                    on_event(engine, DecodeEvent::Retry { n_batch })?;
                }
                status => {
                    let code = status.code();
                    // KV cache is full or the backend failed: try increasing the context size
                    error!(n_batch, code, "failed to decode the batch");
                    return Err(Error::Decode { n_batch, code });
                }
            }
        }

        report.final_n_batch = n_batch;
        Ok(report)
    }
}
