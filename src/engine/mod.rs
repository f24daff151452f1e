//! Collaborator interfaces consumed by the scheduler.
//!
//! The scheduler never touches model internals. It talks to three capabilities:
//! - [`Engine`]: decodes batches and manages per-sequence cache state
//! - [`TextCodec`]: turns prompts into tokens and generated tokens back into text
//! - [`TokenSampler`]: picks the next token from one position's logits
//!
//! Production implementations live in the submodules; tests substitute
//! scripted fakes.

pub mod candle;
pub mod loader;
pub mod sampler;
pub mod stream;
pub mod tokenizer;

use std::time::Duration;

use crate::core::batch::BatchView;
use crate::error::Result;

pub use self::candle::CandleEngine;
pub use loader::{resolve_model, ModelFiles};
pub use sampler::Sampler;
pub use stream::OutputStream;
pub use tokenizer::HfTokenizer;

/// Token ID type.
pub type TokenId = u32;

/// Engine handle for one logically independent decoded stream.
pub type SeqId = u32;

/// Sequence id reserved for the shared system prefix.
pub const SYSTEM_SEQ_ID: SeqId = 0;

/// Outcome of a single decode call.
///
/// Engines report failures as status codes rather than errors: a positive
/// code means the cache had no room for the chunk and a smaller chunk may
/// still fit, a negative code is unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The chunk was decoded; logits for flagged entries are available.
    Ok,
    /// Transient resource pressure (no free cache slot for the chunk).
    Exhausted(i32),
    /// Unrecoverable failure.
    Fatal(i32),
}

impl DecodeStatus {
    /// Classify a raw status code: `0` ok, `> 0` exhausted, `< 0` fatal.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            c if c > 0 => Self::Exhausted(c),
            c => Self::Fatal(c),
        }
    }

    /// The raw status code.
    pub fn code(&self) -> i32 {
        match *self {
            Self::Ok => 0,
            Self::Exhausted(c) | Self::Fatal(c) => c,
        }
    }

    /// Whether the chunk was decoded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Range of positions within a sequence's cache.
///
/// `None` bounds are open, so [`CacheRange::ALL`] addresses the entire sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl CacheRange {
    /// The entire sequence.
    pub const ALL: Self = Self {
        start: None,
        end: None,
    };

    /// Positions `start..end`.
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Positions from `start` to the end of the sequence.
    pub fn from(start: usize) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// Whether this range covers every position of a sequence of length `len`.
    pub fn covers(&self, len: usize) -> bool {
        self.start.unwrap_or(0) == 0 && self.end.map_or(true, |end| end >= len)
    }
}

/// Snapshot of the engine's cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUsage {
    /// Cells currently holding cached positions.
    pub used_cells: usize,
    /// Total cells (context size).
    pub n_ctx: usize,
    /// Cached length per live sequence, ordered by sequence id.
    pub sequences: Vec<(SeqId, usize)>,
}

/// Cumulative engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnginePerf {
    /// Number of decode calls that succeeded.
    pub n_decode_calls: usize,
    /// Number of batch entries evaluated.
    pub n_eval_tokens: usize,
    /// Wall time spent inside successful decode calls.
    pub eval_time: Duration,
}

impl EnginePerf {
    /// Evaluated tokens per second.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.eval_time.as_secs_f64();
        if secs > 0.0 {
            self.n_eval_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Autoregressive decoding engine with a cache indexed by sequence id.
pub trait Engine {
    /// Decode one chunk of a batch.
    fn decode(&mut self, batch: BatchView<'_>) -> DecodeStatus;

    /// Logits for entry `index` of the most recently decoded chunk.
    ///
    /// Only entries flagged to emit logits have them.
    fn logits(&self, index: usize) -> Option<&[f32]>;

    /// Make `dst` share the cached state of `src` over `range`.
    fn cache_copy(&mut self, src: SeqId, dst: SeqId, range: CacheRange);

    /// Drop cached state of `seq` over `range`.
    ///
    /// Returns `false` if the backend cannot remove a partial range.
    fn cache_remove(&mut self, seq: SeqId, range: CacheRange) -> bool;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Context size in cache cells.
    fn n_ctx(&self) -> usize;

    /// Current cache occupancy.
    fn cache_usage(&self) -> CacheUsage;

    /// Cumulative performance counters.
    fn perf(&self) -> EnginePerf {
        EnginePerf::default()
    }
}

/// Tokenizer / detokenizer.
pub trait TextCodec {
    /// Convert text into token IDs, optionally adding special tokens (BOS).
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>>;

    /// Text of a whole token sequence, special tokens skipped.
    ///
    /// Use [`OutputStream`] to turn a growing sequence into per-token text.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String>;
}

/// Per-client sampling state.
pub trait TokenSampler {
    /// Select the next token from one position's logits.
    fn sample(&mut self, logits: &[f32]) -> Result<TokenId>;

    /// Record that `token` was appended to the client's output.
    fn accept(&mut self, token: TokenId);

    /// Forget all per-client state so the sampler can serve a new client.
    fn reset(&mut self);
}
