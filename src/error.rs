//! Error types for nano-parallel.
//!
//! Decode outcomes are not errors: the engine reports them as status codes
//! (see [`crate::engine::DecodeStatus`]) and the decode driver only turns a
//! status into [`Error::Decode`] once it has given up retrying.

use thiserror::Error;

/// Result type alias for nano-parallel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-parallel.
#[derive(Error, Debug)]
pub enum Error {
    /// Decode failed and could not be recovered by shrinking the chunk.
    #[error("failed to decode the batch, n_batch = {n_batch}, ret = {code}")]
    Decode { n_batch: usize, code: i32 },

    /// The batch has no room for another entry.
    #[error("batch is full ({capacity} entries)")]
    BatchFull { capacity: usize },

    /// Invalid client slot state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The engine refused to drop a sequence's cached state.
    #[error("failed to remove cached state of sequence {0}")]
    CacheRemove(u32),

    /// The engine produced no logits for a batch position that requested them.
    #[error("no logits available for batch index {0}")]
    MissingLogits(usize),

    /// The work queue is empty after loading.
    #[error("no valid prompts found in {0}")]
    NoPrompts(String),

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Sampling error.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
