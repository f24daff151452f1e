//! Sequence cache adapter.
//!
//! Thin layer over the engine's per-sequence cache primitives. Sequence
//! [`SYSTEM_SEQ_ID`] holds the shared system prefix; every client sequence
//! starts as a copy of it and is reset back to it when the client retires.
//!
//! ```text
//!   seq 0  [ system prefix ............ ]
//!   seq 1  [ system prefix ............ ][ prompt + response of client 0 ]
//!   seq 2  [ system prefix ............ ][ prompt + response of client 1 ]
//!            ▲ shared by copy, never recomputed
//! ```

use tracing::{debug, info};

use crate::core::batch::Batch;
use crate::engine::{CacheRange, DecodeStatus, Engine, SeqId, TextCodec, TokenId, SYSTEM_SEQ_ID};
use crate::error::{Error, Result};

/// Tokenized system prompt evaluated under [`SYSTEM_SEQ_ID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrefix {
    tokens: Vec<TokenId>,
}

impl SystemPrefix {
    /// Wrap already-evaluated prefix tokens.
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self { tokens }
    }

    /// An empty prefix (clients start from position 0).
    pub fn empty() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Prefix tokens.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Number of prefix tokens; client positions start here.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the prefix has no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Per-sequence cache operations used by the scheduler.
pub struct SequenceCache;

impl SequenceCache {
    /// Drop everything `seq` cached and copy the system prefix back in.
    ///
    /// # Errors
    ///
    /// Returns error if `seq` is the system prefix sequence itself, or
    /// [`Error::CacheRemove`] if the engine refuses the removal.
    pub fn reset_to_prefix<E: Engine + ?Sized>(engine: &mut E, seq: SeqId) -> Result<()> {
        if seq == SYSTEM_SEQ_ID {
            return Err(Error::Config(
                "the system prefix sequence cannot be reset".into(),
            ));
        }

        if !engine.cache_remove(seq, CacheRange::ALL) {
            return Err(Error::CacheRemove(seq));
        }
        engine.cache_copy(SYSTEM_SEQ_ID, seq, CacheRange::ALL);
        debug!(seq, "reset sequence to system prefix");
        Ok(())
    }

    /// Copy the system prefix into every client sequence `1..=n_clients`.
    pub fn fork_prefix<E: Engine + ?Sized>(engine: &mut E, n_clients: usize) {
        for seq in 1..=n_clients as SeqId {
            engine.cache_copy(SYSTEM_SEQ_ID, seq, CacheRange::ALL);
        }
    }

    /// Reset `seqs` in one pass, used when every client retired at once.
    pub fn clear_sequences<E: Engine + ?Sized>(engine: &mut E, seqs: &[SeqId]) -> Result<()> {
        for &seq in seqs {
            Self::reset_to_prefix(engine, seq)?;
        }
        info!(n_seqs = seqs.len(), "clearing the KV cache");
        Ok(())
    }
}

/// Tokenize and decode the system prompt once, then share it with all clients.
///
/// The prompt is tokenized with special tokens (BOS) since client prompts are not.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the engine rejects the prefix batch.
pub fn evaluate_system_prefix<E, T>(
    engine: &mut E,
    codec: &T,
    system_prompt: &str,
    n_clients: usize,
) -> Result<SystemPrefix>
where
    E: Engine + ?Sized,
    T: TextCodec + ?Sized,
{
    let tokens = codec.tokenize(system_prompt, true)?;
    if tokens.is_empty() {
        return Ok(SystemPrefix::empty());
    }

    info!(n_tokens = tokens.len(), "evaluating the system prompt ...");

    let mut batch = Batch::new(tokens.len());
    for (pos, &token) in tokens.iter().enumerate() {
        batch.add(token, pos, &[SYSTEM_SEQ_ID], false)?;
    }

    match engine.decode(batch.as_view()) {
        DecodeStatus::Ok => {}
        status => {
            return Err(Error::Decode {
                n_batch: batch.len(),
                code: status.code(),
            })
        }
    }

    SequenceCache::fork_prefix(engine, n_clients);

    Ok(SystemPrefix::new(tokens))
}
