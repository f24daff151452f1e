//! Client slots.
//!
//! A slot is one simulated client: it owns a sampler, holds at most one
//! prompt/response exchange at a time, and is reused for the whole run.
//!
//! ## Lifecycle
//!
//! ```text
//!            admit()                first sample           begin_retire()
//!   ┌──────┐ ──────► ┌──────────────┐ ──────► ┌────────────┐ ──────► ┌──────────┐
//!   │ Idle │         │ PromptIngest │         │ Generating │         │ Retiring │
//!   └──────┘         └──────────────┘         └────────────┘         └──────────┘
//!      ▲                                                                   │
//!      └────────────────────────── finish_retire() ────────────────────────┘
//! ```

use std::time::Instant;

use crate::engine::{OutputStream, SeqId, TextCodec, TokenId, TokenSampler};
use crate::error::{Error, Result};
use crate::metrics::ResultRecord;
use crate::scheduler::stop::FinishReason;

/// Stable identifier of a slot in the pool.
pub type SlotId = usize;

/// State of a client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// No work bound; eligible for admission.
    Idle,
    /// Prompt tokens are in the current batch, waiting for the first sample.
    PromptIngest,
    /// Generating one token per tick.
    Generating,
    /// Termination fired; the result is being recorded.
    Retiring,
}

impl SlotState {
    /// Whether the slot holds a client.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PromptIngest => "PromptIngest",
            Self::Generating => "Generating",
            Self::Retiring => "Retiring",
        }
    }
}

/// One concurrent client.
#[derive(Debug)]
pub struct ClientSlot<S> {
    /// Position in the pool.
    slot_id: SlotId,
    /// Sequence handle while active.
    seq_id: Option<SeqId>,
    /// Current state.
    state: SlotState,
    /// Index of the bound work item.
    work_index: Option<usize>,
    /// Prompt as read from the work queue.
    input: String,
    /// Tokenized prompt (including the prompt suffix).
    prompt_tokens: Vec<TokenId>,
    /// Accumulated response text.
    response: String,
    /// Generated tokens, detokenized as a whole.
    output: OutputStream,
    /// Last sampled token, fed back on the next tick.
    sampled: Option<TokenId>,
    n_prompt: usize,
    n_decoded: usize,
    /// Index of this slot's logits-emitting entry in the current batch.
    batch_cursor: Option<usize>,
    t_prompt_start: Option<Instant>,
    t_generation_start: Option<Instant>,
    /// Cached positions past the system prefix still need removing.
    cache_dirty: bool,
    sampler: S,
}

impl<S: TokenSampler> ClientSlot<S> {
    /// Create an idle slot.
    pub fn new(slot_id: SlotId, sampler: S) -> Self {
        Self {
            slot_id,
            seq_id: None,
            state: SlotState::Idle,
            work_index: None,
            input: String::new(),
            prompt_tokens: Vec::new(),
            response: String::new(),
            output: OutputStream::new(),
            sampled: None,
            n_prompt: 0,
            n_decoded: 0,
            batch_cursor: None,
            t_prompt_start: None,
            t_generation_start: None,
            cache_dirty: false,
            sampler,
        }
    }

    // ========== Getters ==========

    /// Get the slot ID.
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Engine sequence id owned by this slot. Id 0 is the system prefix.
    pub fn cache_seq_id(&self) -> SeqId {
        self.slot_id as SeqId + 1
    }

    /// Sequence handle, `None` while idle.
    pub fn seq_id(&self) -> Option<SeqId> {
        self.seq_id
    }

    /// Get the current state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Whether the slot can take new work.
    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    /// Index of the bound work item.
    pub fn work_index(&self) -> Option<usize> {
        self.work_index
    }

    /// Prompt as read from the work queue.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Tokenized prompt.
    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.prompt_tokens
    }

    /// Response accumulated so far.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Last sampled token.
    pub fn sampled(&self) -> Option<TokenId> {
        self.sampled
    }

    /// Number of prompt tokens.
    pub fn n_prompt(&self) -> usize {
        self.n_prompt
    }

    /// Number of generated tokens fed back to the engine.
    pub fn n_decoded(&self) -> usize {
        self.n_decoded
    }

    /// Index of the pending logits entry in the current batch.
    pub fn batch_cursor(&self) -> Option<usize> {
        self.batch_cursor
    }

    /// When the prompt was admitted.
    pub fn t_prompt_start(&self) -> Option<Instant> {
        self.t_prompt_start
    }

    /// When the first fed-back token was sampled.
    pub fn t_generation_start(&self) -> Option<Instant> {
        self.t_generation_start
    }

    /// Whether stale positions of a previous client are still cached.
    pub fn cache_dirty(&self) -> bool {
        self.cache_dirty
    }

    // ========== Batch bookkeeping ==========

    /// Absolute position of the next token this slot feeds, given the system prefix length.
    pub fn next_position(&self, n_system: usize) -> usize {
        n_system + self.n_prompt + self.n_decoded
    }

    /// Record that the last sampled token was placed at batch index `cursor`.
    pub fn mark_fed(&mut self, cursor: usize) -> Result<()> {
        if self.state != SlotState::Generating {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "Generating",
            });
        }
        self.batch_cursor = Some(cursor);
        self.n_decoded += 1;
        Ok(())
    }

    /// Set or clear the pending batch index.
    pub fn set_batch_cursor(&mut self, cursor: Option<usize>) {
        self.batch_cursor = cursor;
    }

    /// Record that the slot's cache has been reset to the system prefix.
    pub fn mark_cache_clean(&mut self) {
        self.cache_dirty = false;
    }

    // ========== Sampling ==========

    /// Sample and accept the next token from `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId> {
        let token = self.sampler.sample(logits)?;
        self.sampler.accept(token);
        Ok(token)
    }

    /// Text `token` adds to this client's output so far.
    pub fn next_piece<T: TextCodec + ?Sized>(&mut self, codec: &T, token: TokenId) -> Result<String> {
        self.output.push(codec, token)
    }

    /// Append a sampled token and its text.
    ///
    /// The first sample after prompt ingestion moves the slot to `Generating`.
    pub fn append_output(&mut self, token: TokenId, piece: &str) -> Result<()> {
        match self.state {
            SlotState::PromptIngest => self.state = SlotState::Generating,
            SlotState::Generating => {}
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: self.state.as_str(),
                    to: "Generating",
                })
            }
        }

        if self.n_decoded == 1 {
            // Measure generation only after every concurrent prompt has been ingested
            self.t_generation_start = Some(Instant::now());
        }

        self.response.push_str(piece);
        self.sampled = Some(token);
        Ok(())
    }

    // ========== State transitions ==========

    /// Bind a work item to this slot.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is not idle.
    pub fn admit(
        &mut self,
        work_index: usize,
        input: impl Into<String>,
        prompt_tokens: Vec<TokenId>,
    ) -> Result<()> {
        if self.state != SlotState::Idle {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "PromptIngest",
            });
        }

        self.sampler.reset();
        self.seq_id = Some(self.cache_seq_id());
        self.work_index = Some(work_index);
        self.input = input.into();
        self.n_prompt = prompt_tokens.len();
        self.prompt_tokens = prompt_tokens;
        self.response.clear();
        self.output.clear();
        self.sampled = None;
        self.n_decoded = 0;
        self.batch_cursor = None;
        self.t_prompt_start = Some(Instant::now());
        self.t_generation_start = None;
        self.state = SlotState::PromptIngest;
        Ok(())
    }

    /// Stop generating and hand the response over for truncation.
    ///
    /// # Errors
    ///
    /// Returns error if the slot is not generating.
    pub fn begin_retire(&mut self) -> Result<&mut String> {
        if self.state != SlotState::Generating {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "Retiring",
            });
        }
        self.state = SlotState::Retiring;
        Ok(&mut self.response)
    }

    /// Produce the result record and return to `Idle`.
    ///
    /// The slot's cached positions are flagged dirty; the scheduler resets
    /// them to the system prefix before its next decode call.
    ///
    /// # Errors
    ///
    /// Returns error if [`begin_retire`](Self::begin_retire) was not called.
    pub fn finish_retire(&mut self, reason: FinishReason) -> Result<ResultRecord> {
        if self.state != SlotState::Retiring {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "Idle",
            });
        }

        let now = Instant::now();
        let started = self.t_prompt_start.unwrap_or(now);
        let record = ResultRecord {
            slot_id: self.slot_id,
            work_index: self.work_index.unwrap_or_default(),
            prompt: std::mem::take(&mut self.input),
            response: std::mem::take(&mut self.response),
            duration: now.duration_since(started),
            generation_duration: self.t_generation_start.map(|t| now.duration_since(t)),
            prompt_tokens: self.n_prompt,
            response_tokens: self.n_decoded,
            finish_reason: reason,
        };

        self.seq_id = None;
        self.work_index = None;
        self.prompt_tokens.clear();
        self.output.clear();
        self.sampled = None;
        self.n_prompt = 0;
        self.n_decoded = 0;
        self.batch_cursor = None;
        self.t_prompt_start = None;
        self.t_generation_start = None;
        self.cache_dirty = true;
        self.state = SlotState::Idle;

        Ok(record)
    }
}
