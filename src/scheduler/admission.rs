//! Work queue and admission control.
//!
//! Prompts are handed out in strict FIFO order, each exactly once. Admission
//! fills every idle slot it can in one pass.

use std::collections::VecDeque;

use tracing::info;

use crate::core::batch::Batch;
use crate::core::slot::ClientSlot;
use crate::engine::{TextCodec, TokenSampler};
use crate::error::{Error, Result};

/// One prompt waiting for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Position in the input prompt list.
    pub index: usize,
    pub prompt: String,
}

/// Ordered queue of prompts, consumed front to back.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    total: usize,
}

impl WorkQueue {
    /// Build a queue from prompts, keeping at most `max_items` of them.
    pub fn new(prompts: impl IntoIterator<Item = String>, max_items: usize) -> Self {
        let items: VecDeque<WorkItem> = prompts
            .into_iter()
            .take(max_items)
            .enumerate()
            .map(|(index, prompt)| WorkItem { index, prompt })
            .collect();
        let total = items.len();
        Self { items, total }
    }

    /// Next item without consuming it.
    pub fn peek(&self) -> Option<&WorkItem> {
        self.items.front()
    }

    /// Take the next item.
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Items not yet handed out.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    /// Items in the queue when it was built.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Items handed out so far.
    pub fn consumed(&self) -> usize {
        self.total - self.items.len()
    }

    /// Whether every item has been handed out.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Binds queued prompts to idle slots.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    cont_batching: bool,
    prompt_suffix: String,
}

impl AdmissionController {
    pub fn new(cont_batching: bool, prompt_suffix: impl Into<String>) -> Self {
        Self {
            cont_batching,
            prompt_suffix: prompt_suffix.into(),
        }
    }

    /// Whether admission may run this tick.
    ///
    /// Without continuous batching, prompts are only ingested into an empty
    /// batch, so a batch is either all prompt ingestion or all generation.
    pub fn should_admit(&self, batch: &Batch) -> bool {
        self.cont_batching || batch.is_empty()
    }

    /// Admit queued prompts into idle slots, appending their tokens to `batch`.
    ///
    /// A prompt that does not fit in the remaining batch capacity waits for a
    /// later tick.
    ///
    /// Returns the number of slots admitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenization`] for a prompt that produces no tokens and
    /// [`Error::BatchFull`] for a prompt longer than an empty batch.
    pub fn admit<T, S>(
        &self,
        codec: &T,
        slots: &mut [ClientSlot<S>],
        queue: &mut WorkQueue,
        batch: &mut Batch,
        n_system: usize,
    ) -> Result<usize>
    where
        T: TextCodec + ?Sized,
        S: TokenSampler,
    {
        if !self.should_admit(batch) {
            return Ok(0);
        }

        let mut admitted = 0;

        for slot in slots.iter_mut().filter(|s| s.is_idle()) {
            let Some(item) = queue.peek() else {
                break;
            };

            let text = format!("{}{}", item.prompt, self.prompt_suffix);
            let tokens = codec.tokenize(&text, false)?;
            if tokens.is_empty() {
                return Err(Error::Tokenization(format!(
                    "prompt {} produced no tokens",
                    item.index
                )));
            }

            if batch.len() + tokens.len() > batch.capacity() {
                if batch.is_empty() {
                    return Err(Error::BatchFull {
                        capacity: batch.capacity(),
                    });
                }
                break;
            }

            let Some(item) = queue.pop() else {
                break;
            };


            let seq = slot.cache_seq_id();
            let last = tokens.len() - 1;
            let mut cursor = 0;
            for (i, &token) in tokens.iter().enumerate() {
                cursor = batch.add(token, n_system + i, &[seq], i == last)?;
            }

            slot.admit(item.index, item.prompt, tokens)?;
            slot.set_batch_cursor(Some(cursor));
            admitted += 1;

            info!(
                client = slot.slot_id(),
                seq = item.index,
                total = queue.total(),
                n_prompt = slot.n_prompt(),
                "Client {:3}, seq {:4}, started decoding ...",
                slot.slot_id(),
                item.index
            );
        }

        Ok(admitted)
    }
}
