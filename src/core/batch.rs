//! Token batch submitted to the engine.
//!
//! A [`Batch`] is rebuilt from scratch every scheduling tick. Each entry is one
//! token at an absolute position, owned by one or more sequences, optionally
//! flagged to have its logits computed.
//!
//! ```text
//!  index:    0     1     2     3     4     5
//!  token:   t17   t18   t42   t9    t301  t7
//!  pos:     40    41    40    41    42    57
//!  seq:     [1]   [1]   [2]   [2]   [2]   [3]
//!  logits:   ·     ✓     ·     ·     ✓     ✓
//!           └ prompt ┘  └──── prompt ────┘  └ generated
//! ```
//!
//! The engine consumes a batch through [`BatchView`]s, contiguous chunks that
//! remember their offset so logits can be routed back by absolute index.

use std::ops::Range;

use crate::engine::{SeqId, TokenId};
use crate::error::{Error, Result};

/// One token of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Token to evaluate.
    pub token: TokenId,
    /// Absolute position of the token in its sequence(s).
    pub pos: usize,
    /// Sequences this position belongs to.
    pub seq_ids: Vec<SeqId>,
    /// Whether logits should be produced for this entry.
    pub logits: bool,
}

/// Capacity-bounded batch of tokens for one scheduling tick.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    /// Create an empty batch that holds at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchFull`] when the batch is at capacity.
    pub fn add(
        &mut self,
        token: TokenId,
        pos: usize,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<usize> {
        if self.entries.len() >= self.capacity {
            return Err(Error::BatchFull {
                capacity: self.capacity,
            });
        }

        self.entries.push(BatchEntry {
            token,
            pos,
            seq_ids: seq_ids.to_vec(),
            logits,
        });
        Ok(self.entries.len() - 1)
    }

    /// Remove all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All entries in order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&BatchEntry> {
        self.entries.get(index)
    }

    /// View over the whole batch.
    pub fn as_view(&self) -> BatchView<'_> {
        BatchView {
            offset: 0,
            entries: &self.entries,
        }
    }

    /// View over `range`, clamped to the batch length.
    pub fn view(&self, range: Range<usize>) -> BatchView<'_> {
        let end = range.end.min(self.entries.len());
        let start = range.start.min(end);
        BatchView {
            offset: start,
            entries: &self.entries[start..end],
        }
    }
}

/// Contiguous chunk of a [`Batch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    offset: usize,
    entries: &'a [BatchEntry],
}

impl<'a> BatchView<'a> {
    /// Index of the first entry within the parent batch.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the view has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order.
    pub fn entries(&self) -> &'a [BatchEntry] {
        self.entries
    }

    /// Range of parent-batch indices covered by this view.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.entries.len()
    }
}
