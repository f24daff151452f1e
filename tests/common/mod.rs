//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};

use nano_parallel::core::batch::{BatchEntry, BatchView};
use nano_parallel::engine::{
    CacheRange, CacheUsage, DecodeStatus, Engine, SeqId, TextCodec, TokenId, TokenSampler,
};
use nano_parallel::{Result, SchedulerConfig};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const NEWLINE: TokenId = 10;
pub const USER: TokenId = 11;
pub const WORD: TokenId = 20;

/// Something the scheduler asked of the engine, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// A decode call with the number of entries submitted and the status returned.
    Decode { n_tokens: usize, code: i32 },
    Copy { src: SeqId, dst: SeqId },
    Remove { seq: SeqId },
}

/// Engine that returns scripted status codes and checks cache positions.
///
/// Every cached sequence tracks its length; an entry whose position is not the
/// next position of its sequence is recorded as a violation.
///
/// Cells are counted like the candle engine does: positions a sequence copied
/// from another are counted once, on the source. With a cell limit set, a
/// chunk that does not fit reports exhaustion.
pub struct FakeEngine {
    statuses: VecDeque<i32>,
    pub ops: Vec<Op>,
    pub chunks: Vec<Vec<BatchEntry>>,
    pub violations: Vec<String>,
    /// Highest cell usage after any decode.
    pub peak_cells: usize,
    lens: HashMap<SeqId, usize>,
    shared: HashMap<SeqId, usize>,
    logits: Vec<Option<Vec<f32>>>,
    eog: HashSet<TokenId>,
    n_ctx: usize,
    cell_limit: bool,
    refuse_removes: bool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            statuses: VecDeque::new(),
            ops: Vec::new(),
            chunks: Vec::new(),
            violations: Vec::new(),
            peak_cells: 0,
            lens: HashMap::new(),
            shared: HashMap::new(),
            logits: Vec::new(),
            eog: HashSet::from([EOS]),
            n_ctx: 1024,
            cell_limit: false,
            refuse_removes: false,
        }
    }

    /// Report exhaustion for chunks that would use more than `n_ctx` cells.
    pub fn with_cell_limit(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self.cell_limit = true;
        self
    }

    /// Refuse every cache removal.
    pub fn refusing_removes(mut self) -> Self {
        self.refuse_removes = true;
        self
    }

    /// Cells in use: each sequence's positions minus those shared with its source.
    pub fn used_cells(&self) -> usize {
        self.lens
            .iter()
            .map(|(seq, len)| len - self.shared.get(seq).copied().unwrap_or(0))
            .sum()
    }

    /// Status codes for the next decode calls; `0` once exhausted.
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = i32>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn decode_sizes(&self) -> Vec<usize> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Decode { n_tokens, .. } => Some(*n_tokens),
                _ => None,
            })
            .collect()
    }

    pub fn n_decode_calls(&self) -> usize {
        self.decode_sizes().len()
    }

    /// Cached length of `seq`.
    pub fn cache_len(&self, seq: SeqId) -> usize {
        self.lens.get(&seq).copied().unwrap_or(0)
    }
}

impl Engine for FakeEngine {
    fn decode(&mut self, batch: BatchView<'_>) -> DecodeStatus {
        let mut code = self.statuses.pop_front().unwrap_or(0);
        if code == 0 && self.cell_limit && self.used_cells() + batch.len() > self.n_ctx {
            code = 1;
        }
        self.ops.push(Op::Decode {
            n_tokens: batch.len(),
            code,
        });

        let status = DecodeStatus::from_code(code);
        if !status.is_ok() {
            return status;
        }

        self.logits.clear();
        for entry in batch.entries() {
            let seq = entry.seq_ids[0];
            let expected = self.cache_len(seq);
            if entry.pos != expected {
                self.violations.push(format!(
                    "seq {seq}: got position {}, expected {expected}",
                    entry.pos
                ));
            }
            self.lens.insert(seq, entry.pos + 1);
            self.logits
                .push(entry.logits.then(|| vec![seq as f32, entry.pos as f32]));
        }
        self.chunks.push(batch.entries().to_vec());
        self.peak_cells = self.peak_cells.max(self.used_cells());
        status
    }

    fn logits(&self, index: usize) -> Option<&[f32]> {
        self.logits.get(index)?.as_deref()
    }

    fn cache_copy(&mut self, src: SeqId, dst: SeqId, _range: CacheRange) {
        self.ops.push(Op::Copy { src, dst });
        let len = self.cache_len(src);
        self.lens.insert(dst, len);
        self.shared.insert(dst, len);
    }

    fn cache_remove(&mut self, seq: SeqId, _range: CacheRange) -> bool {
        self.ops.push(Op::Remove { seq });
        if self.refuse_removes {
            return false;
        }
        self.lens.remove(&seq);
        self.shared.remove(&seq);
        true
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.eog.contains(&token)
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn cache_usage(&self) -> CacheUsage {
        let mut sequences: Vec<_> = self.lens.iter().map(|(&s, &l)| (s, l)).collect();
        sequences.sort_unstable();
        CacheUsage {
            used_cells: self.used_cells(),
            n_ctx: self.n_ctx,
            sequences,
        }
    }
}

/// One token per whitespace-separated word; BOS when special tokens are requested.
pub struct FakeCodec;

impl TextCodec for FakeCodec {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.split_whitespace().map(|w| 100 + w.len() as TokenId));
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|&token| match token {
                EOS => String::new(),
                NEWLINE => "\n".to_string(),
                USER => "User:".to_string(),
                WORD => "word ".to_string(),
                other => format!("t{other} "),
            })
            .collect())
    }
}

/// Sampler replaying a fixed token script, restarting it on reset.
#[derive(Debug, Clone)]
pub struct ScriptedSampler {
    script: Vec<TokenId>,
    cursor: usize,
    pub resets: usize,
    pub accepted: Vec<TokenId>,
}

impl ScriptedSampler {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            cursor: 0,
            resets: 0,
            accepted: Vec::new(),
        }
    }
}

impl TokenSampler for ScriptedSampler {
    fn sample(&mut self, _logits: &[f32]) -> Result<TokenId> {
        let token = self.script[self.cursor % self.script.len()];
        self.cursor += 1;
        Ok(token)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.resets += 1;
        self.accepted.clear();
    }
}

/// Three words, then a newline: retires after three fed-back tokens.
pub fn three_words() -> Vec<TokenId> {
    vec![WORD, WORD, WORD, NEWLINE]
}

pub fn prompts(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("p{i}")).collect()
}

pub fn config(n_parallel: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .n_parallel(n_parallel)
        .n_sequences(100)
        .n_batch(512)
}

/// System prompt tokenized by [`FakeCodec`] as BOS plus three words.
pub const SYSTEM: &str = "you are helpful";
pub const N_SYSTEM: usize = 4;
