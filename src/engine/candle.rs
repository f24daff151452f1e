//! Candle-backed Llama engine.
//!
//! Wraps `candle_transformers::models::llama::Llama` behind the [`Engine`]
//! trait. Each sequence id owns a llama `Cache`; copying a sequence clones
//! that cache, which shares the underlying key/value tensors instead of
//! recomputing them.
//!
//! ## Cell accounting
//!
//! The context holds `n_ctx` cells. Positions a client sequence copied from
//! another sequence are counted once, on the source:
//!
//! ```text
//!   used = len(seq 0) + Σ (len(seq i) - shared(seq i))
//! ```
//!
//! A chunk that would push `used` past `n_ctx` is rejected with
//! [`DecodeStatus::Exhausted`] before any work is done.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaEosToks};
use tracing::{debug, error, info, warn};

use super::loader::{load_llama_config, load_safetensors, parse_dtype, ModelFiles};
use super::{CacheRange, CacheUsage, DecodeStatus, Engine, EnginePerf, SeqId, TokenId};
use crate::core::batch::BatchView;
use crate::config::EngineConfig;
use crate::error::Result;

/// Status reported when the chunk does not fit in the free cells.
const STATUS_NO_SLOT: i32 = 1;
/// Status reported for a malformed batch.
const STATUS_INVALID_BATCH: i32 = -1;
/// Status reported when the forward pass fails.
const STATUS_BACKEND: i32 = -2;

/// Cached state of one sequence.
#[derive(Debug, Clone)]
struct SeqState {
    cache: Cache,
    /// Positions cached.
    len: usize,
    /// Leading positions shared with the sequence this one was copied from.
    shared: usize,
}

/// A consecutive run of entries for one sequence, ending at a logits entry or a sequence change.
struct Run {
    seq: SeqId,
    start: usize,
    end: usize,
}

/// Llama model with per-sequence caches.
pub struct CandleEngine {
    model: Llama,
    config: Config,
    device: Device,
    dtype: DType,
    n_ctx: usize,
    eog_tokens: Vec<TokenId>,
    seqs: BTreeMap<SeqId, SeqState>,
    /// Logits of the last decoded chunk, by index within the chunk.
    logits: Vec<Option<Vec<f32>>>,
    perf: EnginePerf,
}

/// Pick the device: CPU when forced, otherwise the first available accelerator.
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

impl CandleEngine {
    /// Load the model described by `files`.
    pub fn load(files: &ModelFiles, config: &EngineConfig) -> Result<Self> {
        let device = select_device(config.cpu)?;
        let dtype = parse_dtype(&config.dtype)?;

        let model_config = load_llama_config(&files.config)?.into_config(false);
        let vb = load_safetensors(&files.weights, dtype, &device)?;
        let model = Llama::load(vb, &model_config)?;

        let eog_tokens = match &model_config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        };

        if config.n_ctx > model_config.max_position_embeddings {
            warn!(
                n_ctx = config.n_ctx,
                n_ctx_train = model_config.max_position_embeddings,
                "context size exceeds the model's trained context"
            );
        }

        info!(
            layers = model_config.num_hidden_layers,
            vocab = model_config.vocab_size,
            n_ctx = config.n_ctx,
            ?device,
            ?dtype,
            "model loaded"
        );

        Ok(Self {
            model,
            config: model_config,
            device,
            dtype,
            n_ctx: config.n_ctx,
            eog_tokens,
            seqs: BTreeMap::new(),
            logits: Vec::new(),
            perf: EnginePerf::default(),
        })
    }

    /// Treat `token` as an end-of-generation token as well.
    pub fn add_end_of_generation(&mut self, token: TokenId) {
        if !self.eog_tokens.contains(&token) {
            self.eog_tokens.push(token);
        }
    }

    fn used_cells(&self) -> usize {
        self.seqs.values().map(|s| s.len - s.shared).sum()
    }

    /// Split a chunk into per-sequence runs, checking every entry extends its sequence.
    fn plan(&self, batch: &BatchView<'_>) -> Option<Vec<Run>> {
        let mut next_pos: BTreeMap<SeqId, usize> = BTreeMap::new();
        let mut runs: Vec<Run> = Vec::new();

        for (i, entry) in batch.entries().iter().enumerate() {
            let &[seq] = entry.seq_ids.as_slice() else {
                return None;
            };

            let expected = next_pos
                .entry(seq)
                .or_insert_with(|| self.seqs.get(&seq).map_or(0, |s| s.len));
            if entry.pos != *expected {
                return None;
            }
            *expected += 1;

            match runs.last_mut() {
                Some(run) if run.seq == seq && !batch.entries()[run.end - 1].logits => {
                    run.end = i + 1;
                }
                _ => runs.push(Run {
                    seq,
                    start: i,
                    end: i + 1,
                }),
            }
        }

        Some(runs)
    }

    /// Feed `tokens` to `seq`, returning the logits of the last one.
    fn forward(&mut self, seq: SeqId, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let state = match self.seqs.entry(seq) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(SeqState {
                cache: Cache::new(true, self.dtype, &self.config, &self.device)?,
                len: 0,
                shared: 0,
            }),
        };

        // The llama attention mask only covers a prompt evaluated against an
        // empty cache; anything else goes one token at a time.
        let steps: Vec<&[TokenId]> = if state.len == 0 {
            vec![tokens]
        } else {
            tokens.chunks(1).collect()
        };

        let mut last = None;
        for step in steps {
            let input = Tensor::new(step, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, state.len, &mut state.cache)?;
            state.len += step.len();
            last = Some(logits);
        }

        match last {
            Some(logits) => Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?),
            None => Ok(Vec::new()),
        }
    }
}

impl Engine for CandleEngine {
    fn decode(&mut self, batch: BatchView<'_>) -> DecodeStatus {
        self.logits.clear();

        let Some(runs) = self.plan(&batch) else {
            error!("invalid batch: each entry needs one sequence and the next position of it");
            return DecodeStatus::Fatal(STATUS_INVALID_BATCH);
        };

        if self.used_cells() + batch.len() > self.n_ctx {
            debug!(
                used = self.used_cells(),
                n_tokens = batch.len(),
                n_ctx = self.n_ctx,
                "no free cache cells for chunk"
            );
            return DecodeStatus::Exhausted(STATUS_NO_SLOT);
        }

        let started = Instant::now();
        let mut logits = vec![None; batch.len()];

        for run in runs {
            let tokens: Vec<TokenId> = batch.entries()[run.start..run.end]
                .iter()
                .map(|e| e.token)
                .collect();
            match self.forward(run.seq, &tokens) {
                Ok(out) => {
                    if batch.entries()[run.end - 1].logits {
                        logits[run.end - 1] = Some(out);
                    }
                }
                Err(e) => {
                    error!(seq = run.seq, error = %e, "forward pass failed");
                    return DecodeStatus::Fatal(STATUS_BACKEND);
                }
            }
        }

        self.logits = logits;
        self.perf.n_decode_calls += 1;
        self.perf.n_eval_tokens += batch.len();
        self.perf.eval_time += started.elapsed();
        DecodeStatus::Ok
    }

    fn logits(&self, index: usize) -> Option<&[f32]> {
        self.logits.get(index)?.as_deref()
    }

    fn cache_copy(&mut self, src: SeqId, dst: SeqId, range: CacheRange) {
        if src == dst {
            return;
        }
        let Some(source) = self.seqs.get(&src) else {
            self.seqs.remove(&dst);
            return;
        };
        if !range.covers(source.len) {
            warn!(src, dst, "partial cache copy is not supported");
            return;
        }

        let copy = SeqState {
            cache: source.cache.clone(),
            len: source.len,
            shared: source.len,
        };
        self.seqs.insert(dst, copy);
    }

    fn cache_remove(&mut self, seq: SeqId, range: CacheRange) -> bool {
        let Some(state) = self.seqs.get(&seq) else {
            return true;
        };
        if range.covers(state.len) {
            self.seqs.remove(&seq);
            return true;
        }
        range.start.is_some_and(|start| start >= state.len)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.eog_tokens.contains(&token)
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn cache_usage(&self) -> CacheUsage {
        CacheUsage {
            used_cells: self.used_cells(),
            n_ctx: self.n_ctx,
            sequences: self.seqs.iter().map(|(&id, s)| (id, s.len)).collect(),
        }
    }

    fn perf(&self) -> EnginePerf {
        self.perf
    }
}
