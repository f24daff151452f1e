//! Per-client token sampler.
//!
//! Each client slot owns one [`Sampler`]. It keeps the client's recent
//! tokens for the repeat penalty and its own RNG, and forgets both on
//! [`reset`](TokenSampler::reset) so a reused slot starts from scratch.
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repeat penalty over the last `repeat_last_n` accepted tokens
//!     │
//!     ▼ Temperature scaling (0 = greedy)
//!     │
//!     ▼ Top-k filtering (optional)
//!     │
//!     ▼ Softmax
//!     │
//!     ▼ Top-p filtering (optional)
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use std::collections::VecDeque;

use candle_core::{Device, Tensor, D};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{TokenId, TokenSampler};
use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Temperature / top-k / top-p sampler with a repeat penalty.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    /// 0 = disabled.
    top_k: usize,
    /// 1.0 = disabled.
    top_p: f32,
    /// 1.0 = disabled.
    repeat_penalty: f32,
    repeat_last_n: usize,
    seed: Option<u64>,
    rng: StdRng,
    history: VecDeque<TokenId>,
}

impl Sampler {
    /// Create a sampler; seeded from `config.seed` when set, from entropy otherwise.
    pub fn new(config: &SamplingConfig) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(config, seed),
            None => Self::build(config, None),
        }
    }

    /// Create a sampler with a fixed seed.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self::build(config, Some(seed))
    }

    /// Sampler for one client slot. A configured seed is offset by the slot id
    /// so clients do not produce identical streams.
    pub fn for_slot(config: &SamplingConfig, slot_id: usize) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(config, seed.wrapping_add(slot_id as u64)),
            None => Self::build(config, None),
        }
    }

    fn build(config: &SamplingConfig, seed: Option<u64>) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
            seed,
            rng: Self::rng(seed),
            history: VecDeque::with_capacity(config.repeat_last_n),
        }
    }

    fn rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Apply the repeat penalty to every token in the history.
    fn penalize(&self, logits: &mut [f32]) {
        if self.repeat_penalty == 1.0 || self.history.is_empty() {
            return;
        }
        let mut seen = self.history.iter().copied().collect::<Vec<_>>();
        seen.sort_unstable();
        seen.dedup();
        for token in seen {
            if let Some(logit) = logits.get_mut(token as usize) {
                if *logit <= 0.0 {
                    *logit *= self.repeat_penalty;
                } else {
                    *logit /= self.repeat_penalty;
                }
            }
        }
    }

    fn sample_logits(&mut self, logits: &[f32]) -> Result<TokenId> {
        if logits.is_empty() {
            return Err(Error::Sampling("empty logits".into()));
        }

        let mut logits = logits.to_vec();
        self.penalize(&mut logits);

        if self.temperature <= 0.0 {
            return Ok(argmax(&logits));
        }
        if self.temperature != 1.0 {
            for logit in &mut logits {
                *logit /= self.temperature;
            }
        }

        let (logits, indices) = self.top_k_filter(logits);

        let n = logits.len();
        let tensor = Tensor::from_vec(logits, n, &Device::Cpu)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&tensor, D::Minus1)?.to_vec1()?;

        let (probs, indices) = if self.top_p > 0.0 && self.top_p < 1.0 {
            top_p_filter(probs, indices, self.top_p)
        } else {
            (probs, indices)
        };

        let sum: f32 = probs.iter().sum();
        let weights: Vec<f64> = probs.iter().map(|&p| (p / sum) as f64).collect();
        let dist = rand::distributions::WeightedIndex::new(&weights)
            .map_err(|e| Error::Sampling(format!("failed to create distribution: {e}")))?;

        Ok(indices[dist.sample(&mut self.rng)])
    }

    /// Keep the `top_k` highest logits, returning them with their token ids.
    fn top_k_filter(&self, logits: Vec<f32>) -> (Vec<f32>, Vec<TokenId>) {
        let vocab_size = logits.len();
        if self.top_k == 0 || self.top_k >= vocab_size {
            return (logits, (0..vocab_size as TokenId).collect());
        }

        let mut indexed: Vec<(TokenId, f32)> = logits
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as TokenId, v))
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(self.top_k);

        indexed.into_iter().map(|(i, v)| (v, i)).unzip()
    }
}

fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0 as TokenId
}

/// Keep the most likely tokens until their cumulative probability exceeds `p`.
fn top_p_filter(probs: Vec<f32>, indices: Vec<TokenId>, p: f32) -> (Vec<f32>, Vec<TokenId>) {
    let mut indexed: Vec<(f32, TokenId)> = probs.into_iter().zip(indices).collect();
    indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, (prob, _)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = i + 1;
            break;
        }
    }
    indexed.truncate(cutoff);
    indexed.into_iter().unzip()
}

impl TokenSampler for Sampler {
    fn sample(&mut self, logits: &[f32]) -> Result<TokenId> {
        self.sample_logits(logits)
    }

    fn accept(&mut self, token: TokenId) {
        if self.repeat_last_n == 0 {
            return;
        }
        if self.history.len() == self.repeat_last_n {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    fn reset(&mut self) {
        self.history.clear();
        if self.seed.is_some() {
            self.rng = Self::rng(self.seed);
        }
    }
}
