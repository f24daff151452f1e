//! Run metrics and result records.
//!
//! The [`Aggregator`] owns every [`ResultRecord`] in retirement order and the
//! run-wide counters. Throughput is computed from a single start/end pair that
//! spans the whole run, not summed per client.

use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::core::slot::SlotId;
use crate::scheduler::stop::FinishReason;

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// One finished client exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    /// Slot that served the request.
    pub slot_id: SlotId,
    /// Position of the prompt in the work queue.
    pub work_index: usize,
    /// Prompt as read from the work queue.
    pub prompt: String,
    /// Final response, reverse prompt stripped.
    pub response: String,
    /// Time from admission to retirement.
    #[serde(serialize_with = "secs")]
    pub duration: Duration,
    /// Time from the first fed-back token to retirement.
    #[serde(serialize_with = "opt_secs")]
    pub generation_duration: Option<Duration>,
    /// Prompt tokens ingested.
    pub prompt_tokens: usize,
    /// Generated tokens fed back to the engine.
    pub response_tokens: usize,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl ResultRecord {
    /// Prompt plus response tokens.
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.response_tokens
    }

    /// Total tokens per second over the record's lifetime.
    pub fn tokens_per_second(&self) -> f64 {
        rate(self.total_tokens(), self.duration)
    }
}

/// End-of-run totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSummary {
    /// Number of retired clients.
    pub n_items: usize,
    pub n_prompt_tokens: usize,
    pub n_gen_tokens: usize,
    /// Decode retries caused by cache exhaustion.
    pub n_cache_miss: usize,
    /// Wall time of the whole run.
    #[serde(serialize_with = "secs")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Prompt tokens per second.
    pub fn prompt_speed(&self) -> f64 {
        rate(self.n_prompt_tokens, self.elapsed)
    }

    /// Generated tokens per second.
    pub fn gen_speed(&self) -> f64 {
        rate(self.n_gen_tokens, self.elapsed)
    }

    /// Prompt plus generated tokens per second.
    pub fn total_speed(&self) -> f64 {
        rate(self.n_prompt_tokens + self.n_gen_tokens, self.elapsed)
    }
}

/// Accumulates counters and result records across the run.
#[derive(Debug)]
pub struct Aggregator {
    records: Vec<ResultRecord>,
    n_total_prompt: usize,
    n_total_gen: usize,
    n_cache_miss: usize,
    t_start: Instant,
    t_end: Option<Instant>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Create an aggregator; the run clock starts now.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            n_total_prompt: 0,
            n_total_gen: 0,
            n_cache_miss: 0,
            t_start: Instant::now(),
            t_end: None,
        }
    }

    /// Restart the run clock.
    pub fn start(&mut self) {
        self.t_start = Instant::now();
        self.t_end = None;
    }

    /// Stop the run clock.
    pub fn finish(&mut self) {
        self.t_end = Some(Instant::now());
    }

    /// Append a retired client's record and add its token counts.
    pub fn record(&mut self, record: ResultRecord) {
        self.n_total_prompt += record.prompt_tokens;
        self.n_total_gen += record.response_tokens;
        self.records.push(record);
    }

    /// Count one decode retry.
    pub fn record_cache_miss(&mut self) {
        self.n_cache_miss += 1;
    }

    /// Records in retirement order.
    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// Take ownership of the records.
    pub fn into_records(self) -> Vec<ResultRecord> {
        self.records
    }

    pub fn n_total_prompt(&self) -> usize {
        self.n_total_prompt
    }

    pub fn n_total_gen(&self) -> usize {
        self.n_total_gen
    }

    pub fn n_cache_miss(&self) -> usize {
        self.n_cache_miss
    }

    /// Totals so far; elapsed runs to `finish()` or to now.
    pub fn summary(&self) -> RunSummary {
        let end = self.t_end.unwrap_or_else(Instant::now);
        RunSummary {
            n_items: self.records.len(),
            n_prompt_tokens: self.n_total_prompt,
            n_gen_tokens: self.n_total_gen,
            n_cache_miss: self.n_cache_miss,
            elapsed: end.duration_since(self.t_start),
        }
    }
}
