//! The scheduling loop.
//!
//! One tick:
//! 1. assemble one entry per generating slot
//! 2. admit queued prompts into idle slots
//! 3. decode the batch in chunks, sampling each slot's next token as its chunk completes
//! 4. after each chunk, reset the caches of clients that retired in it
//!
//! A retired client's cache is back to the system prefix before the next
//! decode call. When the last active clients retire together, their caches
//! are cleared in one bulk step.
//!
//! The loop ends when a tick assembles nothing and admits nothing.

use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::core::batch::Batch;
use crate::core::cache::{evaluate_system_prefix, SequenceCache, SystemPrefix};
use crate::core::slot::{ClientSlot, SlotId};
use crate::engine::{Engine, SeqId, TextCodec, TokenSampler};
use crate::error::{Error, Result};
use crate::metrics::{Aggregator, ResultRecord, RunSummary};
use crate::scheduler::admission::{AdmissionController, WorkQueue};
use crate::scheduler::assembler::assemble_generation;
use crate::scheduler::decode::{AdaptiveDecoder, DecodeEvent};
use crate::scheduler::stop::StopCriteria;

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Result records in retirement order.
    pub records: Vec<ResultRecord>,
    pub summary: RunSummary,
    /// System prefix tokens.
    pub n_system: usize,
    /// Ticks that submitted work to the engine.
    pub n_ticks: usize,
}

/// Continuous-batching scheduler over a fixed pool of client slots.
pub struct Scheduler<'a, E: ?Sized, T: ?Sized, S> {
    engine: &'a mut E,
    codec: &'a T,
    slots: Vec<ClientSlot<S>>,
    queue: WorkQueue,
    batch: Batch,
    n_system: usize,
    admission: AdmissionController,
    decoder: AdaptiveDecoder,
    stop: StopCriteria,
    aggregator: Aggregator,
    dump_kv_cache: bool,
    n_ticks: usize,
}

impl<'a, E, T, S> Scheduler<'a, E, T, S>
where
    E: Engine + ?Sized,
    T: TextCodec + ?Sized,
    S: TokenSampler,
{
    /// Build a scheduler with `config.n_parallel` slots, one sampler per slot.
    ///
    /// The system prefix must already be evaluated and forked into the client sequences.
    pub fn new(
        engine: &'a mut E,
        codec: &'a T,
        prefix: &SystemPrefix,
        queue: WorkQueue,
        config: &SchedulerConfig,
        mut make_sampler: impl FnMut(SlotId) -> S,
    ) -> Result<Self> {
        config.validate()?;

        let slots = (0..config.n_parallel)
            .map(|id| ClientSlot::new(id, make_sampler(id)))
            .collect();
        let batch = Batch::new(engine.n_ctx().max(config.n_parallel));

        Ok(Self {
            engine,
            codec,
            slots,
            queue,
            batch,
            n_system: prefix.len(),
            admission: AdmissionController::new(config.cont_batching, config.prompt_suffix.clone()),
            decoder: AdaptiveDecoder::new(config.n_batch),
            stop: StopCriteria::from_config(config),
            aggregator: Aggregator::new(),
            dump_kv_cache: config.dump_kv_cache,
            n_ticks: 0,
        })
    }

    // ========== Getters ==========

    pub fn slots(&self) -> &[ClientSlot<S>] {
        &self.slots
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn engine(&self) -> &E {
        &*self.engine
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Ticks that submitted work so far.
    pub fn n_ticks(&self) -> usize {
        self.n_ticks
    }

    // ========== Loop ==========

    /// Run until the queue is drained and every slot is idle.
    ///
    /// # Errors
    ///
    /// Aborts on the first fatal decode error.
    pub fn run(mut self) -> Result<RunReport> {
        info!(
            n_parallel = self.slots.len(),
            n_sequences = self.queue.total(),
            "processing requests ..."
        );

        self.aggregator.start();
        while self.tick()? {}
        self.aggregator.finish();

        let summary = self.aggregator.summary();
        Ok(RunReport {
            records: self.aggregator.into_records(),
            summary,
            n_system: self.n_system,
            n_ticks: self.n_ticks,
        })
    }

    /// Run one tick. Returns `false` once there is no work left.
    pub fn tick(&mut self) -> Result<bool> {
        if self.dump_kv_cache {
            self.dump_cache();
        }

        self.batch.clear();
        assemble_generation(&mut self.batch, &mut self.slots, self.n_system)?;

        self.admission.admit(
            self.codec,
            &mut self.slots,
            &mut self.queue,
            &mut self.batch,
            self.n_system,
        )?;

        if self.batch.is_empty() {
            return Ok(false);
        }

        self.n_ticks += 1;

        let codec = self.codec;
        let stop = &self.stop;
        let slots = &mut self.slots;
        let aggregator = &mut self.aggregator;
        let n_total = self.queue.total();

        let report = self
            .decoder
            .decode(&mut *self.engine, &self.batch, |engine, event| match event {
                DecodeEvent::Retry { .. } => {
                    aggregator.record_cache_miss();
                    Ok(())
                }
                DecodeEvent::Chunk(range) => {
                    let mut pending: Vec<(usize, usize)> = slots
                        .iter()
                        .enumerate()
                        .filter_map(|(i, s)| s.batch_cursor().map(|c| (c, i)))
                        .filter(|(c, _)| range.contains(c))
                        .collect();
                    pending.sort_unstable();

                    for (cursor, i) in pending {
                        let slot = &mut slots[i];
                        let logits = engine
                            .logits(cursor - range.start)
                            .ok_or(Error::MissingLogits(cursor))?;
                        let token = slot.sample(logits)?;
                        let piece = slot.next_piece(codec, token)?;
                        slot.append_output(token, &piece)?;
                        slot.set_batch_cursor(None);

                        let is_eog = engine.is_end_of_generation(token);
                        let reason =
                            stop.check(slot.n_prompt(), slot.n_decoded(), is_eog, slot.response());

                        if let Some(reason) = reason {
                            stop.truncate(slot.begin_retire()?);
                            let record = slot.finish_retire(reason)?;
                            log_completion(&record, n_total, aggregator.n_cache_miss());
                            aggregator.record(record);
                        }
                    }
                    release_retired(engine, slots.as_mut_slice())
                }
            })?;

        debug!(
            n_chunks = report.n_chunks,
            n_cache_miss = report.n_cache_miss,
            n_batch = report.final_n_batch,
            "tick decoded"
        );
        Ok(true)
    }

    fn dump_cache(&self) {
        let usage = self.engine.cache_usage();
        info!(
            used_cells = usage.used_cells,
            n_ctx = usage.n_ctx,
            "kv cache: {}/{} cells used",
            usage.used_cells,
            usage.n_ctx
        );
        for (seq, len) in &usage.sequences {
            debug!(seq, len, "cached sequence");
        }
    }
}

/// Reset the caches of retired clients to the system prefix.
fn release_retired<E, S>(engine: &mut E, slots: &mut [ClientSlot<S>]) -> Result<()>
where
    E: Engine + ?Sized,
    S: TokenSampler,
{
    let seqs: Vec<SeqId> = slots
        .iter()
        .filter(|s| s.cache_dirty())
        .map(|s| s.cache_seq_id())
        .collect();
    if seqs.is_empty() {
        return Ok(());
    }

    if slots.iter().all(|s| s.is_idle()) {
        SequenceCache::clear_sequences(engine, &seqs)?;
    } else {
        for &seq in &seqs {
            SequenceCache::reset_to_prefix(engine, seq)?;
        }
    }

    for slot in slots.iter_mut().filter(|s| s.cache_dirty()) {
        slot.mark_cache_clean();
    }
    Ok(())
}

fn log_completion(record: &ResultRecord, n_total: usize, n_cache_miss: usize) {
    info!(
        client = record.slot_id,
        seq = record.work_index,
        n_prompt = record.prompt_tokens,
        n_response = record.response_tokens,
        finish_reason = record.finish_reason.as_str(),
        "Client {:3}, seq {:3}/{:3}, prompt {:4} t, response {:4} t, time {:5.2} s, speed {:5.2} t/s, cache miss {}\n\nInput:    {}\nResponse: {}\n",
        record.slot_id,
        record.work_index,
        n_total,
        record.prompt_tokens,
        record.response_tokens,
        record.duration.as_secs_f64(),
        record.tokens_per_second(),
        n_cache_miss,
        record.prompt.trim(),
        record.response.trim()
    );
}

/// Evaluate the system prompt, then serve `prompts` to completion.
///
/// The prompt list is truncated to `config.n_sequences`.
pub fn run_parallel<E, T, S>(
    engine: &mut E,
    codec: &T,
    system_prompt: &str,
    prompts: Vec<String>,
    config: &SchedulerConfig,
    make_sampler: impl FnMut(SlotId) -> S,
) -> Result<RunReport>
where
    E: Engine + ?Sized,
    T: TextCodec + ?Sized,
    S: TokenSampler,
{
    config.validate()?;
    let prefix = evaluate_system_prefix(&mut *engine, codec, system_prompt, config.n_parallel)?;
    let queue = WorkQueue::new(prompts, config.n_sequences);
    Scheduler::new(engine, codec, &prefix, queue, config, make_sampler)?.run()
}
