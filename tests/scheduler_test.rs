//! Integration tests for the scheduling loop.

mod common;

use std::collections::HashMap;

use common::{
    config, prompts, three_words, FakeCodec, FakeEngine, ScriptedSampler, EOS, N_SYSTEM, SYSTEM,
    USER, WORD,
};
use nano_parallel::core::batch::BatchEntry;
use nano_parallel::core::cache::evaluate_system_prefix;
use nano_parallel::scheduler::{run_parallel, FinishReason, Scheduler, WorkQueue};
use nano_parallel::SchedulerConfig;

fn run(
    engine: &mut FakeEngine,
    prompts: Vec<String>,
    config: &SchedulerConfig,
    script: Vec<u32>,
) -> nano_parallel::RunReport {
    run_parallel(engine, &FakeCodec, SYSTEM, prompts, config, |_| {
        ScriptedSampler::new(script.clone())
    })
    .unwrap()
}

/// Whether a chunk mixes prompt ingestion (several entries for a sequence)
/// with generation (one entry for a sequence).
fn is_mixed(chunk: &[BatchEntry]) -> bool {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for entry in chunk {
        *counts.entry(entry.seq_ids[0]).or_default() += 1;
    }
    counts.values().any(|&n| n == 1) && counts.values().any(|&n| n > 1)
}

#[test]
fn test_token_totals_match_records() {
    let mut engine = FakeEngine::new();
    let report = run(&mut engine, prompts(5), &config(2), three_words());

    assert_eq!(report.records.len(), 5);
    let prompt_sum: usize = report.records.iter().map(|r| r.prompt_tokens).sum();
    let gen_sum: usize = report.records.iter().map(|r| r.response_tokens).sum();

    assert_eq!(report.summary.n_prompt_tokens, prompt_sum);
    assert_eq!(report.summary.n_gen_tokens, gen_sum);
    assert_eq!(prompt_sum, 10);
    assert_eq!(gen_sum, 15);
    assert_eq!(report.summary.n_items, 5);
    assert_eq!(report.n_system, N_SYSTEM);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_fifo_with_single_client() {
    let mut engine = FakeEngine::new();
    let report = run(&mut engine, prompts(3), &config(1), three_words());

    let order: Vec<_> = report.records.iter().map(|r| r.prompt.as_str()).collect();
    assert_eq!(order, vec!["p0", "p1", "p2"]);
    assert!(report.records.iter().all(|r| r.slot_id == 0));
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_reused_slot_is_independent_of_previous_client() {
    let mut engine = FakeEngine::new();
    let prompts = vec!["same".to_string(), "same".to_string()];
    let report = run(&mut engine, prompts, &config(1), three_words());

    let (a, b) = (&report.records[0], &report.records[1]);
    assert_eq!(a.response, "word word word \n");
    assert_eq!(a.response, b.response);
    assert_eq!(a.prompt_tokens, b.prompt_tokens);
    assert_eq!(a.response_tokens, b.response_tokens);
    assert_eq!(a.finish_reason, FinishReason::Newline);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_end_of_generation_respects_minimum_length() {
    let mut engine = FakeEngine::new();
    let report = run(&mut engine, prompts(1), &config(1), vec![EOS]);

    let record = &report.records[0];
    assert_eq!(record.response_tokens, 3);
    assert_eq!(record.response, "");
    assert_eq!(record.finish_reason, FinishReason::EndOfGeneration);
}

#[test]
fn test_reverse_prompt_is_stripped() {
    let mut engine = FakeEngine::new();
    let report = run(&mut engine, prompts(1), &config(1), vec![WORD, WORD, USER, WORD]);

    let record = &report.records[0];
    assert_eq!(record.response, "word word ");
    assert_eq!(record.finish_reason, FinishReason::ReversePrompt);
    assert_eq!(record.response_tokens, 3);
}

#[test]
fn test_length_budget() {
    let mut engine = FakeEngine::new();
    let config = config(1).n_predict(Some(7));
    let report = run(&mut engine, prompts(1), &config, vec![WORD]);

    let record = &report.records[0];
    assert_eq!(record.finish_reason, FinishReason::MaxTokens);
    assert_eq!(record.prompt_tokens + record.response_tokens, 7);
}

#[test]
fn test_queue_truncated_to_n_sequences() {
    let mut engine = FakeEngine::new();
    let config = config(2).n_sequences(3);
    let report = run(&mut engine, prompts(10), &config, three_words());

    assert_eq!(report.records.len(), 3);
}

#[test]
fn test_empty_queue_runs_no_ticks() {
    let mut engine = FakeEngine::new();
    let report = run(&mut engine, Vec::new(), &config(4), three_words());

    assert!(report.records.is_empty());
    assert_eq!(report.n_ticks, 0);
    // Only the system prefix was decoded
    assert_eq!(engine.decode_sizes(), vec![N_SYSTEM]);
}

#[test]
fn test_continuous_batching_mixes_ingestion_and_generation() {
    let mut engine = FakeEngine::new();
    let report = run_parallel(&mut engine, &FakeCodec, SYSTEM, prompts(3), &config(2), |slot| {
        if slot == 0 {
            ScriptedSampler::new(three_words())
        } else {
            ScriptedSampler::new(vec![WORD, WORD, WORD, WORD, WORD, common::NEWLINE])
        }
    })
    .unwrap();

    assert!(engine.chunks.iter().any(|c| is_mixed(c)));
    let order: Vec<_> = report.records.iter().map(|r| r.work_index).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_without_continuous_batching_batches_are_homogeneous() {
    let mut engine = FakeEngine::new();
    let config = config(2).cont_batching(false);
    let report = run_parallel(&mut engine, &FakeCodec, SYSTEM, prompts(3), &config, |slot| {
        if slot == 0 {
            ScriptedSampler::new(three_words())
        } else {
            ScriptedSampler::new(vec![WORD, WORD, WORD, WORD, WORD, common::NEWLINE])
        }
    })
    .unwrap();

    assert_eq!(report.records.len(), 3);
    assert!(engine.chunks.iter().all(|c| !is_mixed(c)));
    // The third prompt waits for the whole pool to drain
    assert_eq!(engine.decode_sizes(), vec![N_SYSTEM, 4, 2, 2, 2, 1, 1, 2, 1, 1, 1]);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_tick_reports_drain() {
    let mut engine = FakeEngine::new();
    let config = config(2);
    let prefix = evaluate_system_prefix(&mut engine, &FakeCodec, SYSTEM, 2).unwrap();
    let queue = WorkQueue::new(prompts(1), config.n_sequences);

    let mut scheduler = Scheduler::new(&mut engine, &FakeCodec, &prefix, queue, &config, |_| {
        ScriptedSampler::new(three_words())
    })
    .unwrap();

    let mut ticks = 0;
    while scheduler.tick().unwrap() {
        ticks += 1;
    }

    assert_eq!(ticks, 4);
    assert_eq!(scheduler.n_ticks(), 4);
    assert_eq!(scheduler.aggregator().records().len(), 1);
    assert!(scheduler.slots().iter().all(|s| s.is_idle()));
    assert!(!scheduler.tick().unwrap());
}
