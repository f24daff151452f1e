//! Integration tests for per-sequence cache lifecycle.

mod common;

use common::{
    config, prompts, three_words, FakeCodec, FakeEngine, Op, ScriptedSampler, N_SYSTEM, NEWLINE,
    SYSTEM, WORD,
};
use nano_parallel::core::cache::{evaluate_system_prefix, SequenceCache};
use nano_parallel::core::SlotState;
use nano_parallel::scheduler::{run_parallel, Scheduler, WorkQueue};
use nano_parallel::Error;

fn clear(seqs: &[u32]) -> Vec<Op> {
    seqs.iter()
        .flat_map(|&seq| [Op::Remove { seq }, Op::Copy { src: 0, dst: seq }])
        .collect()
}

fn decode(n_tokens: usize) -> Op {
    Op::Decode { n_tokens, code: 0 }
}

#[test]
fn test_prefix_is_decoded_once_and_forked() {
    let mut engine = FakeEngine::new();
    let prefix = evaluate_system_prefix(&mut engine, &FakeCodec, SYSTEM, 3).unwrap();

    assert_eq!(prefix.len(), N_SYSTEM);
    assert_eq!(prefix.tokens()[0], common::BOS);
    assert_eq!(
        engine.ops,
        vec![
            decode(N_SYSTEM),
            Op::Copy { src: 0, dst: 1 },
            Op::Copy { src: 0, dst: 2 },
            Op::Copy { src: 0, dst: 3 },
        ]
    );
    assert_eq!(engine.cache_len(3), N_SYSTEM);
}

#[test]
fn test_empty_system_prompt_decodes_nothing() {
    let mut engine = FakeEngine::new();
    let prefix = evaluate_system_prefix(&mut engine, &FakeCodec, "", 2).unwrap();

    assert!(prefix.is_empty());
    assert!(engine.ops.is_empty());
}

#[test]
fn test_reset_refuses_system_sequence() {
    let mut engine = FakeEngine::new();
    assert!(SequenceCache::reset_to_prefix(&mut engine, 0).is_err());
    assert!(engine.ops.is_empty());
}

#[test]
fn test_bulk_clear_when_pool_drains_at_once() {
    let mut engine = FakeEngine::new();
    run_parallel(&mut engine, &FakeCodec, SYSTEM, prompts(4), &config(2), |_| {
        ScriptedSampler::new(three_words())
    })
    .unwrap();

    let mut expected = vec![
        decode(N_SYSTEM),
        Op::Copy { src: 0, dst: 1 },
        Op::Copy { src: 0, dst: 2 },
        // first pair: ingest, then three generation ticks
        decode(4),
        decode(2),
        decode(2),
        decode(2),
    ];
    // both clients retired in the same tick: one reset per client sequence
    expected.extend(clear(&[1, 2]));
    expected.extend([decode(4), decode(2), decode(2), decode(2)]);
    expected.extend(clear(&[1, 2]));

    assert_eq!(engine.ops, expected);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_single_slot_reset_at_retirement() {
    let mut engine = FakeEngine::new();
    run_parallel(&mut engine, &FakeCodec, SYSTEM, prompts(3), &config(2), |slot| {
        if slot == 0 {
            ScriptedSampler::new(three_words())
        } else {
            ScriptedSampler::new(vec![WORD, WORD, WORD, WORD, WORD, NEWLINE])
        }
    })
    .unwrap();

    // Client 0 retires while client 1 is still generating: only its own
    // sequence is reset, before the decode that ingests its next prompt.
    let window = [
        decode(2),
        Op::Remove { seq: 1 },
        Op::Copy { src: 0, dst: 1 },
        decode(3),
    ];
    assert!(engine.ops.windows(4).any(|w| w == &window[..]));

    // Client 1 is reset once, when it retires; the last client by the final clear
    let removes_2 = engine
        .ops
        .iter()
        .filter(|op| **op == Op::Remove { seq: 2 })
        .count();
    assert_eq!(removes_2, 1);
    assert!(engine.ops.ends_with(&clear(&[1])));
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_retired_cache_is_back_to_prefix_while_peer_generates() {
    let mut engine = FakeEngine::new();
    let config = config(2);
    let prefix = evaluate_system_prefix(&mut engine, &FakeCodec, SYSTEM, 2).unwrap();
    let queue = WorkQueue::new(prompts(2), config.n_sequences);

    let mut scheduler = Scheduler::new(&mut engine, &FakeCodec, &prefix, queue, &config, |slot| {
        if slot == 0 {
            ScriptedSampler::new(three_words())
        } else {
            ScriptedSampler::new(vec![WORD, WORD, WORD, WORD, WORD, NEWLINE])
        }
    })
    .unwrap();

    // ingest, then three generation ticks; client 0 retires in the last one
    for _ in 0..4 {
        assert!(scheduler.tick().unwrap());
    }

    assert!(scheduler.slots()[0].is_idle());
    assert_eq!(scheduler.slots()[1].state(), SlotState::Generating);
    assert_eq!(scheduler.engine().cache_len(1), N_SYSTEM);
    assert_eq!(scheduler.engine().cache_len(2), N_SYSTEM + 2 + 3);
}

#[test]
fn test_retired_cells_are_free_for_remaining_client() {
    // Client 1 needs 11 cells of its own on top of the 4 prefix cells; that
    // only fits if client 0's 5 cells are released when it retires.
    let mut engine = FakeEngine::new().with_cell_limit(16);
    let config = config(2).cont_batching(false);

    let report = run_parallel(&mut engine, &FakeCodec, SYSTEM, prompts(2), &config, |slot| {
        if slot == 0 {
            ScriptedSampler::new(three_words())
        } else {
            let mut script = vec![WORD; 9];
            script.push(NEWLINE);
            ScriptedSampler::new(script)
        }
    })
    .unwrap();

    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[1].response_tokens, 9);
    assert_eq!(report.summary.n_cache_miss, 0);
    assert!(engine.peak_cells <= 16, "peak {}", engine.peak_cells);
    assert!(engine.violations.is_empty(), "{:?}", engine.violations);
}

#[test]
fn test_refused_removal_is_an_error() {
    let mut engine = FakeEngine::new().refusing_removes();

    let err = SequenceCache::reset_to_prefix(&mut engine, 1).unwrap_err();

    assert!(matches!(err, Error::CacheRemove(1)));
    // The prefix is not copied over the stale state
    assert_eq!(engine.ops, vec![Op::Remove { seq: 1 }]);
}
