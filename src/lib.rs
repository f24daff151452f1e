//! nano-parallel: a continuous-batching multi-client inference scheduler.
//!
//! Many simulated clients, each with its own prompt and output stream, share
//! one autoregressive engine:
//! - A fixed pool of client slots, reused for the whole run
//! - Continuous batching: prompt ingestion and generation in the same batch
//! - A system prefix decoded once and copied into every client sequence
//! - Chunked decoding that halves the chunk size when the cache is exhausted

pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod metrics;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{EngineConfig, RunConfig, SamplingConfig, SchedulerConfig, DEFAULT_SYSTEM_PROMPT};
pub use core::{evaluate_system_prefix, Batch, ClientSlot, SlotState, SystemPrefix};
pub use engine::{
    CacheRange, CandleEngine, DecodeStatus, Engine, HfTokenizer, Sampler, SeqId, TextCodec,
    TokenId, TokenSampler,
};
pub use error::{Error, Result};
pub use metrics::{Aggregator, ResultRecord, RunSummary};
pub use scheduler::{run_parallel, FinishReason, RunReport, Scheduler, StopCriteria, WorkQueue};
