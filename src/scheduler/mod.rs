//! Continuous-batching scheduler.
//!
//! This module handles:
//! - Batch assembly for generating clients
//! - FIFO admission of queued prompts into idle slots
//! - Chunked decoding with adaptive retry on cache exhaustion
//! - Per-token stop detection and client retirement

pub mod admission;
pub mod assembler;
pub mod decode;
pub mod runner;
pub mod stop;

pub use admission::{AdmissionController, WorkItem, WorkQueue};
pub use assembler::assemble_generation;
pub use decode::{AdaptiveDecoder, DecodeEvent, DecodeReport};
pub use runner::{run_parallel, RunReport, Scheduler};
pub use stop::{FinishReason, StopCriteria};
