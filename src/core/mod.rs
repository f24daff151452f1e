//! Core data structures for nano-parallel.
//!
//! This module contains:
//! - Batch and BatchView for packing per-tick token work
//! - ClientSlot for per-client state
//! - SequenceCache and SystemPrefix for per-sequence cache lifecycle

pub mod batch;
pub mod cache;
pub mod slot;

pub use batch::{Batch, BatchEntry, BatchView};
pub use cache::{evaluate_system_prefix, SequenceCache, SystemPrefix};
pub use slot::{ClientSlot, SlotId, SlotState};
