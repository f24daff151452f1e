//! Batch assembly for generating clients.
//!
//! Every `Generating` slot feeds back the token it sampled last tick, one
//! entry per slot, always flagged for logits. Prompt ingestion is appended
//! afterwards by the admission controller.

use crate::core::batch::Batch;
use crate::core::slot::{ClientSlot, SlotState};
use crate::engine::TokenSampler;
use crate::error::{Error, Result};

/// Append one entry per generating slot and record each slot's batch cursor.
///
/// Returns the number of entries added. An empty result with no admissions
/// means there is no pending work.
pub fn assemble_generation<S: TokenSampler>(
    batch: &mut Batch,
    slots: &mut [ClientSlot<S>],
    n_system: usize,
) -> Result<usize> {
    let mut added = 0;

    for slot in slots
        .iter_mut()
        .filter(|s| s.state() == SlotState::Generating)
    {
        let token = slot.sampled().ok_or(Error::InvalidStateTransition {
            from: "Generating",
            to: "Generating",
        })?;
        let pos = slot.next_position(n_system);
        let cursor = batch.add(token, pos, &[slot.cache_seq_id()], true)?;
        slot.mark_fed(cursor)?;
        added += 1;
    }

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TokenId;

    struct Fixed(TokenId);

    impl TokenSampler for Fixed {
        fn sample(&mut self, _logits: &[f32]) -> Result<TokenId> {
            Ok(self.0)
        }
        fn accept(&mut self, _token: TokenId) {}
        fn reset(&mut self) {}
    }

    fn generating(slot_id: usize, token: TokenId, n_prompt: usize) -> ClientSlot<Fixed> {
        let mut slot = ClientSlot::new(slot_id, Fixed(token));
        slot.admit(slot_id, "p", vec![1; n_prompt]).unwrap();
        let t = slot.sample(&[]).unwrap();
        slot.append_output(t, "x").unwrap();
        slot
    }

    #[test]
    fn test_one_entry_per_generating_slot() {
        let mut slots = vec![
            generating(0, 11, 3),
            ClientSlot::new(1, Fixed(0)),
            generating(2, 22, 5),
        ];
        let mut batch = Batch::new(16);

        let added = assemble_generation(&mut batch, &mut slots, 10).unwrap();
        assert_eq!(added, 2);

        let entries = batch.entries();
        assert_eq!(entries[0].token, 11);
        assert_eq!(entries[0].pos, 13);
        assert_eq!(entries[0].seq_ids, vec![1]);
        assert!(entries[0].logits);
        assert_eq!(entries[1].token, 22);
        assert_eq!(entries[1].pos, 15);
        assert_eq!(entries[1].seq_ids, vec![3]);

        assert_eq!(slots[0].batch_cursor(), Some(0));
        assert_eq!(slots[1].batch_cursor(), None);
        assert_eq!(slots[2].batch_cursor(), Some(1));
        assert_eq!(slots[0].n_decoded(), 1);
    }

    #[test]
    fn test_positions_advance_each_tick() {
        let mut slots = vec![generating(0, 5, 4)];
        let mut batch = Batch::new(4);

        assemble_generation(&mut batch, &mut slots, 0).unwrap();
        assert_eq!(batch.entries()[0].pos, 4);

        batch.clear();
        assemble_generation(&mut batch, &mut slots, 0).unwrap();
        assert_eq!(batch.entries()[0].pos, 5);
    }

    #[test]
    fn test_idle_pool_yields_empty_batch() {
        let mut slots = vec![ClientSlot::new(0, Fixed(0)), ClientSlot::new(1, Fixed(0))];
        let mut batch = Batch::new(4);

        assert_eq!(assemble_generation(&mut batch, &mut slots, 0).unwrap(), 0);
        assert!(batch.is_empty());
    }
}
