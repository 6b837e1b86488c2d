//! Per-step batch metadata and the mutable collaborators of one forward pass.

use std::ops::Range;

use candle_core::Result;

use crate::layers::AttentionBackend;
use crate::ssm::MambaStateCache;

/// Layout of a flattened variable-length batch.
///
/// Tokens of all sequences are concatenated; sequence `i` occupies
/// `query_start_loc[i]..query_start_loc[i + 1]`. Only the constructors
/// build one, so the per-sequence vectors always agree in length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardBatch {
    /// Absolute position of every token.
    positions: Vec<usize>,
    /// Token offsets, `num_seqs + 1` entries, last one = total tokens.
    query_start_loc: Vec<usize>,
    /// Tokens each sequence processed in earlier steps.
    context_lens: Vec<usize>,
    /// State-cache / KV slot of each sequence.
    state_slots: Vec<usize>,
}

impl ForwardBatch {
    /// Build from per-sequence `(query_len, context_len, slot)` triples.
    pub fn new(query_lens: &[usize], context_lens: &[usize], state_slots: &[usize]) -> Result<Self> {
        if query_lens.len() != context_lens.len() || query_lens.len() != state_slots.len() {
            candle_core::bail!(
                "batch metadata length mismatch: {} query lens, {} context lens, {} slots",
                query_lens.len(),
                context_lens.len(),
                state_slots.len()
            );
        }
        if query_lens.contains(&0) {
            candle_core::bail!("every sequence in a batch must contribute at least one token");
        }
        let mut query_start_loc = Vec::with_capacity(query_lens.len() + 1);
        let mut positions = Vec::with_capacity(query_lens.iter().sum());
        query_start_loc.push(0);
        for (&len, &ctx) in query_lens.iter().zip(context_lens) {
            positions.extend(ctx..ctx + len);
            query_start_loc.push(positions.len());
        }
        Ok(Self {
            positions,
            query_start_loc,
            context_lens: context_lens.to_vec(),
            state_slots: state_slots.to_vec(),
        })
    }

    /// One sequence of `len` new tokens after `context_len` old ones.
    pub fn single(len: usize, context_len: usize, slot: usize) -> Result<Self> {
        Self::new(&[len], &[context_len], &[slot])
    }

    /// One new token for each `(context_len, slot)` pair.
    pub fn decode(seqs: &[(usize, usize)]) -> Result<Self> {
        let ones = vec![1; seqs.len()];
        let contexts: Vec<usize> = seqs.iter().map(|&(ctx, _)| ctx).collect();
        let slots: Vec<usize> = seqs.iter().map(|&(_, slot)| slot).collect();
        Self::new(&ones, &contexts, &slots)
    }

    pub fn num_seqs(&self) -> usize {
        self.context_lens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.positions.len()
    }

    /// Absolute position of every token, in batch order.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn query_start_loc(&self) -> &[usize] {
        &self.query_start_loc
    }

    pub fn context_len(&self, seq: usize) -> usize {
        self.context_lens[seq]
    }

    pub fn state_slot(&self, seq: usize) -> usize {
        self.state_slots[seq]
    }

    /// Slot of every sequence, in batch order.
    pub fn state_slots(&self) -> &[usize] {
        &self.state_slots
    }

    pub fn seq_range(&self, seq: usize) -> Range<usize> {
        self.query_start_loc[seq]..self.query_start_loc[seq + 1]
    }

    pub fn query_len(&self, seq: usize) -> usize {
        self.query_start_loc[seq + 1] - self.query_start_loc[seq]
    }

    /// Whether the sequence continues from state written by an earlier step.
    pub fn has_initial_state(&self, seq: usize) -> bool {
        self.context_lens[seq] > 0
    }

    /// Every sequence adds exactly one token on top of prior context.
    pub fn is_decode(&self) -> bool {
        (0..self.num_seqs()).all(|s| self.query_len(s) == 1 && self.has_initial_state(s))
    }
}

/// Mutable collaborators borrowed for the duration of one forward call.
pub struct ForwardContext<'a> {
    pub batch: &'a ForwardBatch,
    pub attention: &'a mut dyn AttentionBackend,
    pub mamba_cache: &'a mut MambaStateCache,
}

impl<'a> ForwardContext<'a> {
    pub fn new(
        batch: &'a ForwardBatch,
        attention: &'a mut dyn AttentionBackend,
        mamba_cache: &'a mut MambaStateCache,
    ) -> Self {
        Self {
            batch,
            attention,
            mamba_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlen_layout() {
        let batch = ForwardBatch::new(&[3, 1, 2], &[0, 5, 2], &[4, 0, 7]).unwrap();
        assert_eq!(batch.query_start_loc(), &[0, 3, 4, 6]);
        assert_eq!(batch.positions(), &[0, 1, 2, 5, 2, 3]);
        assert_eq!(batch.state_slots(), &[4, 0, 7]);
        assert_eq!(batch.context_len(1), 5);
        assert_eq!(batch.state_slot(2), 7);
        assert_eq!(batch.num_tokens(), 6);
        assert_eq!(batch.seq_range(2), 4..6);
        assert!(!batch.has_initial_state(0));
        assert!(batch.has_initial_state(2));
        assert!(!batch.is_decode());
    }

    #[test]
    fn decode_batch_detection() {
        let batch = ForwardBatch::decode(&[(4, 1), (9, 0)]).unwrap();
        assert!(batch.is_decode());
        assert_eq!(batch.positions(), &[4, 9]);

        // a one-token prompt has no prior context, so it is not a decode step
        let cold = ForwardBatch::single(1, 0, 0).unwrap();
        assert!(!cold.is_decode());
    }

    #[test]
    fn rejects_inconsistent_metadata() {
        assert!(ForwardBatch::new(&[1, 2], &[0], &[0, 1]).is_err());
        assert!(ForwardBatch::new(&[0], &[0], &[0]).is_err());
    }
}
