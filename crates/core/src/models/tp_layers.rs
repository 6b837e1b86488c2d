//! Tensor-parallel context shared by every layer of one worker.
//!
//! Layers read already-sharded weights, so the context only has to answer
//! "how many ranks, which one am I, how do I talk to the others".

use std::sync::Arc;

use candle_core::Result;

use crate::distributed::{
    kv_head_partition, DeviceCommunicator, LocalProcessGroup, MockCommunicator,
};

/// Context for tensor parallelism.
#[derive(Clone)]
pub struct TpContext {
    /// Communicator for collective operations (all_reduce, all_gather)
    pub communicator: Arc<dyn DeviceCommunicator>,
    /// Total number of workers in the TP group
    pub world_size: usize,
    /// This worker's rank in the TP group
    pub rank: usize,
}

impl TpContext {
    /// Create TP context from a communicator.
    pub fn new(communicator: Arc<dyn DeviceCommunicator>) -> Self {
        let pg = communicator.process_group();
        let world_size = pg.world_size();
        let rank = pg.rank();
        Self {
            communicator,
            world_size,
            rank,
        }
    }

    /// Single-worker context; all collectives are identities.
    pub fn single_gpu() -> Self {
        Self::new(Arc::new(MockCommunicator::single()))
    }

    /// Simulated member of a larger group (collectives are mocked).
    pub fn mock_multi_gpu(rank: usize, world_size: usize) -> Self {
        let pg = LocalProcessGroup::with_rank(rank, world_size);
        Self::new(Arc::new(MockCommunicator::new(pg)))
    }

    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    /// Local share of a dimension that is split evenly across the group.
    pub fn local(&self, total: usize) -> Result<usize> {
        if total % self.world_size != 0 {
            candle_core::bail!(
                "dimension {total} must be divisible by tensor parallel size {}",
                self.world_size
            );
        }
        Ok(total / self.world_size)
    }

    /// KV heads held by this rank (replicated when fewer heads than ranks).
    pub fn local_kv_heads(&self, num_kv_heads: usize) -> usize {
        kv_head_partition(num_kv_heads, self.rank, self.world_size).1
    }

    pub fn comm(&self) -> Arc<dyn DeviceCommunicator> {
        Arc::clone(&self.communicator)
    }
}
