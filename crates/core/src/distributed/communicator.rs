//! Device communicator for collective and point-to-point operations.
//!
//! Tensor-parallel layers use `all_reduce`/`all_gather`; pipeline stages use
//! `send`/`recv` to hand the residual stream to the next stage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise maximum.
    Max,
}

/// Trait for device-to-device communication.
///
/// Implementations can use a real transport for multi-worker execution, or be
/// no-ops for a single worker.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: concatenate every rank's tensor along `gather_dim`.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Point-to-point send.
    fn send(&self, tensor: &Tensor, dst_rank: usize) -> Result<()>;

    /// Point-to-point receive of a tensor with a known shape.
    fn recv(&self, shape: &[usize], dtype: DType, src_rank: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Mock communicator for single-worker execution.
///
/// Collectives are identities when the group has one rank; with a simulated
/// larger group `all_gather` repeats the local shard so shapes can be checked.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl MockCommunicator<LocalProcessGroup> {
    /// Communicator for a group of one.
    pub fn single() -> Self {
        Self::new(LocalProcessGroup::new())
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let world_size = self.process_group.world_size();
        let tensors: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn send(&self, _tensor: &Tensor, _dst_rank: usize) -> Result<()> {
        Ok(())
    }

    fn recv(&self, shape: &[usize], dtype: DType, _src_rank: usize) -> Result<Tensor> {
        Ok(Tensor::zeros(shape, dtype, &candle_core::Device::Cpu)?)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

type Channels = HashMap<(usize, usize), VecDeque<Tensor>>;

/// In-process point-to-point fabric shared by the ranks of one pipeline.
///
/// Each `(src, dst)` pair is a FIFO queue. Used to run several pipeline
/// stages inside one process (tests, single-host debugging).
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    channels: Arc<Mutex<Channels>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Communicator endpoint for `rank` in a group of `world_size`.
    pub fn endpoint(&self, rank: usize, world_size: usize) -> LoopbackCommunicator {
        LoopbackCommunicator {
            process_group: LocalProcessGroup::with_rank(rank, world_size),
            channels: Arc::clone(&self.channels),
        }
    }

    /// Number of messages sent but not yet received.
    pub fn pending(&self) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels.values().map(VecDeque::len).sum()
    }
}

/// Point-to-point communicator backed by a [`LoopbackFabric`].
///
/// Collectives are not available: this endpoint belongs to a pipeline
/// group, not a tensor-parallel group.
pub struct LoopbackCommunicator {
    process_group: LocalProcessGroup,
    channels: Arc<Mutex<Channels>>,
}

impl DeviceCommunicator for LoopbackCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, _tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Err(DistributedError::Unsupported {
            op: "all_reduce",
            communicator: "LoopbackCommunicator",
        })
    }

    fn all_gather(&self, _tensor: &Tensor, _gather_dim: usize) -> Result<Tensor> {
        Err(DistributedError::Unsupported {
            op: "all_gather",
            communicator: "LoopbackCommunicator",
        })
    }

    fn send(&self, tensor: &Tensor, dst_rank: usize) -> Result<()> {
        let world_size = self.process_group.world_size();
        if dst_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: dst_rank,
                world_size,
            });
        }
        let src = self.process_group.rank();
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry((src, dst_rank))
            .or_default()
            .push_back(tensor.clone());
        Ok(())
    }

    fn recv(&self, shape: &[usize], dtype: DType, src_rank: usize) -> Result<Tensor> {
        let dst = self.process_group.rank();
        let tensor = {
            let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            channels
                .get_mut(&(src_rank, dst))
                .and_then(VecDeque::pop_front)
                .ok_or(DistributedError::ChannelEmpty { src: src_rank, dst })?
        };
        if tensor.dims() != shape {
            return Err(DistributedError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(tensor.to_dtype(dtype)?)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
