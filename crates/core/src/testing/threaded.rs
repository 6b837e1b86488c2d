//! Tensor-parallel group whose ranks are threads of one process.
//!
//! Unlike [`MockCommunicator`](crate::distributed::MockCommunicator), the
//! collectives exchange real buffers: `all_reduce` combines every rank's
//! tensor and `all_gather` concatenates them in rank order. Every rank must
//! issue the same sequence of collectives or the group deadlocks.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{DType, Tensor};

use crate::distributed::{
    DeviceCommunicator, DistributedError, LocalProcessGroup, ProcessGroup, ReduceOp,
};
use crate::models::TpContext;

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// Shared rendezvous for `world_size` rank threads.
#[derive(Clone)]
pub struct ThreadedGroup {
    world_size: usize,
    shared: Arc<Shared>,
}

impl ThreadedGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            shared: Arc::new(Shared {
                barrier: Barrier::new(world_size),
                slots: Mutex::new(vec![None; world_size]),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn communicator(&self, rank: usize) -> ThreadedCommunicator {
        ThreadedCommunicator {
            process_group: LocalProcessGroup::with_rank(rank, self.world_size),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Tensor-parallel context for the thread that plays `rank`.
    pub fn tp_context(&self, rank: usize) -> TpContext {
        TpContext::new(Arc::new(self.communicator(rank)))
    }
}

/// One rank's endpoint in a [`ThreadedGroup`].
pub struct ThreadedCommunicator {
    process_group: LocalProcessGroup,
    shared: Arc<Shared>,
}

impl ThreadedCommunicator {
    /// Publish `tensor`, then collect every rank's contribution.
    fn exchange(&self, tensor: &Tensor) -> Result<Vec<Tensor>, DistributedError> {
        let rank = self.process_group.rank();
        {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots[rank] = Some(tensor.clone());
        }
        self.shared.barrier.wait();
        let parts = {
            let slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .iter()
                .enumerate()
                .map(|(src, slot)| {
                    slot.clone()
                        .ok_or(DistributedError::ChannelEmpty { src, dst: rank })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        // nobody may overwrite a slot until every rank has read it
        self.shared.barrier.wait();
        parts
    }
}

impl DeviceCommunicator for ThreadedCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor, DistributedError> {
        let parts = self.exchange(tensor)?;
        let mut acc = parts[0].clone();
        for part in &parts[1..] {
            if part.dims() != acc.dims() {
                return Err(DistributedError::ShapeMismatch {
                    expected: acc.dims().to_vec(),
                    actual: part.dims().to_vec(),
                });
            }
            acc = match op {
                ReduceOp::Sum => (acc + part)?,
                ReduceOp::Max => acc.maximum(part)?,
            };
        }
        Ok(acc)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor, DistributedError> {
        let parts = self.exchange(tensor)?;
        Ok(Tensor::cat(&parts, gather_dim)?)
    }

    fn send(&self, _tensor: &Tensor, _dst_rank: usize) -> Result<(), DistributedError> {
        Err(DistributedError::Unsupported {
            op: "send",
            communicator: "ThreadedCommunicator",
        })
    }

    fn recv(
        &self,
        _shape: &[usize],
        _dtype: DType,
        _src_rank: usize,
    ) -> Result<Tensor, DistributedError> {
        Err(DistributedError::Unsupported {
            op: "recv",
            communicator: "ThreadedCommunicator",
        })
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn collectives_combine_every_rank() {
        let group = ThreadedGroup::new(3);
        let results: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..group.world_size())
                .map(|rank| {
                    let comm = group.communicator(rank);
                    s.spawn(move || {
                        let local =
                            Tensor::new(&[rank as f32, 10.0 * rank as f32], &Device::Cpu).unwrap();
                        let sum = comm.all_reduce(&local, ReduceOp::Sum).unwrap();
                        let max = comm.all_reduce(&local, ReduceOp::Max).unwrap();
                        let gathered = comm.all_gather(&local, 0).unwrap();
                        (
                            sum.to_vec1().unwrap(),
                            max.to_vec1().unwrap(),
                            gathered.to_vec1().unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (sum, max, gathered) in results {
            assert_eq!(sum, vec![3.0, 30.0]);
            assert_eq!(max, vec![2.0, 20.0]);
            assert_eq!(gathered, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]);
        }
    }

    #[test]
    fn point_to_point_is_unsupported() {
        let comm = ThreadedGroup::new(1).communicator(0);
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(comm.send(&t, 0).is_err());
        assert!(comm.recv(&[2], DType::F32, 0).is_err());
    }
}
