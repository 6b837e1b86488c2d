//! Distributed execution: tensor and pipeline parallelism.
//!
//! - [`ProcessGroup`] - rank and world size of a worker group
//! - [`DeviceCommunicator`] - collectives and point-to-point transfers
//! - [`ShardPolicy`] - how a full checkpoint tensor maps onto one rank
//! - [`ColumnParallelLinear`] / [`RowParallelLinear`] - sharded affine maps
//! - [`PipelineStageConfig`] / [`IntermediateTensors`] - stage layer ranges
//!   and the residual-stream message between stages
//!
//! With a single worker every collective is an identity, so the same model
//! code runs unchanged on one device.
//!
//! ```ignore
//! use plamo2_core::distributed::{LocalProcessGroup, ProcessGroup};
//!
//! let pg = LocalProcessGroup::new();
//! assert_eq!(pg.world_size(), 1);
//! ```

mod communicator;
mod error;
mod parallel_layers;
mod pipeline;
mod process_group;
mod shard;

pub use communicator::{
    DeviceCommunicator, LoopbackCommunicator, LoopbackFabric, MockCommunicator, ReduceOp,
};
pub use error::DistributedError;
pub use parallel_layers::{
    ColumnParallelLinear, ParallelLmHead, RowParallelLinear, VocabParallelEmbedding,
};
pub use pipeline::{IntermediateTensors, PipelineCommunicator, PipelineStageConfig};
pub use process_group::{LocalProcessGroup, ParallelConfig, ProcessGroup};
pub use shard::{kv_head_partition, padded_vocab_size, ShardPolicy, VOCAB_PADDING};
