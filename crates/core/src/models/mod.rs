pub mod plamo2;
pub mod tp_layers;

use thiserror::Error;

use crate::config::ConfigError;
use crate::loader::CheckpointError;

pub use plamo2::{Plamo2ForCausalLM, StageOutput};
pub use tp_layers::TpContext;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error(
        "tensor-parallel context is rank {rank} of {size}, runtime config says \
         rank {runtime_rank} of {runtime_size}"
    )]
    TensorParallelMismatch {
        runtime_rank: usize,
        runtime_size: usize,
        rank: usize,
        size: usize,
    },
    #[error("model load error: {0}")]
    Load(#[from] candle_core::Error),
}
