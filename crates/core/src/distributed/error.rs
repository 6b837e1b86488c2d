//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Tensor shape mismatch for a collective or point-to-point operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A dimension cannot be split evenly across the group.
    #[error("dimension of size {size} cannot be split across {world_size} ranks")]
    Indivisible { size: usize, world_size: usize },

    /// A receive found nothing queued on the channel.
    #[error("no pending message from rank {src} to rank {dst}")]
    ChannelEmpty { src: usize, dst: usize },

    /// The communicator cannot perform this operation.
    #[error("{op} is not supported by {communicator}")]
    Unsupported {
        op: &'static str,
        communicator: &'static str,
    },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

impl From<DistributedError> for candle_core::Error {
    fn from(err: DistributedError) -> Self {
        match err {
            DistributedError::TensorError(inner) => inner,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
