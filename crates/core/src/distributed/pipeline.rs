//! Pipeline parallelism: contiguous layer ranges per stage.
//!
//! ```text
//! Stage 0                  Stage 1
//! ┌──────────────┐         ┌──────────────┐
//! │ embed        │         │              │
//! │ layers 0..4  │ ──────> │ layers 4..8  │
//! │              │ (h, r)  │ final norm   │
//! └──────────────┘         └──────────────┘
//! ```
//!
//! The residual stream crosses a stage boundary as an explicit
//! [`IntermediateTensors`] message carrying both the activation and the
//! running residual.

use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::communicator::DeviceCommunicator;
use super::error::{DistributedError, Result};

/// Pipeline stage configuration.
#[derive(Debug, Clone)]
pub struct PipelineStageConfig {
    /// Index of this stage (0..num_stages)
    pub stage_id: usize,
    /// Total number of pipeline stages
    pub num_stages: usize,
    /// First layer index for this stage
    pub first_layer: usize,
    /// Number of layers in this stage
    pub num_layers: usize,
    /// Whether this is the first stage (embeds tokens)
    pub is_first: bool,
    /// Whether this is the last stage (final norm, logits)
    pub is_last: bool,
}

impl PipelineStageConfig {
    /// Create configuration for a pipeline stage.
    ///
    /// # Panics
    /// Panics on an out-of-range stage or fewer layers than stages; callers
    /// validate the runtime config first.
    pub fn new(stage_id: usize, num_stages: usize, total_layers: usize) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(stage_id < num_stages, "stage_id must be < num_stages");
        assert!(
            total_layers >= num_stages,
            "total_layers must be >= num_stages"
        );

        let base_layers = total_layers / num_stages;
        let extra = total_layers % num_stages;

        // Earlier stages get extra layers if not evenly divisible
        let num_layers = if stage_id < extra {
            base_layers + 1
        } else {
            base_layers
        };

        let first_layer = if stage_id < extra {
            stage_id * (base_layers + 1)
        } else {
            extra * (base_layers + 1) + (stage_id - extra) * base_layers
        };

        Self {
            stage_id,
            num_stages,
            first_layer,
            num_layers,
            is_first: stage_id == 0,
            is_last: stage_id == num_stages - 1,
        }
    }

    /// The whole stack on one stage.
    pub fn single(total_layers: usize) -> Self {
        Self::new(0, 1, total_layers)
    }

    /// Get layer indices for this stage.
    pub fn layer_range(&self) -> std::ops::Range<usize> {
        self.first_layer..self.first_layer + self.num_layers
    }

    pub fn owns_layer(&self, layer_idx: usize) -> bool {
        self.layer_range().contains(&layer_idx)
    }
}

/// Residual-stream pair handed from one stage to the next.
#[derive(Debug, Clone)]
pub struct IntermediateTensors {
    /// Activation leaving the last local layer: [num_tokens, hidden]
    pub hidden_states: Tensor,
    /// Running residual: [num_tokens, hidden]
    pub residual: Tensor,
}

impl IntermediateTensors {
    pub fn new(hidden_states: Tensor, residual: Tensor) -> Result<Self> {
        if hidden_states.dims() != residual.dims() {
            return Err(DistributedError::ShapeMismatch {
                expected: hidden_states.dims().to_vec(),
                actual: residual.dims().to_vec(),
            });
        }
        Ok(Self {
            hidden_states,
            residual,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.hidden_states.dims().first().copied().unwrap_or(0)
    }
}

/// Point-to-point transport between adjacent stages.
pub struct PipelineCommunicator {
    comm: Arc<dyn DeviceCommunicator>,
    stage_config: PipelineStageConfig,
}

impl PipelineCommunicator {
    pub fn new(comm: Arc<dyn DeviceCommunicator>, stage_config: PipelineStageConfig) -> Self {
        Self { comm, stage_config }
    }

    /// Send the residual-stream pair to the next stage.
    ///
    /// The activation is sent first, then the residual.
    pub fn send_intermediate(&self, tensors: &IntermediateTensors) -> Result<()> {
        if self.stage_config.is_last {
            return Err(DistributedError::InvalidRank {
                rank: self.stage_config.stage_id + 1,
                world_size: self.stage_config.num_stages,
            });
        }
        let next = self.stage_config.stage_id + 1;
        self.comm.send(&tensors.hidden_states, next)?;
        self.comm.send(&tensors.residual, next)?;
        tracing::debug!(
            stage = self.stage_config.stage_id,
            num_tokens = tensors.num_tokens(),
            "sent intermediate tensors"
        );
        Ok(())
    }

    /// Receive the residual-stream pair from the previous stage.
    pub fn recv_intermediate(
        &self,
        num_tokens: usize,
        hidden_size: usize,
        dtype: DType,
    ) -> Result<IntermediateTensors> {
        if self.stage_config.is_first {
            return Err(DistributedError::InvalidRank {
                rank: 0,
                world_size: self.stage_config.num_stages,
            });
        }
        let prev = self.stage_config.stage_id - 1;
        let shape = [num_tokens, hidden_size];
        let hidden_states = self.comm.recv(&shape, dtype, prev)?;
        let residual = self.comm.recv(&shape, dtype, prev)?;
        IntermediateTensors::new(hidden_states, residual)
    }

    pub fn stage_config(&self) -> &PipelineStageConfig {
        &self.stage_config
    }
}
