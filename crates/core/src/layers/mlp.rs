use std::sync::Arc;

use candle_core::{Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::distributed::{ColumnParallelLinear, DeviceCommunicator, RowParallelLinear};

/// SwiGLU MLP with a merged gate/up projection.
///
/// `gate_up_proj` produces `[gate | up]` (each `intermediate / tp` wide on
/// this worker); output is `down_proj(silu(gate) * up)`.
pub struct SwiGluMlp {
    gate_up_proj: ColumnParallelLinear,
    down_proj: RowParallelLinear,
    intermediate_local: usize,
}

impl SwiGluMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_local: usize,
        vb: VarBuilder,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        let gate_up_proj = ColumnParallelLinear::load(
            hidden_size,
            2 * intermediate_local,
            false,
            false,
            vb.pp("gate_up_proj"),
            Arc::clone(&comm),
        )?;
        let down_proj = RowParallelLinear::load(
            intermediate_local,
            hidden_size,
            false,
            vb.pp("down_proj"),
            comm,
        )?;
        Ok(Self {
            gate_up_proj,
            down_proj,
            intermediate_local,
        })
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(xs)?;
        let gate = gate_up.narrow(D::Minus1, 0, self.intermediate_local)?;
        let up = gate_up.narrow(D::Minus1, self.intermediate_local, self.intermediate_local)?;
        let hidden = (candle_nn::ops::silu(&gate)? * up)?;
        self.down_proj.forward(&hidden)
    }
}
