use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// RMSNorm layer.
///
/// Besides the plain `Module` forward it offers the fused residual form
/// used by pre-norm decoder layers: the residual add happens inside the
/// normalization step.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// `residual' = xs + residual`, returns `(rms_norm(residual'), residual')`.
    pub fn forward_residual(&self, xs: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let residual = (xs + residual)?;
        let normed = self.forward(&residual)?;
        Ok((normed, residual))
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&xs.contiguous()?, &self.weight, self.eps as f32)
    }
}

/// Create an RMSNorm layer, loading the weight from a VarBuilder.
pub fn rms_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb.get(size, "weight")?;
    Ok(RmsNorm::new(weight, eps))
}

/// RMSNorm over the last dim of `[tokens, heads, head_dim]` with a separate
/// learned scale per head (weight `[heads, head_dim]`).
#[derive(Clone, Debug)]
pub struct PerHeadRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl PerHeadRmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn load(num_heads: usize, head_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((num_heads, head_dim), "weight")?;
        Ok(Self::new(weight, eps))
    }
}

impl Module for PerHeadRmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let x = xs.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&variance.affine(1.0, self.eps)?.sqrt()?)?;
        let weight = self.weight.to_dtype(DType::F32)?.unsqueeze(0)?;
        x.broadcast_mul(&weight)?.to_dtype(dtype)
    }
}
