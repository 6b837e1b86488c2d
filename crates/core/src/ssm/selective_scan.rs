//! Selective scan (S6) recurrence.
//!
//! ```text
//!   δ_t = softplus(dt_t + dt_bias)
//!   h_t = exp(δ_t * A) * h_{t-1} + (δ_t * x_t) ⊗ B_t
//!   y_t = (h_t · C_t) + D * x_t
//! ```
//!
//! The varlen prefill path and the batched decode path call the same
//! [`ssm_step`], so a sequence scanned in one call and one scanned token by
//! token against carried state go through identical arithmetic.
//! All recurrence math runs in F32; state rows are cast on write.

use candle_core::{DType, Result, Tensor};

use super::state::MambaLayerState;
use crate::forward_context::ForwardBatch;

/// Per-layer scan parameters.
///
/// * `a`: `[d_inner, d_state]`, already `-exp(A_log)`
/// * `d`: `[d_inner]`
/// * `dt_bias`: `[d_inner]` (per-head bias broadcast over head channels)
pub struct ScanParams<'a> {
    pub a: &'a Tensor,
    pub d: &'a Tensor,
    pub dt_bias: &'a Tensor,
}

/// Token-major scan inputs for a flattened batch.
///
/// * `x`, `dt`: `[tokens, d_inner]` (`dt` before bias and softplus)
/// * `b`, `c`: `[tokens, d_state]`
pub struct ScanInputs<'a> {
    pub x: &'a Tensor,
    pub dt: &'a Tensor,
    pub b: &'a Tensor,
    pub c: &'a Tensor,
}

/// `softplus(x) = max(x, 0) + ln(1 + exp(-|x|))`, finite for large `|x|`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// One recurrence step for a batch of independent states.
///
/// * `h`: `[batch, d_inner, d_state]`
/// * `x`, `dt`: `[batch, d_inner]`
/// * `b`, `c`: `[batch, d_state]`
///
/// Returns `(y [batch, d_inner], h' [batch, d_inner, d_state])`.
pub fn ssm_step(
    h: &Tensor,
    x: &Tensor,
    dt: &Tensor,
    b: &Tensor,
    c: &Tensor,
    params: &ScanParams<'_>,
) -> Result<(Tensor, Tensor)> {
    let delta = softplus(&dt.broadcast_add(&params.dt_bias.unsqueeze(0)?)?)?;
    let decay = delta
        .unsqueeze(2)?
        .broadcast_mul(&params.a.unsqueeze(0)?)?
        .exp()?;
    let inject = (&delta * x)?.unsqueeze(2)?.broadcast_mul(&b.unsqueeze(1)?)?;
    let h = ((decay * h)? + inject)?;
    let y = h.broadcast_mul(&c.unsqueeze(1)?)?.sum(2)?;
    let y = (y + x.broadcast_mul(&params.d.unsqueeze(0)?)?)?;
    Ok((y, h))
}

/// F32 copies of [`ScanParams`] for the duration of one scan call.
struct ScanParamsF32 {
    a: Tensor,
    d: Tensor,
    dt_bias: Tensor,
}

impl ScanParamsF32 {
    fn new(params: &ScanParams<'_>) -> Result<Self> {
        Ok(Self {
            a: params.a.to_dtype(DType::F32)?,
            d: params.d.to_dtype(DType::F32)?,
            dt_bias: params.dt_bias.to_dtype(DType::F32)?,
        })
    }

    fn view(&self) -> ScanParams<'_> {
        ScanParams {
            a: &self.a,
            d: &self.d,
            dt_bias: &self.dt_bias,
        }
    }
}

/// Varlen prefill scan.
///
/// Each sequence starts from its SSM row when it continues earlier context,
/// zeros otherwise; the final state is written back to the row.
///
/// Returns `y` as `[tokens, d_inner]` in the dtype of `inputs.x`.
pub fn selective_scan_prefill(
    inputs: &ScanInputs<'_>,
    params: &ScanParams<'_>,
    batch: &ForwardBatch,
    state: &mut MambaLayerState,
) -> Result<Tensor> {
    let out_dtype = inputs.x.dtype();
    let (_, d_inner) = inputs.x.dims2()?;
    let (_, d_state) = params.a.dims2()?;
    let params_f32 = ScanParamsF32::new(params)?;
    let params = params_f32.view();
    let x = inputs.x.to_dtype(DType::F32)?;
    let dt = inputs.dt.to_dtype(DType::F32)?;
    let b = inputs.b.to_dtype(DType::F32)?;
    let c = inputs.c.to_dtype(DType::F32)?;

    let mut outputs = Vec::with_capacity(inputs.x.dim(0)?);
    for seq in 0..batch.num_seqs() {
        let range = batch.seq_range(seq);
        let slot = batch.state_slot(seq);
        let mut h = if batch.has_initial_state(seq) {
            state.ssm_row(slot)?.to_dtype(DType::F32)?.unsqueeze(0)?
        } else {
            Tensor::zeros((1, d_inner, d_state), DType::F32, x.device())?
        };
        for t in range {
            let (y, next) = ssm_step(
                &h,
                &x.narrow(0, t, 1)?,
                &dt.narrow(0, t, 1)?,
                &b.narrow(0, t, 1)?,
                &c.narrow(0, t, 1)?,
                &params,
            )?;
            outputs.push(y);
            h = next;
        }
        state.set_ssm_row(slot, h.squeeze(0)?)?;
    }
    Tensor::cat(&outputs, 0)?.to_dtype(out_dtype)
}

/// Batched decode scan: one token per sequence, rows gathered and written
/// back by slot.
pub fn selective_scan_decode(
    inputs: &ScanInputs<'_>,
    params: &ScanParams<'_>,
    batch: &ForwardBatch,
    state: &mut MambaLayerState,
) -> Result<Tensor> {
    let out_dtype = inputs.x.dtype();
    let params_f32 = ScanParamsF32::new(params)?;
    let params = params_f32.view();
    let h = state.gather_ssm(batch.state_slots())?.to_dtype(DType::F32)?;
    let (y, h) = ssm_step(
        &h,
        &inputs.x.to_dtype(DType::F32)?,
        &inputs.dt.to_dtype(DType::F32)?,
        &inputs.b.to_dtype(DType::F32)?,
        &inputs.c.to_dtype(DType::F32)?,
        &params,
    )?;
    state.scatter_ssm(batch.state_slots(), &h)?;
    y.to_dtype(out_dtype)
}
