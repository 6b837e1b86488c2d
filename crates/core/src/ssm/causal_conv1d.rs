//! Causal depthwise 1D convolution for the Mamba mixer.
//!
//! Weight shape: `[d_inner, kernel_size]` (the `[d_inner, 1, K]` checkpoint
//! weight with the group dim squeezed). No bias.
//! Activations are token-major: `[tokens, d_inner]`.
//!
//! The conv row of a slot holds the last `kernel_size - 1` inputs seen by
//! that sequence, oldest first. Prefill and decode both slide the same
//! window over `[row | new inputs]`, so a sequence produces the same outputs
//! however its tokens are split across calls.

use candle_core::{Result, Tensor};

use super::state::MambaLayerState;
use crate::forward_context::ForwardBatch;

/// `out[:, t] = Σ_j padded[:, t + j] * w[:, j]` for `t in 0..len`.
///
/// * `padded`: `[d_inner, kernel_size - 1 + len]`
/// * `weight`: `[d_inner, kernel_size]`
///
/// Returns `[d_inner, len]`.
fn depthwise_window_sum(padded: &Tensor, weight: &Tensor, len: usize) -> Result<Tensor> {
    let (_, kernel_size) = weight.dims2()?;
    let mut acc: Option<Tensor> = None;
    for j in 0..kernel_size {
        let tap = padded
            .narrow(1, j, len)?
            .broadcast_mul(&weight.narrow(1, j, 1)?)?;
        acc = Some(match acc {
            Some(sum) => (sum + tap)?,
            None => tap,
        });
    }
    match acc {
        Some(out) => Ok(out),
        None => candle_core::bail!("conv1d kernel must have at least one tap"),
    }
}

/// Varlen prefill over a flattened batch.
///
/// For each sequence the window history is its conv row when it continues
/// earlier context, zeros otherwise. The row is overwritten with the last
/// `kernel_size - 1` columns of `[history | inputs]`, which keeps part of the
/// old history when the chunk is shorter than the window.
///
/// * `x`: `[tokens, d_inner]`
///
/// Returns `[tokens, d_inner]` (before activation).
pub fn causal_conv1d_prefill(
    x: &Tensor,
    weight: &Tensor,
    batch: &ForwardBatch,
    state: &mut MambaLayerState,
) -> Result<Tensor> {
    let (d_inner, kernel_size) = weight.dims2()?;
    let history_len = kernel_size - 1;
    let weight = weight.to_dtype(x.dtype())?;

    let mut outputs = Vec::with_capacity(batch.num_seqs());
    for seq in 0..batch.num_seqs() {
        let range = batch.seq_range(seq);
        let len = range.len();
        let slot = batch.state_slot(seq);

        let history = if batch.has_initial_state(seq) {
            state.conv_row(slot)?.to_dtype(x.dtype())?
        } else {
            Tensor::zeros((d_inner, history_len), x.dtype(), x.device())?
        };
        let inputs = x.narrow(0, range.start, len)?.t()?; // [d_inner, len]
        let padded = Tensor::cat(&[&history, &inputs], 1)?.contiguous()?;

        let out = depthwise_window_sum(&padded, &weight, len)?;
        outputs.push(out.t()?);

        state.set_conv_row(slot, padded.narrow(1, len, history_len)?.contiguous()?)?;
    }
    Tensor::cat(&outputs, 0)
}

/// One decode step for a batch of rows.
///
/// * `x`: `[batch, d_inner]` (one new input per row)
/// * `weight`: `[d_inner, kernel_size]`
/// * `rows`: `[batch, d_inner, kernel_size - 1]`
///
/// Returns `(out [batch, d_inner], new_rows [batch, d_inner, kernel_size - 1])`.
pub fn causal_conv1d_update(x: &Tensor, weight: &Tensor, rows: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_, kernel_size) = weight.dims2()?;
    let rows = rows.to_dtype(x.dtype())?;
    let window = Tensor::cat(&[&rows, &x.unsqueeze(2)?], 2)?; // [batch, d_inner, K]
    let out = window
        .broadcast_mul(&weight.to_dtype(x.dtype())?.unsqueeze(0)?)?
        .sum(2)?;
    let new_rows = window.narrow(2, 1, kernel_size - 1)?.contiguous()?;
    Ok((out, new_rows))
}

/// Decode over a batch where every sequence contributes one token.
/// Rows are gathered and written back by slot.
pub fn causal_conv1d_decode(
    x: &Tensor,
    weight: &Tensor,
    batch: &ForwardBatch,
    state: &mut MambaLayerState,
) -> Result<Tensor> {
    let rows = state.gather_conv(batch.state_slots())?;
    let (out, new_rows) = causal_conv1d_update(x, weight, &rows)?;
    state.scatter_conv(batch.state_slots(), &new_rows)?;
    Ok(out)
}
