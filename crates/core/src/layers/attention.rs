use std::collections::HashMap;

use candle_core::{Result, Tensor};

use super::mask::causal_mask;
use crate::forward_context::ForwardBatch;

/// Attention primitive consumed by attention layers.
///
/// Implementations own key/value history. `q` is `[tokens, heads, head_dim]`,
/// `k`/`v` are `[tokens, kv_heads, head_dim]` for the flattened batch; the
/// result is `[tokens, heads * head_dim]`.
pub trait AttentionBackend: Send {
    fn attend(
        &mut self,
        layer_idx: usize,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &ForwardBatch,
    ) -> Result<Tensor>;
}

/// Reference backend: contiguous per-(layer, slot) KV history and dense
/// scaled dot-product attention with a causal mask.
pub struct SlotKvAttention {
    num_heads: usize,
    num_kv_heads: usize,
    scale: f64,
    /// (layer, slot) -> (k, v), each [kv_heads, seen_tokens, head_dim]
    history: HashMap<(usize, usize), (Tensor, Tensor)>,
}

impl SlotKvAttention {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            scale: 1.0 / (head_dim as f64).sqrt(),
            history: HashMap::new(),
        }
    }

    /// Forget every layer's history for `slot`.
    pub fn release_slot(&mut self, slot: usize) {
        self.history.retain(|&(_, s), _| s != slot);
    }

    /// Cached tokens for `(layer, slot)`.
    pub fn cached_len(&self, layer_idx: usize, slot: usize) -> usize {
        self.history
            .get(&(layer_idx, slot))
            .and_then(|(k, _)| k.dims().get(1).copied())
            .unwrap_or(0)
    }

    fn extend_history(
        &mut self,
        key: (usize, usize),
        context_len: usize,
        k: Tensor,
        v: Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (k_full, v_full) = if context_len == 0 {
            (k, v)
        } else {
            let Some((k_prev, v_prev)) = self.history.get(&key) else {
                candle_core::bail!(
                    "no KV history for layer {} slot {} with context length {context_len}",
                    key.0,
                    key.1
                );
            };
            let cached = k_prev.dim(1)?;
            if cached != context_len {
                candle_core::bail!(
                    "KV history for layer {} slot {} holds {cached} tokens, batch expects {context_len}",
                    key.0,
                    key.1
                );
            }
            (Tensor::cat(&[k_prev, &k], 1)?, Tensor::cat(&[v_prev, &v], 1)?)
        };
        self.history.insert(key, (k_full.clone(), v_full.clone()));
        Ok((k_full, v_full))
    }
}

impl AttentionBackend for SlotKvAttention {
    fn attend(
        &mut self,
        layer_idx: usize,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &ForwardBatch,
    ) -> Result<Tensor> {
        let (_, _, head_dim) = q.dims3()?;
        let mut outputs = Vec::with_capacity(batch.num_seqs());
        for seq in 0..batch.num_seqs() {
            let range = batch.seq_range(seq);
            let len = range.len();
            let context_len = batch.context_len(seq);
            let slot = batch.state_slot(seq);

            // [len, heads, d] -> [heads, len, d]
            let q_s = q.narrow(0, range.start, len)?.transpose(0, 1)?.contiguous()?;
            let k_s = k.narrow(0, range.start, len)?.transpose(0, 1)?.contiguous()?;
            let v_s = v.narrow(0, range.start, len)?.transpose(0, 1)?.contiguous()?;

            let (k_full, v_full) = self.extend_history((layer_idx, slot), context_len, k_s, v_s)?;

            let groups = self.num_heads / self.num_kv_heads;
            let k_full = repeat_kv(k_full.unsqueeze(0)?, groups)?.contiguous()?;
            let v_full = repeat_kv(v_full.unsqueeze(0)?, groups)?.contiguous()?;
            let q_s = q_s.unsqueeze(0)?;

            let scores = (q_s.matmul(&k_full.transpose(2, 3)?.contiguous()?)? * self.scale)?;
            let mask = causal_mask(len, context_len, scores.dtype(), scores.device())?;
            let probs = candle_nn::ops::softmax_last_dim(&scores.broadcast_add(&mask)?)?;
            let out = probs.matmul(&v_full)?;

            // [1, heads, len, d] -> [len, heads * d]
            outputs.push(
                out.squeeze(0)?
                    .transpose(0, 1)?
                    .reshape((len, self.num_heads * head_dim))?,
            );
        }
        Tensor::cat(&outputs, 0)
    }
}

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .broadcast_as((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn single_token_attends_to_itself() {
        let device = Device::Cpu;
        let mut attn = SlotKvAttention::new(2, 1, 4);
        let q = Tensor::randn(0.0f32, 1.0, (1, 2, 4), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (1, 1, 4), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (1, 1, 4), &device).unwrap();
        let batch = ForwardBatch::single(1, 0, 0).unwrap();

        let out = attn.attend(0, &q, &k, &v, &batch).unwrap();
        assert_eq!(out.dims(), &[1, 8]);
        // softmax over a single key is 1: both heads copy v
        let expected = Tensor::cat(&[&v, &v], 1).unwrap().reshape((1, 8)).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
    }

    #[test]
    fn prefill_then_decode_matches_longer_prefill() {
        let device = Device::Cpu;
        let (heads, kv_heads, d, len) = (4, 2, 8, 5);
        let q = Tensor::randn(0.0f32, 1.0, (len, heads, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (len, kv_heads, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (len, kv_heads, d), &device).unwrap();

        let mut full = SlotKvAttention::new(heads, kv_heads, d);
        let all = full
            .attend(0, &q, &k, &v, &ForwardBatch::single(len, 0, 3).unwrap())
            .unwrap();

        let mut stepwise = SlotKvAttention::new(heads, kv_heads, d);
        let head = stepwise
            .attend(
                0,
                &q.narrow(0, 0, 3).unwrap(),
                &k.narrow(0, 0, 3).unwrap(),
                &v.narrow(0, 0, 3).unwrap(),
                &ForwardBatch::single(3, 0, 3).unwrap(),
            )
            .unwrap();
        let mut pieces = vec![head];
        for t in 3..len {
            pieces.push(
                stepwise
                    .attend(
                        0,
                        &q.narrow(0, t, 1).unwrap(),
                        &k.narrow(0, t, 1).unwrap(),
                        &v.narrow(0, t, 1).unwrap(),
                        &ForwardBatch::decode(&[(t, 3)]).unwrap(),
                    )
                    .unwrap(),
            );
        }
        let stitched = Tensor::cat(&pieces, 0).unwrap();
        assert!(max_abs_diff(&all, &stitched) < 1e-5);
        assert_eq!(stepwise.cached_len(0, 3), len);

        stepwise.release_slot(3);
        assert_eq!(stepwise.cached_len(0, 3), 0);
    }

    #[test]
    fn continuation_without_history_fails() {
        let device = Device::Cpu;
        let mut attn = SlotKvAttention::new(1, 1, 2);
        let x = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
        let batch = ForwardBatch::decode(&[(4, 0)]).unwrap();
        assert!(attn.attend(0, &x, &x, &x, &batch).is_err());
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 3, 4), &Device::Cpu).unwrap();
        let y = repeat_kv(x.clone(), 3).unwrap();
        assert_eq!(y.dims(), &[1, 6, 3, 4]);
        let first = y.narrow(1, 1, 1).unwrap();
        let src = x.narrow(1, 0, 1).unwrap();
        assert!(max_abs_diff(&first, &src) == 0.0);
    }
}
