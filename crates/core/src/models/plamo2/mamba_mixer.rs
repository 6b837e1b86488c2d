//! Recurrent (Mamba) mixer.
//!
//! ```text
//! in_proj -> [gate | x]
//! x -> causal conv1d -> silu -> x_proj -> (B, C, dt) -> RMSNorm each
//! dt -> dt_proj (per head) -> broadcast over head channels
//! y = selective_scan(x, dt, B, C) * silu(gate) -> out_proj
//! ```
//!
//! Weights are the local tensor-parallel shard: `d_inner / tp` channels and
//! `mamba_num_heads / tp` heads.

use std::sync::Arc;

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::Plamo2Config;
use crate::distributed::{ColumnParallelLinear, DeviceCommunicator, RowParallelLinear};
use crate::forward_context::ForwardBatch;
use crate::layers::{rms_norm, RmsNorm};
use crate::models::tp_layers::TpContext;
use crate::ssm::{
    causal_conv1d_decode, causal_conv1d_prefill, selective_scan_decode, selective_scan_prefill,
    MambaLayerState, ScanInputs, ScanParams,
};

pub struct Plamo2MambaMixer {
    in_proj: ColumnParallelLinear,
    /// [d_local, d_conv]
    conv_weight: Tensor,
    x_proj: RowParallelLinear,
    dt_proj: ColumnParallelLinear,
    dt_norm: RmsNorm,
    b_norm: RmsNorm,
    c_norm: RmsNorm,
    /// [d_local, d_state], F32, already negated and exponentiated
    a: Tensor,
    /// [d_local], F32
    d: Tensor,
    /// Per-head bias broadcast to [d_local]
    dt_bias: Tensor,
    out_proj: RowParallelLinear,
    d_local: usize,
    heads_local: usize,
    head_dim: usize,
    d_state: usize,
    time_step_rank: usize,
}

impl Plamo2MambaMixer {
    pub fn new(cfg: &Plamo2Config, vb: VarBuilder, tp: &TpContext) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let head_dim = cfg.hidden_size_per_head;
        let heads_local = tp.local(cfg.mamba_num_heads)?;
        let d_local = heads_local * head_dim;
        let d_state = cfg.mamba_d_state;
        let d_conv = cfg.mamba_d_conv;
        let time_step_rank = cfg.time_step_rank();
        let comm: Arc<dyn DeviceCommunicator> = tp.comm();

        let in_proj = ColumnParallelLinear::load(
            hidden_size,
            2 * d_local,
            false,
            false,
            vb.pp("in_proj"),
            Arc::clone(&comm),
        )?;
        let conv_weight = vb
            .pp("conv1d")
            .get((d_local, 1, d_conv), "weight")?
            .squeeze(1)?;
        let x_proj = RowParallelLinear::load(
            d_local,
            2 * d_state + time_step_rank,
            false,
            vb.pp("x_proj"),
            Arc::clone(&comm),
        )?;
        let dt_proj = ColumnParallelLinear::load(
            time_step_rank,
            heads_local,
            false,
            false,
            vb.pp("dt_proj"),
            Arc::clone(&comm),
        )?;
        // added inside the recurrence, not by the projection
        let dt_bias = vb.pp("dt_proj").get(heads_local, "bias")?;
        let dt_bias = expand_heads(&dt_bias.unsqueeze(0)?, heads_local, head_dim)?.squeeze(0)?;

        let dt_norm = rms_norm(time_step_rank, cfg.rms_norm_eps, vb.pp("dt_layernorm"))?;
        let b_norm = rms_norm(d_state, cfg.rms_norm_eps, vb.pp("b_layernorm"))?;
        let c_norm = rms_norm(d_state, cfg.rms_norm_eps, vb.pp("c_layernorm"))?;

        let vb_f32 = vb.to_dtype(DType::F32);
        let a = vb_f32.get((d_local, d_state), "A")?;
        let d = vb_f32.get(d_local, "D")?;

        let out_proj = RowParallelLinear::load(d_local, hidden_size, false, vb.pp("out_proj"), comm)?;

        Ok(Self {
            in_proj,
            conv_weight,
            x_proj,
            dt_proj,
            dt_norm,
            b_norm,
            c_norm,
            a,
            d,
            dt_bias,
            out_proj,
            d_local,
            heads_local,
            head_dim,
            d_state,
            time_step_rank,
        })
    }

    /// `hidden`: `[tokens, hidden_size]` → `[tokens, hidden_size]`.
    ///
    /// Decode batches (one token per sequence, all with prior context) take
    /// the gathered single-step path; everything else runs the varlen
    /// prefill path. Both read and write `state` by slot.
    pub fn forward(
        &self,
        hidden: &Tensor,
        batch: &ForwardBatch,
        state: &mut MambaLayerState,
    ) -> Result<Tensor> {
        let decode = batch.is_decode();

        let proj = self.in_proj.forward(hidden)?;
        let gate = proj.narrow(D::Minus1, 0, self.d_local)?;
        let x = proj.narrow(D::Minus1, self.d_local, self.d_local)?.contiguous()?;

        let x = if decode {
            causal_conv1d_decode(&x, &self.conv_weight, batch, state)?
        } else {
            causal_conv1d_prefill(&x, &self.conv_weight, batch, state)?
        };
        let x = candle_nn::ops::silu(&x)?;

        let (b, c, dt) = self.project_ssm_inputs(&x)?;
        let inputs = ScanInputs {
            x: &x,
            dt: &dt,
            b: &b,
            c: &c,
        };
        let params = ScanParams {
            a: &self.a,
            d: &self.d,
            dt_bias: &self.dt_bias,
        };
        let y = if decode {
            selective_scan_decode(&inputs, &params, batch, state)?
        } else {
            selective_scan_prefill(&inputs, &params, batch, state)?
        };

        let y = (y * candle_nn::ops::silu(&gate)?)?;
        self.out_proj.forward(&y)
    }

    /// Split `x_proj` output as B, C, dt; normalize each; project dt per head.
    fn project_ssm_inputs(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let bcdt = self.x_proj.forward(x)?;
        let b = bcdt.narrow(D::Minus1, 0, self.d_state)?.contiguous()?;
        let c = bcdt.narrow(D::Minus1, self.d_state, self.d_state)?.contiguous()?;
        let dt = bcdt
            .narrow(D::Minus1, 2 * self.d_state, self.time_step_rank)?
            .contiguous()?;

        let b = self.b_norm.forward(&b)?;
        let c = self.c_norm.forward(&c)?;
        let dt = self.dt_proj.forward(&self.dt_norm.forward(&dt)?)?;
        let dt = expand_heads(&dt, self.heads_local, self.head_dim)?;
        Ok((b, c, dt))
    }
}

/// `[tokens, heads]` → `[tokens, heads * head_dim]`, each head's value
/// repeated over its channels.
fn expand_heads(x: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let tokens = x.dim(0)?;
    x.unsqueeze(2)?
        .broadcast_as((tokens, heads, head_dim))?
        .reshape((tokens, heads * head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssm::MambaStateCache;
    use candle_core::Device;
    use std::collections::HashMap;

    fn tiny_cfg() -> Plamo2Config {
        Plamo2Config {
            hidden_size: 16,
            hidden_size_per_head: 4,
            mamba_num_heads: 2,
            mamba_d_state: 3,
            mamba_d_conv: 3,
            rms_norm_eps: 1e-6,
            ..Default::default()
        }
    }

    fn random_mixer(cfg: &Plamo2Config) -> Plamo2MambaMixer {
        let device = Device::Cpu;
        let d = cfg.mamba_intermediate_size();
        let h = cfg.hidden_size;
        let n = cfg.mamba_d_state;
        let r = cfg.time_step_rank();
        let heads = cfg.mamba_num_heads;
        let randn = |shape: &[usize], std: f64| {
            Tensor::randn(0f32, std as f32, shape, &device).unwrap()
        };
        let mut t = HashMap::new();
        t.insert("in_proj.weight".to_string(), randn(&[2 * d, h], 0.3));
        t.insert("conv1d.weight".to_string(), randn(&[d, 1, cfg.mamba_d_conv], 0.5));
        t.insert("x_proj.weight".to_string(), randn(&[2 * n + r, d], 0.3));
        t.insert("dt_proj.weight".to_string(), randn(&[heads, r], 0.1));
        t.insert("dt_proj.bias".to_string(), randn(&[heads], 0.5));
        t.insert(
            "dt_layernorm.weight".to_string(),
            Tensor::ones(r, DType::F32, &device).unwrap(),
        );
        t.insert(
            "b_layernorm.weight".to_string(),
            Tensor::ones(n, DType::F32, &device).unwrap(),
        );
        t.insert(
            "c_layernorm.weight".to_string(),
            Tensor::ones(n, DType::F32, &device).unwrap(),
        );
        t.insert("A".to_string(), randn(&[d, n], 0.5).exp().unwrap().neg().unwrap());
        t.insert("D".to_string(), randn(&[d], 1.0));
        t.insert("out_proj.weight".to_string(), randn(&[h, d], 0.3));
        let vb = VarBuilder::from_tensors(t, DType::F32, &device);
        Plamo2MambaMixer::new(cfg, vb, &TpContext::single_gpu()).unwrap()
    }

    fn state_cache(cfg: &Plamo2Config, slots: usize) -> MambaStateCache {
        let d = cfg.mamba_intermediate_size();
        MambaStateCache::new(
            1,
            slots,
            (d, cfg.mamba_d_conv - 1),
            (d, cfg.mamba_d_state),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap()
    }

    fn vec1(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        for (x, y) in vec1(a).iter().zip(vec1(b).iter()) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn expand_heads_repeats_per_channel() {
        let x = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let y = expand_heads(&x, 2, 3).unwrap();
        assert_eq!(vec1(&y), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn prefill_matches_prefix_then_decode() {
        let cfg = tiny_cfg();
        let mixer = random_mixer(&cfg);
        let len = 6;
        let hidden = Tensor::randn(0f32, 1.0, (len, cfg.hidden_size), &Device::Cpu).unwrap();

        let mut full = state_cache(&cfg, 2);
        let all = mixer
            .forward(
                &hidden,
                &ForwardBatch::single(len, 0, 1).unwrap(),
                full.layer_mut(0).unwrap(),
            )
            .unwrap();
        assert_eq!(all.dims(), &[len, cfg.hidden_size]);

        let mut split = state_cache(&cfg, 2);
        let layer = split.layer_mut(0).unwrap();
        let mut pieces = vec![mixer
            .forward(
                &hidden.narrow(0, 0, 2).unwrap(),
                &ForwardBatch::single(2, 0, 1).unwrap(),
                layer,
            )
            .unwrap()];
        for t in 2..len {
            pieces.push(
                mixer
                    .forward(
                        &hidden.narrow(0, t, 1).unwrap(),
                        &ForwardBatch::decode(&[(t, 1)]).unwrap(),
                        layer,
                    )
                    .unwrap(),
            );
        }
        assert_close(&all, &Tensor::cat(&pieces, 0).unwrap());
    }

    #[test]
    fn varlen_batch_matches_separate_calls() {
        let cfg = tiny_cfg();
        let mixer = random_mixer(&cfg);
        let hidden = Tensor::randn(0f32, 1.0, (5, cfg.hidden_size), &Device::Cpu).unwrap();

        let mut batched = state_cache(&cfg, 4);
        let together = mixer
            .forward(
                &hidden,
                &ForwardBatch::new(&[3, 2], &[0, 0], &[3, 0]).unwrap(),
                batched.layer_mut(0).unwrap(),
            )
            .unwrap();

        let mut separate = state_cache(&cfg, 4);
        let first = mixer
            .forward(
                &hidden.narrow(0, 0, 3).unwrap(),
                &ForwardBatch::single(3, 0, 3).unwrap(),
                separate.layer_mut(0).unwrap(),
            )
            .unwrap();
        let second = mixer
            .forward(
                &hidden.narrow(0, 3, 2).unwrap(),
                &ForwardBatch::single(2, 0, 0).unwrap(),
                separate.layer_mut(0).unwrap(),
            )
            .unwrap();
        assert_close(&together, &Tensor::cat(&[first, second], 0).unwrap());
    }

    #[test]
    fn rejects_wrong_hidden_width() {
        let cfg = tiny_cfg();
        let mixer = random_mixer(&cfg);
        let mut cache = state_cache(&cfg, 1);
        let bad = Tensor::zeros((2, cfg.hidden_size + 1), DType::F32, &Device::Cpu).unwrap();
        assert!(mixer
            .forward(&bad, &ForwardBatch::single(2, 0, 0).unwrap(), cache.layer_mut(0).unwrap())
            .is_err());
    }
}
