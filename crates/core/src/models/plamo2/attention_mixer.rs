//! Attention mixer: fused QKV, per-head QK RMSNorm, RoPE, external
//! attention primitive, output projection.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::{Plamo2Config, RuntimeConfig};
use crate::distributed::{ColumnParallelLinear, RowParallelLinear};
use crate::forward_context::ForwardBatch;
use crate::layers::{AttentionBackend, PerHeadRmsNorm, RotaryEmbedding};
use crate::models::tp_layers::TpContext;

pub struct Plamo2AttentionMixer {
    qkv_proj: ColumnParallelLinear,
    o_proj: RowParallelLinear,
    q_norm: PerHeadRmsNorm,
    k_norm: PerHeadRmsNorm,
    rotary_emb: RotaryEmbedding,
    layer_idx: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Plamo2AttentionMixer {
    pub fn new(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        layer_idx: usize,
        vb: VarBuilder,
        tp: &TpContext,
    ) -> Result<Self> {
        let head_dim = cfg.hidden_size_per_head;
        let num_heads = tp.local(cfg.num_attention_heads)?;
        let num_kv_heads = tp.local_kv_heads(cfg.num_key_value_heads);
        if tp.world_size > cfg.num_key_value_heads {
            tracing::warn!(
                layer_idx,
                num_kv_heads = cfg.num_key_value_heads,
                tp_size = tp.world_size,
                "replicating KV heads across tensor-parallel ranks"
            );
        }

        let qkv_proj = ColumnParallelLinear::load(
            cfg.hidden_size,
            (num_heads + 2 * num_kv_heads) * head_dim,
            false,
            false,
            vb.pp("qkv_proj"),
            tp.comm(),
        )?;
        let o_proj = RowParallelLinear::load(
            num_heads * head_dim,
            cfg.hidden_size,
            false,
            vb.pp("o_proj"),
            tp.comm(),
        )?;
        let q_norm = PerHeadRmsNorm::load(num_heads, head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm =
            PerHeadRmsNorm::load(num_kv_heads, head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?;
        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            runtime.max_model_len,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            qkv_proj,
            o_proj,
            q_norm,
            k_norm,
            rotary_emb,
            layer_idx,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// `hidden`: `[tokens, hidden_size]` → `[tokens, hidden_size]`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        batch: &ForwardBatch,
        backend: &mut dyn AttentionBackend,
    ) -> Result<Tensor> {
        let tokens = hidden.dim(0)?;
        let q_size = self.num_heads * self.head_dim;
        let kv_size = self.num_kv_heads * self.head_dim;

        let qkv = self.qkv_proj.forward(hidden)?;
        let q = qkv
            .narrow(1, 0, q_size)?
            .reshape((tokens, self.num_heads, self.head_dim))?;
        let k = qkv
            .narrow(1, q_size, kv_size)?
            .reshape((tokens, self.num_kv_heads, self.head_dim))?;
        let v = qkv
            .narrow(1, q_size + kv_size, kv_size)?
            .reshape((tokens, self.num_kv_heads, self.head_dim))?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let (q, k) = self.rotary_emb.apply_varlen(&q, &k, batch.positions())?;

        let attn = backend.attend(self.layer_idx, &q, &k, &v, batch)?;
        self.o_proj.forward(&attn)
    }
}
