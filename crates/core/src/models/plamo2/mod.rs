//! PLaMo-2: hybrid attention / Mamba decoder.
//!
//! ```text
//! Embedding -> [Plamo2DecoderLayer x N] -> final RMSNorm -> LM head
//!
//! Plamo2DecoderLayer:
//!   pre_mixer_norm -> (Mamba | QK-norm + RoPE attention) -> post_mixer_norm
//!   -> pre_mlp_norm -> SwiGLU MLP -> post_mlp_norm
//! ```
//!
//! Layer `i` is attention when `i % mamba_step == mamba_step / 2`, Mamba
//! otherwise. Recurrent state lives in a [`MambaStateCache`] owned by the
//! caller and indexed by slot; attention K/V lives behind an
//! [`AttentionBackend`](crate::layers::AttentionBackend).
//!
//! Layout, bottom-up:
//!
//! - `schedule` - which layer indices are Mamba and which are attention
//! - `mamba_mixer` / `attention_mixer` - the two token mixers
//! - `decoder_layer` - one hybrid layer with its four fused residual norms
//! - `model` - one pipeline stage of the stack (embedding, owned layers,
//!   final norm) and the recurrent-layer cursor
//! - `weights` - the runtime parameter set the checkpoint loader fills
//! - this file - [`Plamo2ForCausalLM`]: construction, loading, LM head

mod attention_mixer;
mod decoder_layer;
mod mamba_mixer;
mod model;
mod schedule;
mod weights;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;

pub use attention_mixer::Plamo2AttentionMixer;
pub use decoder_layer::{MixerState, Plamo2DecoderLayer, Plamo2Mixer};
pub use mamba_mixer::Plamo2MambaMixer;
pub use model::{Plamo2Model, StageOutput};
pub use schedule::{is_mamba, layer_kinds, num_mamba_layers, LayerKind};
pub use weights::declare_parameters;

use super::tp_layers::TpContext;
use super::ModelError;
use crate::config::{Plamo2Config, RuntimeConfig};
use crate::distributed::{padded_vocab_size, IntermediateTensors, ParallelLmHead};
use crate::forward_context::ForwardContext;
use crate::layers::SlotKvAttention;
use crate::loader::{load_weights, CheckpointTranslator, LoadSummary, SafetensorsCheckpoint};
use crate::ssm::MambaStateCache;

pub struct Plamo2ForCausalLM {
    model: Plamo2Model,
    /// Present on the last pipeline stage only.
    lm_head: Option<ParallelLmHead>,
    cfg: Plamo2Config,
    kinds: Vec<LayerKind>,
    tp: TpContext,
    dtype: DType,
    device: Device,
}

impl Plamo2ForCausalLM {
    /// Build from already-sharded weights (runtime names).
    pub fn new(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        vb: VarBuilder,
        tp: &TpContext,
    ) -> std::result::Result<Self, ModelError> {
        cfg.validate(runtime)?;
        if tp.world_size != runtime.tp_size() || tp.rank != runtime.tp_rank {
            return Err(ModelError::TensorParallelMismatch {
                runtime_rank: runtime.tp_rank,
                runtime_size: runtime.tp_size(),
                rank: tp.rank,
                size: tp.world_size,
            });
        }
        let kinds = layer_kinds(cfg.num_hidden_layers, cfg.mamba_step)?;
        let model = Plamo2Model::new(cfg, runtime, vb.pp("model"), tp)?;

        let lm_head = if model.stage().is_last {
            let rows = padded_vocab_size(cfg.vocab_size, tp.world_size) / tp.world_size;
            let weight = match model.embed_tokens() {
                Some(embed) if cfg.tie_word_embeddings => embed.embeddings().clone(),
                _ if cfg.tie_word_embeddings => vb
                    .pp("model")
                    .pp("embed_tokens")
                    .get((rows, cfg.hidden_size), "weight")?,
                _ => vb.pp("lm_head").get((rows, cfg.hidden_size), "weight")?,
            };
            Some(ParallelLmHead::new(weight, cfg.vocab_size, tp.comm()))
        } else {
            None
        };

        let stage = model.stage();
        tracing::info!(
            stage = stage.stage_id,
            num_stages = stage.num_stages,
            layers = ?stage.layer_range(),
            mamba_layers = model.num_mamba_layers(),
            tp_rank = tp.rank,
            tp_size = tp.world_size,
            tied_embeddings = cfg.tie_word_embeddings,
            "built PLaMo-2 stage"
        );

        Ok(Self {
            model,
            lm_head,
            cfg: cfg.clone(),
            kinds,
            tp: tp.clone(),
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// Declare this worker's parameters, hydrate them from a stream of
    /// checkpoint tensors in the published layout, then build the model.
    pub fn load<I>(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        tp: &TpContext,
        checkpoint: I,
        dtype: DType,
        device: &Device,
    ) -> std::result::Result<(Self, LoadSummary), ModelError>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        cfg.validate(runtime)?;
        let mut params = declare_parameters(cfg, runtime, dtype, device)?;
        let translator = CheckpointTranslator::new(cfg);
        let summary = load_weights(&mut params, &translator, checkpoint)?;
        let vb = params.into_var_builder()?;
        Ok((Self::new(cfg, runtime, vb, tp)?, summary))
    }

    /// Like [`load`](Self::load), reading memory-mapped safetensors shards.
    pub fn load_safetensors(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        tp: &TpContext,
        checkpoint: &SafetensorsCheckpoint,
        dtype: DType,
        device: &Device,
    ) -> std::result::Result<(Self, LoadSummary), ModelError> {
        cfg.validate(runtime)?;
        let mut params = declare_parameters(cfg, runtime, dtype, device)?;
        let translator = CheckpointTranslator::new(cfg);
        let summary = checkpoint.load_into(&mut params, &translator, device)?;
        let vb = params.into_var_builder()?;
        Ok((Self::new(cfg, runtime, vb, tp)?, summary))
    }

    pub fn config(&self) -> &Plamo2Config {
        &self.cfg
    }

    pub fn model(&self) -> &Plamo2Model {
        &self.model
    }

    /// Kind of every layer in the full stack.
    pub fn layer_kinds(&self) -> &[LayerKind] {
        &self.kinds
    }

    pub fn is_last_stage(&self) -> bool {
        self.lm_head.is_some()
    }

    /// Run this stage on one batch. See [`Plamo2Model::forward`].
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        ctx: &mut ForwardContext<'_>,
        intermediate: Option<IntermediateTensors>,
    ) -> Result<StageOutput> {
        self.model.forward(input_ids, ctx, intermediate)
    }

    /// `hidden`: `[tokens, hidden_size]` → `[tokens, vocab_size]`.
    pub fn compute_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.lm_head {
            Some(head) => head.forward(hidden),
            None => candle_core::bail!(
                "pipeline stage {} has no LM head",
                self.model.stage().stage_id
            ),
        }
    }

    /// Recurrent layers owned by this stage.
    pub fn num_local_mamba_layers(&self) -> usize {
        self.model.num_mamba_layers()
    }

    /// Per-slot `(conv, ssm)` row shapes on this worker:
    /// `((d_inner / tp, d_conv - 1), (d_inner / tp, d_state))`.
    pub fn mamba_state_shape(&self) -> ((usize, usize), (usize, usize)) {
        let d_local = self.cfg.mamba_intermediate_size() / self.tp.world_size;
        (
            (d_local, self.cfg.mamba_d_conv - 1),
            (d_local, self.cfg.mamba_d_state),
        )
    }

    /// State cache sized for this stage's recurrent layers.
    pub fn new_state_cache(&self, num_slots: usize) -> Result<MambaStateCache> {
        let (conv, ssm) = self.mamba_state_shape();
        MambaStateCache::new(
            self.num_local_mamba_layers(),
            num_slots,
            conv,
            ssm,
            self.dtype,
            &self.device,
        )
    }

    /// In-memory attention backend with this worker's head layout.
    pub fn new_attention_backend(&self) -> SlotKvAttention {
        let num_heads = self.cfg.num_attention_heads / self.tp.world_size;
        let num_kv_heads = self.tp.local_kv_heads(self.cfg.num_key_value_heads);
        SlotKvAttention::new(num_heads, num_kv_heads, self.cfg.hidden_size_per_head)
    }
}
