use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::decoder_layer::{MixerState, Plamo2DecoderLayer};
use super::schedule::{layer_kinds, LayerKind};
use crate::config::{Plamo2Config, RuntimeConfig};
use crate::distributed::{
    padded_vocab_size, IntermediateTensors, PipelineStageConfig, VocabParallelEmbedding,
};
use crate::forward_context::ForwardContext;
use crate::layers::{rms_norm, RmsNorm};
use crate::models::tp_layers::TpContext;

/// What a pipeline stage hands back from `forward`.
#[derive(Debug)]
pub enum StageOutput {
    /// Final-normed hidden states of the last stage: `[tokens, hidden]`.
    Hidden(Tensor),
    /// Residual-stream pair for the next stage.
    Intermediate(IntermediateTensors),
}

impl StageOutput {
    pub fn into_hidden(self) -> Result<Tensor> {
        match self {
            StageOutput::Hidden(h) => Ok(h),
            StageOutput::Intermediate(_) => {
                candle_core::bail!("stage is not the last pipeline stage")
            }
        }
    }

    pub fn into_intermediate(self) -> Result<IntermediateTensors> {
        match self {
            StageOutput::Intermediate(t) => Ok(t),
            StageOutput::Hidden(_) => candle_core::bail!("last pipeline stage has no successor"),
        }
    }
}

/// The decoder layers this pipeline stage owns, plus the embedding (first
/// stage) and the final norm (last stage).
pub struct Plamo2Model {
    embed_tokens: Option<VocabParallelEmbedding>,
    layers: Vec<Plamo2DecoderLayer>,
    final_layernorm: Option<RmsNorm>,
    stage: PipelineStageConfig,
    hidden_size: usize,
}

impl Plamo2Model {
    /// `vb` is rooted at `model`.
    pub fn new(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        vb: VarBuilder,
        tp: &TpContext,
    ) -> Result<Self> {
        let kinds = layer_kinds(cfg.num_hidden_layers, cfg.mamba_step)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let stage =
            PipelineStageConfig::new(runtime.pp_rank, runtime.pp_size(), cfg.num_hidden_layers);

        let embed_tokens = if stage.is_first {
            let rows = padded_vocab_size(cfg.vocab_size, tp.world_size) / tp.world_size;
            Some(VocabParallelEmbedding::load(
                rows,
                cfg.hidden_size,
                vb.pp("embed_tokens"),
                tp.comm(),
            )?)
        } else {
            None
        };

        let vb_layers = vb.pp("layers");
        let layers = stage
            .layer_range()
            .map(|i| Plamo2DecoderLayer::new(cfg, runtime, i, kinds[i], vb_layers.pp(i), tp))
            .collect::<Result<Vec<_>>>()?;

        let final_layernorm = if stage.is_last {
            Some(rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("final_layernorm"),
            )?)
        } else {
            None
        };

        Ok(Self {
            embed_tokens,
            layers,
            final_layernorm,
            stage,
            hidden_size: cfg.hidden_size,
        })
    }

    pub fn stage(&self) -> &PipelineStageConfig {
        &self.stage
    }

    pub fn embed_tokens(&self) -> Option<&VocabParallelEmbedding> {
        self.embed_tokens.as_ref()
    }

    pub fn num_mamba_layers(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.kind() == LayerKind::Mamba)
            .count()
    }

    /// Run the local layers.
    ///
    /// The first stage embeds `input_ids` (`[tokens]`, u32); later stages
    /// continue from `intermediate`. Recurrent layers are numbered from 0 on
    /// every stage and pick their slice of `ctx.mamba_cache` in that order.
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        ctx: &mut ForwardContext<'_>,
        intermediate: Option<IntermediateTensors>,
    ) -> Result<StageOutput> {
        let batch = ctx.batch;
        let (mut hidden, mut residual) = match (&self.embed_tokens, input_ids, intermediate) {
            (Some(embed), Some(ids), _) => (embed.forward(ids)?, None),
            (None, _, Some(t)) => (t.hidden_states, Some(t.residual)),
            (Some(_), None, _) => candle_core::bail!("first pipeline stage needs input ids"),
            (None, _, None) => candle_core::bail!(
                "pipeline stage {} needs intermediate tensors",
                self.stage.stage_id
            ),
        };
        let (tokens, width) = hidden.dims2()?;
        if tokens != batch.num_tokens() || width != self.hidden_size {
            candle_core::bail!(
                "stage input is [{tokens}, {width}], batch expects [{}, {}]",
                batch.num_tokens(),
                self.hidden_size
            );
        }

        let mut recurrent_idx = 0;
        for layer in &self.layers {
            let state = match layer.kind() {
                LayerKind::Mamba => {
                    let layer_state = ctx.mamba_cache.layer_mut(recurrent_idx).ok_or_else(|| {
                        candle_core::Error::Msg(format!(
                            "state cache has no recurrent layer {recurrent_idx}"
                        ))
                    })?;
                    recurrent_idx += 1;
                    MixerState::Recurrent(layer_state)
                }
                LayerKind::Attention => MixerState::Attention(&mut *ctx.attention),
            };
            let (h, r) = layer.forward(&hidden, residual.as_ref(), batch, state)?;
            hidden = h;
            residual = Some(r);
        }

        match (&self.final_layernorm, residual) {
            (Some(norm), Some(residual)) => {
                let (normed, _) = norm.forward_residual(&hidden, &residual)?;
                Ok(StageOutput::Hidden(normed))
            }
            (Some(norm), None) => Ok(StageOutput::Hidden(norm.forward(&hidden)?)),
            (None, Some(residual)) => Ok(StageOutput::Intermediate(IntermediateTensors::new(
                hidden, residual,
            )?)),
            (None, None) => candle_core::bail!("pipeline stage owns no layers"),
        }
    }
}
