use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::attention_mixer::Plamo2AttentionMixer;
use super::mamba_mixer::Plamo2MambaMixer;
use super::schedule::LayerKind;
use crate::config::{Plamo2Config, RuntimeConfig};
use crate::forward_context::ForwardBatch;
use crate::layers::{rms_norm, AttentionBackend, RmsNorm, SwiGluMlp};
use crate::models::tp_layers::TpContext;
use crate::ssm::MambaLayerState;

pub enum Plamo2Mixer {
    Mamba(Plamo2MambaMixer),
    Attention(Plamo2AttentionMixer),
}

impl Plamo2Mixer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Plamo2Mixer::Mamba(_) => LayerKind::Mamba,
            Plamo2Mixer::Attention(_) => LayerKind::Attention,
        }
    }
}

/// The per-layer collaborator a mixer needs for one forward call.
pub enum MixerState<'a> {
    Recurrent(&'a mut MambaLayerState),
    Attention(&'a mut dyn AttentionBackend),
}

/// Pre-norm decoder layer with four norms.
///
/// ```text
/// (h, residual) = pre_mixer_norm(x, residual)   # residual' = x + residual
/// h = post_mixer_norm(mixer(h))
/// (h, residual) = pre_mlp_norm(h, residual)
/// h = post_mlp_norm(mlp(h))
/// ```
/// The first layer of the stack has no incoming residual and starts from
/// `residual = x`.
pub struct Plamo2DecoderLayer {
    mixer: Plamo2Mixer,
    mlp: SwiGluMlp,
    pre_mixer_norm: RmsNorm,
    post_mixer_norm: RmsNorm,
    pre_mlp_norm: RmsNorm,
    post_mlp_norm: RmsNorm,
}

impl Plamo2DecoderLayer {
    pub fn new(
        cfg: &Plamo2Config,
        runtime: &RuntimeConfig,
        layer_idx: usize,
        kind: LayerKind,
        vb: VarBuilder,
        tp: &TpContext,
    ) -> Result<Self> {
        let mixer = match kind {
            LayerKind::Mamba => Plamo2Mixer::Mamba(Plamo2MambaMixer::new(cfg, vb.pp("mamba"), tp)?),
            LayerKind::Attention => Plamo2Mixer::Attention(Plamo2AttentionMixer::new(
                cfg, runtime, layer_idx, vb.clone(), tp,
            )?),
        };
        let mlp = SwiGluMlp::new(
            cfg.hidden_size,
            tp.local(cfg.intermediate_size)?,
            vb.pp("mlp"),
            tp.comm(),
        )?;
        let eps = cfg.rms_norm_eps;
        Ok(Self {
            mixer,
            mlp,
            pre_mixer_norm: rms_norm(cfg.hidden_size, eps, vb.pp("pre_mixer_norm"))?,
            post_mixer_norm: rms_norm(cfg.hidden_size, eps, vb.pp("post_mixer_norm"))?,
            pre_mlp_norm: rms_norm(cfg.hidden_size, eps, vb.pp("pre_mlp_norm"))?,
            post_mlp_norm: rms_norm(cfg.hidden_size, eps, vb.pp("post_mlp_norm"))?,
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.mixer.kind()
    }

    /// Returns `(hidden, residual)` for the next layer.
    pub fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        batch: &ForwardBatch,
        state: MixerState<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let (h, residual) = match residual {
            None => (self.pre_mixer_norm.forward(hidden)?, hidden.clone()),
            Some(residual) => self.pre_mixer_norm.forward_residual(hidden, residual)?,
        };

        let h = match (&self.mixer, state) {
            (Plamo2Mixer::Mamba(mixer), MixerState::Recurrent(layer_state)) => {
                mixer.forward(&h, batch, layer_state)?
            }
            (Plamo2Mixer::Attention(mixer), MixerState::Attention(backend)) => {
                mixer.forward(&h, batch, backend)?
            }
            (mixer, _) => candle_core::bail!(
                "{:?} layer received the wrong kind of mixer state",
                mixer.kind()
            ),
        };
        let h = self.post_mixer_norm.forward(&h)?;

        let (h, residual) = self.pre_mlp_norm.forward_residual(&h, &residual)?;
        let h = self.mlp.forward(&h)?;
        let h = self.post_mlp_norm.forward(&h)?;
        Ok((h, residual))
    }
}
