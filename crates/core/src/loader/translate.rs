//! Published checkpoint layout → runtime parameter layout.

use candle_core::{DType, Tensor};

use super::CheckpointError;
use crate::config::Plamo2Config;

/// Added to the pre-mixer and pre-MLP norm weights, and to the final norm.
pub const PRE_NORM_OFFSET: f64 = 1.0;
/// Added to the post-mixer norm weights: `1 / 5`.
pub const POST_MIXER_NORM_OFFSET: f64 = 0.2;
/// Added to the post-MLP norm weights: `1 / 5^1.5`.
pub const POST_MLP_NORM_OFFSET: f64 = 0.089_442_719_099_991_59;

/// Reshape applied to a checkpoint tensor before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeTransform {
    Identity,
    /// `[heads]` → `[heads * head_dim, d_state]`
    BroadcastHeadsState,
    /// `[heads]` → `[heads * head_dim]`
    BroadcastHeads,
    /// Rows grouped per head as `[gate_h | x_h]` → `[all gates | all x]`.
    RegroupInProj,
}

struct LayerRule {
    checkpoint: &'static str,
    runtime: &'static str,
    transform: ShapeTransform,
    offset: Option<f64>,
}

const fn rule(checkpoint: &'static str, runtime: &'static str) -> LayerRule {
    LayerRule {
        checkpoint,
        runtime,
        transform: ShapeTransform::Identity,
        offset: None,
    }
}

const fn norm(name: &'static str, offset: f64) -> LayerRule {
    LayerRule {
        checkpoint: name,
        runtime: name,
        transform: ShapeTransform::Identity,
        offset: Some(offset),
    }
}

const fn reshaped(
    checkpoint: &'static str,
    runtime: &'static str,
    transform: ShapeTransform,
) -> LayerRule {
    LayerRule {
        checkpoint,
        runtime,
        transform,
        offset: None,
    }
}

/// Per-layer suffixes, matched exactly after the layer prefix.
const LAYER_RULES: &[LayerRule] = &[
    norm("pre_mixer_norm.weight", PRE_NORM_OFFSET),
    norm("post_mixer_norm.weight", POST_MIXER_NORM_OFFSET),
    norm("pre_mlp_norm.weight", PRE_NORM_OFFSET),
    norm("post_mlp_norm.weight", POST_MLP_NORM_OFFSET),
    rule("mlp.gate_up_proj.weight", "mlp.gate_up_proj.weight"),
    rule("mlp.down_proj.weight", "mlp.down_proj.weight"),
    rule("mixer.qkv_proj.weight", "qkv_proj.weight"),
    rule("mixer.o_proj.weight", "o_proj.weight"),
    rule("mixer.q_weight", "q_norm.weight"),
    rule("mixer.k_weight", "k_norm.weight"),
    reshaped("mixer.A_log", "mamba.A", ShapeTransform::BroadcastHeadsState),
    reshaped("mixer.D", "mamba.D", ShapeTransform::BroadcastHeads),
    rule("mixer.B_norm_weight", "mamba.b_layernorm.weight"),
    rule("mixer.C_norm_weight", "mamba.c_layernorm.weight"),
    rule("mixer.dt_norm_weight", "mamba.dt_layernorm.weight"),
    rule("mixer.bcdt_proj.weight", "mamba.x_proj.weight"),
    rule("mixer.conv1d.weight", "mamba.conv1d.weight"),
    reshaped(
        "mixer.in_proj.weight",
        "mamba.in_proj.weight",
        ShapeTransform::RegroupInProj,
    ),
    rule("mixer.out_proj.weight", "mamba.out_proj.weight"),
    rule("mixer.dt_bias", "mamba.dt_proj.bias"),
    rule("mixer.dt_proj.weight", "mamba.dt_proj.weight"),
];

/// Checkpoint layer prefixes, nested form first.
const LAYER_PREFIXES: &[&str] = &["model.layers.layers.", "model.layers."];

pub const EMBED_TOKENS: &str = "model.embed_tokens.weight";
pub const FINAL_NORM: &str = "model.final_layernorm.weight";
pub const LM_HEAD: &str = "lm_head.weight";
const CHECKPOINT_FINAL_NORM: &str = "model.norm.weight";

/// Maps checkpoint tensors to `(runtime name, tensor)`.
#[derive(Debug, Clone)]
pub struct CheckpointTranslator {
    mamba_num_heads: usize,
    head_dim: usize,
    d_state: usize,
    tie_word_embeddings: bool,
}

impl CheckpointTranslator {
    pub fn new(cfg: &Plamo2Config) -> Self {
        Self {
            mamba_num_heads: cfg.mamba_num_heads,
            head_dim: cfg.hidden_size_per_head,
            d_state: cfg.mamba_d_state,
            tie_word_embeddings: cfg.tie_word_embeddings,
        }
    }

    /// Runtime name for a checkpoint name, `None` when the tensor is dropped.
    pub fn runtime_name(&self, name: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.resolve(name)?.map(|(runtime, _)| runtime))
    }

    /// Translate one tensor. `Ok(None)` means the tensor is intentionally
    /// dropped (the LM head of a model with tied embeddings).
    pub fn translate(
        &self,
        name: &str,
        tensor: &Tensor,
    ) -> Result<Option<(String, Tensor)>, CheckpointError> {
        let Some((runtime, rule)) = self.resolve(name)? else {
            return Ok(None);
        };
        let tensor = self.reshape(name, rule.transform, tensor)?;
        let tensor = match rule.offset {
            Some(offset) => add_offset(&tensor, offset)?,
            None => tensor,
        };
        Ok(Some((runtime, tensor)))
    }

    fn resolve(&self, name: &str) -> Result<Option<(String, RuleRef)>, CheckpointError> {
        match name {
            EMBED_TOKENS => return Ok(Some((EMBED_TOKENS.to_string(), RuleRef::IDENTITY))),
            CHECKPOINT_FINAL_NORM => {
                return Ok(Some((
                    FINAL_NORM.to_string(),
                    RuleRef {
                        transform: ShapeTransform::Identity,
                        offset: Some(PRE_NORM_OFFSET),
                    },
                )))
            }
            LM_HEAD if self.tie_word_embeddings => return Ok(None),
            LM_HEAD => return Ok(Some((LM_HEAD.to_string(), RuleRef::IDENTITY))),
            _ => {}
        }

        let unmapped = || CheckpointError::UnmappedTensor {
            checkpoint_name: name.to_string(),
            runtime_name: None,
        };
        let rest = LAYER_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .ok_or_else(unmapped)?;
        let (index, suffix) = rest.split_once('.').ok_or_else(unmapped)?;
        let layer_idx: usize = index.parse().map_err(|_| unmapped())?;
        let rule = LAYER_RULES
            .iter()
            .find(|r| r.checkpoint == suffix)
            .ok_or_else(unmapped)?;
        Ok(Some((
            format!("model.layers.{layer_idx}.{}", rule.runtime),
            RuleRef {
                transform: rule.transform,
                offset: rule.offset,
            },
        )))
    }

    fn reshape(
        &self,
        name: &str,
        transform: ShapeTransform,
        tensor: &Tensor,
    ) -> Result<Tensor, CheckpointError> {
        let heads = self.mamba_num_heads;
        let head_dim = self.head_dim;
        let d_inner = heads * head_dim;
        let expect = |expected: Vec<usize>| -> Result<(), CheckpointError> {
            if tensor.dims() != expected.as_slice() {
                return Err(CheckpointError::ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: tensor.dims().to_vec(),
                });
            }
            Ok(())
        };

        let out = match transform {
            ShapeTransform::Identity => tensor.clone(),
            ShapeTransform::BroadcastHeads => {
                expect(vec![heads])?;
                tensor
                    .unsqueeze(1)?
                    .broadcast_as((heads, head_dim))?
                    .reshape(d_inner)?
            }
            ShapeTransform::BroadcastHeadsState => {
                expect(vec![heads])?;
                tensor
                    .unsqueeze(1)?
                    .broadcast_as((heads, head_dim))?
                    .reshape((d_inner, 1))?
                    .broadcast_as((d_inner, self.d_state))?
                    .contiguous()?
            }
            ShapeTransform::RegroupInProj => {
                let hidden = tensor.dim(1).unwrap_or(0);
                expect(vec![2 * d_inner, hidden])?;
                // [2·d_inner, H] → [H, heads, 2·head_dim]
                let grouped = tensor.t()?.reshape((hidden, heads, 2 * head_dim))?;
                let gate = grouped.narrow(2, 0, head_dim)?.reshape((hidden, d_inner))?;
                let x = grouped
                    .narrow(2, head_dim, head_dim)?
                    .reshape((hidden, d_inner))?;
                Tensor::cat(&[gate, x], 1)?.t()?.contiguous()?
            }
        };
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
struct RuleRef {
    transform: ShapeTransform,
    offset: Option<f64>,
}

impl RuleRef {
    const IDENTITY: RuleRef = RuleRef {
        transform: ShapeTransform::Identity,
        offset: None,
    };
}

fn add_offset(tensor: &Tensor, offset: f64) -> candle_core::Result<Tensor> {
    let dtype = tensor.dtype();
    tensor
        .to_dtype(DType::F32)?
        .affine(1.0, offset)?
        .to_dtype(dtype)
}
