//! Checkpoint loading.
//!
//! A checkpoint is a stream of `(name, tensor)` pairs in the published
//! layout. [`CheckpointTranslator`] maps each one onto a runtime parameter
//! (renaming, reshaping, norm offsets); [`ParameterSet`] checks it against
//! the declared shape, cuts the local shard and stores it exactly once.
//! The hydrated set is then turned into a `VarBuilder` for model
//! construction.

mod params;
mod safetensors;
mod translate;

use candle_core::Tensor;
use thiserror::Error;

use crate::distributed::DistributedError;

pub use params::{ParameterSet, ParameterSpec, PostProcess};
pub use safetensors::SafetensorsCheckpoint;
pub use translate::{
    CheckpointTranslator, ShapeTransform, POST_MIXER_NORM_OFFSET, POST_MLP_NORM_OFFSET,
    PRE_NORM_OFFSET,
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(
        "checkpoint tensor {checkpoint_name} has no runtime parameter{}",
        translated_suffix(.runtime_name)
    )]
    UnmappedTensor {
        checkpoint_name: String,
        runtime_name: Option<String>,
    },

    #[error("parameter {0} was loaded twice")]
    AlreadyHydrated(String),

    #[error("parameters missing from checkpoint: {}", .0.join(", "))]
    Unhydrated(Vec<String>),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("sharding {name}: {source}")]
    Shard {
        name: String,
        #[source]
        source: DistributedError,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

fn translated_suffix(runtime_name: &Option<String>) -> String {
    runtime_name
        .as_ref()
        .map(|n| format!(" (translated to {n})"))
        .unwrap_or_default()
}

/// Counts reported after a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub hydrated: usize,
    /// Parameters owned by other pipeline stages.
    pub skipped_other_stage: usize,
    /// Tensors dropped by translation (tied LM head).
    pub dropped: usize,
}

/// Translate and hydrate every tensor of `checkpoint` into `params`.
///
/// Fails on the first tensor that maps to nothing, on shape mismatches and
/// duplicates, and at the end if any parameter this stage owns was never
/// provided.
pub fn load_weights<I>(
    params: &mut ParameterSet,
    translator: &CheckpointTranslator,
    checkpoint: I,
) -> Result<LoadSummary, CheckpointError>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    let mut summary = LoadSummary::default();
    for (name, tensor) in checkpoint {
        load_tensor(params, translator, &name, &tensor, &mut summary)?;
    }
    finish_load(params, summary)
}

pub(crate) fn load_tensor(
    params: &mut ParameterSet,
    translator: &CheckpointTranslator,
    name: &str,
    tensor: &Tensor,
    summary: &mut LoadSummary,
) -> Result<(), CheckpointError> {
    let Some((runtime_name, value)) = translator.translate(name, tensor)? else {
        tracing::debug!(checkpoint_name = name, "dropping tensor tied to the embedding");
        summary.dropped += 1;
        return Ok(());
    };
    let Some(spec) = params.spec(&runtime_name) else {
        return Err(CheckpointError::UnmappedTensor {
            checkpoint_name: name.to_string(),
            runtime_name: Some(runtime_name),
        });
    };
    if !spec.owned {
        tracing::debug!(
            parameter = %runtime_name,
            "skipping parameter owned by another pipeline stage"
        );
        summary.skipped_other_stage += 1;
        return Ok(());
    }
    params.hydrate(&runtime_name, &value)?;
    summary.hydrated += 1;
    Ok(())
}

pub(crate) fn finish_load(
    params: &ParameterSet,
    summary: LoadSummary,
) -> Result<LoadSummary, CheckpointError> {
    let missing = params.missing();
    if !missing.is_empty() {
        return Err(CheckpointError::Unhydrated(missing));
    }
    tracing::info!(
        hydrated = summary.hydrated,
        skipped_other_stage = summary.skipped_other_stage,
        dropped = summary.dropped,
        "checkpoint loaded"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::config::{Plamo2Config, RuntimeConfig};
    use crate::models::plamo2::declare_parameters;
    use crate::testing::{synthetic_checkpoint, tiny_plamo2_config};

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn plus(raw: &Tensor, offset: f64) -> Vec<f32> {
        values(raw).iter().map(|v| (*v as f64 + offset) as f32).collect()
    }

    /// Rows of `raw` followed by zero rows up to `rows`.
    fn zero_padded(raw: &Tensor, rows: usize) -> Vec<f32> {
        let mut out = values(raw);
        out.resize(rows * raw.dim(1).unwrap(), 0.0);
        out
    }

    fn layer_tensor<'a>(raw: &'a HashMap<String, Tensor>, layer: &str, suffix: &str) -> &'a Tensor {
        &raw[&format!("model.layers.layers.{layer}.{suffix}")]
    }

    /// What a runtime parameter must hold, computed from the raw
    /// checkpoint tensors without going through the translator.
    fn expected_value(
        cfg: &Plamo2Config,
        raw: &HashMap<String, Tensor>,
        name: &str,
        padded_vocab: usize,
    ) -> Vec<f32> {
        match name {
            "model.embed_tokens.weight" => {
                return zero_padded(&raw["model.embed_tokens.weight"], padded_vocab)
            }
            "lm_head.weight" => return zero_padded(&raw["lm_head.weight"], padded_vocab),
            "model.final_layernorm.weight" => return plus(&raw["model.norm.weight"], 1.0),
            _ => {}
        }
        let rest = name.strip_prefix("model.layers.").unwrap();
        let (layer, suffix) = rest.split_once('.').unwrap();
        let ckpt = |s: &str| layer_tensor(raw, layer, s);

        let hd = cfg.hidden_size_per_head;
        let d_inner = cfg.mamba_intermediate_size();
        match suffix {
            "pre_mixer_norm.weight" => plus(ckpt("pre_mixer_norm.weight"), 1.0),
            "post_mixer_norm.weight" => plus(ckpt("post_mixer_norm.weight"), 1.0 / 5.0),
            "pre_mlp_norm.weight" => plus(ckpt("pre_mlp_norm.weight"), 1.0),
            "post_mlp_norm.weight" => plus(ckpt("post_mlp_norm.weight"), 5f64.powf(-1.5)),
            "qkv_proj.weight" => values(ckpt("mixer.qkv_proj.weight")),
            "o_proj.weight" => values(ckpt("mixer.o_proj.weight")),
            "q_norm.weight" => values(ckpt("mixer.q_weight")),
            "k_norm.weight" => values(ckpt("mixer.k_weight")),
            "mamba.A" => {
                let a_log = values(ckpt("mixer.A_log"));
                (0..d_inner)
                    .flat_map(|c| {
                        let a = -a_log[c / hd].exp();
                        std::iter::repeat(a).take(cfg.mamba_d_state)
                    })
                    .collect()
            }
            "mamba.D" => {
                let d = values(ckpt("mixer.D"));
                (0..d_inner).map(|c| d[c / hd]).collect()
            }
            "mamba.in_proj.weight" => {
                // checkpoint rows per head: [gate_h | x_h]
                let w = ckpt("mixer.in_proj.weight");
                let rows: Vec<Vec<f32>> = w.to_vec2().unwrap();
                let source_row = |r: usize| {
                    let (half, c) = (r / d_inner, r % d_inner);
                    (c / hd) * 2 * hd + half * hd + c % hd
                };
                (0..2 * d_inner)
                    .flat_map(|r| rows[source_row(r)].clone())
                    .collect()
            }
            "mamba.b_layernorm.weight" => values(ckpt("mixer.B_norm_weight")),
            "mamba.c_layernorm.weight" => values(ckpt("mixer.C_norm_weight")),
            "mamba.dt_layernorm.weight" => values(ckpt("mixer.dt_norm_weight")),
            "mamba.x_proj.weight" => values(ckpt("mixer.bcdt_proj.weight")),
            "mamba.conv1d.weight" => values(ckpt("mixer.conv1d.weight")),
            "mamba.out_proj.weight" => values(ckpt("mixer.out_proj.weight")),
            "mamba.dt_proj.weight" => values(ckpt("mixer.dt_proj.weight")),
            "mamba.dt_proj.bias" => values(ckpt("mixer.dt_bias")),
            other => panic!("no expectation for {other}"),
        }
    }

    #[test]
    fn every_parameter_holds_its_translated_checkpoint_value() {
        let cfg = tiny_plamo2_config();
        let runtime = RuntimeConfig::single_gpu(128);
        let mut checkpoint = synthetic_checkpoint(&cfg).unwrap();

        // distinct per-head skip weights so the D broadcast is observable
        let heads = cfg.mamba_num_heads;
        for (name, tensor) in checkpoint.iter_mut() {
            if name.ends_with(".mixer.D") {
                let d: Vec<f32> = (0..heads).map(|h| 0.5 + h as f32).collect();
                *tensor = Tensor::from_vec(d, heads, &Device::Cpu).unwrap();
            }
        }
        let raw: HashMap<String, Tensor> = checkpoint.iter().cloned().collect();

        // later layers use the flat prefix; both forms must land on the same names
        let checkpoint: Vec<(String, Tensor)> = checkpoint
            .into_iter()
            .map(|(name, t)| {
                let name = match name.strip_prefix("model.layers.layers.") {
                    Some(rest) if rest.starts_with("2.") || rest.starts_with("3.") => {
                        format!("model.layers.{rest}")
                    }
                    _ => name,
                };
                (name, t)
            })
            .collect();

        let mut params = declare_parameters(&cfg, &runtime, DType::F32, &Device::Cpu).unwrap();
        let translator = CheckpointTranslator::new(&cfg);
        let summary = load_weights(&mut params, &translator, checkpoint).unwrap();
        assert_eq!(summary.hydrated, params.num_owned());
        assert_eq!(summary.hydrated, params.len());
        assert_eq!(summary.skipped_other_stage, 0);
        assert_eq!(summary.dropped, 0);

        let padded_vocab = 112;
        for spec in params.specs() {
            let got = values(params.get(&spec.name).unwrap());
            let want = expected_value(&cfg, &raw, &spec.name, padded_vocab);
            assert_eq!(got.len(), want.len(), "{}", spec.name);
            for (i, (g, w)) in got.iter().zip(&want).enumerate() {
                assert!(
                    (g - w).abs() <= 1e-6 * w.abs().max(1.0),
                    "{} element {i}: {g} vs {w}",
                    spec.name
                );
            }
        }
    }
}
