//! Runtime parameter declarations for one worker.
//!
//! Every name here is what the layers read through their `VarBuilder`;
//! shapes are the full logical shapes after checkpoint translation.

use candle_core::{DType, Device};

use super::schedule::{layer_kinds, LayerKind};
use crate::config::{ConfigError, Plamo2Config, RuntimeConfig};
use crate::distributed::{padded_vocab_size, PipelineStageConfig, ShardPolicy};
use crate::loader::{ParameterSet, ParameterSpec, PostProcess};

/// Declare every parameter of the model. Parameters of layers outside this
/// worker's pipeline stage are declared too, as not owned, so the loader
/// can tell them apart from names that map to nothing.
pub fn declare_parameters(
    cfg: &Plamo2Config,
    runtime: &RuntimeConfig,
    dtype: DType,
    device: &Device,
) -> Result<ParameterSet, ConfigError> {
    let kinds = layer_kinds(cfg.num_hidden_layers, cfg.mamba_step)?;
    let stage = PipelineStageConfig::new(runtime.pp_rank, runtime.pp_size(), cfg.num_hidden_layers);
    let tp = runtime.tp_size();
    let mut params = ParameterSet::new(runtime.tp_rank, tp, dtype, device);

    let hidden = cfg.hidden_size;
    let vocab = ShardPolicy::Vocab {
        vocab_size: cfg.vocab_size,
        padded_vocab_size: padded_vocab_size(cfg.vocab_size, tp),
    };
    params.declare(
        ParameterSpec::new("model.embed_tokens.weight", &[cfg.vocab_size, hidden], vocab.clone())
            .owned(stage.is_first || (stage.is_last && cfg.tie_word_embeddings)),
    );

    for (layer_idx, &kind) in kinds.iter().enumerate() {
        let owned = stage.owns_layer(layer_idx);
        for spec in layer_parameters(cfg, layer_idx, kind) {
            params.declare(spec.owned(owned));
        }
    }

    params.declare(
        ParameterSpec::new(
            "model.final_layernorm.weight",
            &[hidden],
            ShardPolicy::Replicated,
        )
        .owned(stage.is_last),
    );
    if !cfg.tie_word_embeddings {
        params.declare(
            ParameterSpec::new("lm_head.weight", &[cfg.vocab_size, hidden], vocab)
                .owned(stage.is_last),
        );
    }
    Ok(params)
}

fn layer_parameters(cfg: &Plamo2Config, layer_idx: usize, kind: LayerKind) -> Vec<ParameterSpec> {
    let prefix = format!("model.layers.{layer_idx}");
    let name = |suffix: &str| format!("{prefix}.{suffix}");
    let hidden = cfg.hidden_size;
    let inter = cfg.intermediate_size;

    let mut specs = vec![
        ParameterSpec::new(name("pre_mixer_norm.weight"), &[hidden], ShardPolicy::Replicated),
        ParameterSpec::new(name("post_mixer_norm.weight"), &[hidden], ShardPolicy::Replicated),
        ParameterSpec::new(name("pre_mlp_norm.weight"), &[hidden], ShardPolicy::Replicated),
        ParameterSpec::new(name("post_mlp_norm.weight"), &[hidden], ShardPolicy::Replicated),
        ParameterSpec::new(
            name("mlp.gate_up_proj.weight"),
            &[2 * inter, hidden],
            ShardPolicy::MergedColumn(vec![inter, inter]),
        ),
        ParameterSpec::new(name("mlp.down_proj.weight"), &[hidden, inter], ShardPolicy::Row),
    ];

    match kind {
        LayerKind::Attention => {
            let head_dim = cfg.hidden_size_per_head;
            let num_heads = cfg.num_attention_heads;
            let num_kv_heads = cfg.num_key_value_heads;
            specs.extend([
                ParameterSpec::new(
                    name("qkv_proj.weight"),
                    &[(num_heads + 2 * num_kv_heads) * head_dim, hidden],
                    ShardPolicy::Qkv {
                        num_heads,
                        num_kv_heads,
                        head_dim,
                    },
                ),
                ParameterSpec::new(
                    name("o_proj.weight"),
                    &[hidden, num_heads * head_dim],
                    ShardPolicy::Row,
                ),
                ParameterSpec::new(
                    name("q_norm.weight"),
                    &[num_heads, head_dim],
                    ShardPolicy::Column,
                ),
                ParameterSpec::new(
                    name("k_norm.weight"),
                    &[num_kv_heads, head_dim],
                    ShardPolicy::KvHeads { num_kv_heads },
                ),
            ]);
        }
        LayerKind::Mamba => {
            let d_inner = cfg.mamba_intermediate_size();
            let d_state = cfg.mamba_d_state;
            let rank = cfg.time_step_rank();
            let heads = cfg.mamba_num_heads;
            specs.extend([
                ParameterSpec::new(
                    name("mamba.in_proj.weight"),
                    &[2 * d_inner, hidden],
                    ShardPolicy::MergedColumn(vec![d_inner, d_inner]),
                ),
                ParameterSpec::new(
                    name("mamba.conv1d.weight"),
                    &[d_inner, 1, cfg.mamba_d_conv],
                    ShardPolicy::Column,
                ),
                ParameterSpec::new(
                    name("mamba.x_proj.weight"),
                    &[2 * d_state + rank, d_inner],
                    ShardPolicy::Row,
                ),
                ParameterSpec::new(name("mamba.dt_proj.weight"), &[heads, rank], ShardPolicy::Column),
                ParameterSpec::new(name("mamba.dt_proj.bias"), &[heads], ShardPolicy::Column),
                ParameterSpec::new(name("mamba.A"), &[d_inner, d_state], ShardPolicy::Column)
                    .with_post(PostProcess::NegExp)
                    .with_dtype(DType::F32),
                ParameterSpec::new(name("mamba.D"), &[d_inner], ShardPolicy::Column)
                    .with_dtype(DType::F32),
                ParameterSpec::new(
                    name("mamba.dt_layernorm.weight"),
                    &[rank],
                    ShardPolicy::Replicated,
                ),
                ParameterSpec::new(
                    name("mamba.b_layernorm.weight"),
                    &[d_state],
                    ShardPolicy::Replicated,
                ),
                ParameterSpec::new(
                    name("mamba.c_layernorm.weight"),
                    &[d_state],
                    ShardPolicy::Replicated,
                ),
                ParameterSpec::new(
                    name("mamba.out_proj.weight"),
                    &[hidden, d_inner],
                    ShardPolicy::Row,
                ),
            ]);
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Plamo2Config {
        Plamo2Config {
            hidden_size: 16,
            num_hidden_layers: 4,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            hidden_size_per_head: 8,
            mamba_num_heads: 2,
            mamba_d_state: 4,
            intermediate_size: 32,
            vocab_size: 40,
            ..Default::default()
        }
    }

    #[test]
    fn declares_each_layer_by_kind() {
        let cfg = tiny();
        let params =
            declare_parameters(&cfg, &RuntimeConfig::single_gpu(32), DType::F32, &Device::Cpu)
                .unwrap();
        // layer 0 is recurrent, layer 1 attention
        assert!(params.spec("model.layers.0.mamba.A").is_some());
        assert!(params.spec("model.layers.0.qkv_proj.weight").is_none());
        assert!(params.spec("model.layers.1.qkv_proj.weight").is_some());
        assert!(params.spec("model.layers.1.mamba.A").is_none());

        let a = params.spec("model.layers.2.mamba.A").unwrap();
        assert_eq!(a.shape, vec![16, 4]);
        assert_eq!(a.post, PostProcess::NegExp);
        assert_eq!(a.dtype, Some(DType::F32));
        // time_step_rank bottoms out at 64
        assert_eq!(
            params.spec("model.layers.0.mamba.x_proj.weight").unwrap().shape,
            vec![2 * 4 + 64, 16]
        );
        assert!(params.spec("lm_head.weight").is_some());
        assert_eq!(params.num_owned(), params.len());
    }

    #[test]
    fn pipeline_stage_owns_its_range_only() {
        let cfg = Plamo2Config {
            tie_word_embeddings: true,
            ..tiny()
        };
        let first = declare_parameters(
            &cfg,
            &RuntimeConfig::pipeline_stage(0, 2, 32),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        assert!(first.spec("model.layers.1.o_proj.weight").unwrap().owned);
        assert!(!first.spec("model.layers.2.mamba.D").unwrap().owned);
        assert!(!first.spec("model.final_layernorm.weight").unwrap().owned);
        assert!(first.spec("model.embed_tokens.weight").unwrap().owned);
        assert!(first.spec("lm_head.weight").is_none());

        // the last stage keeps the table for the tied output head
        let last = declare_parameters(
            &cfg,
            &RuntimeConfig::pipeline_stage(1, 2, 32),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        assert!(last.spec("model.embed_tokens.weight").unwrap().owned);
        assert!(!last.spec("model.layers.0.mamba.A").unwrap().owned);
        assert!(last.spec("model.final_layernorm.weight").unwrap().owned);
    }
}
