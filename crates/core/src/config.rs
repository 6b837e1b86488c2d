use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::distributed::ParallelConfig;

/// Errors raised while validating a model/runtime configuration pair.
///
/// All of these are fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mamba_step must be > 1, got {step}")]
    InvalidMambaStep { step: usize },

    #[error("mamba_d_conv must be >= 2, got {d_conv}")]
    InvalidConvWidth { d_conv: usize },

    #[error("num_hidden_layers must be > 0")]
    EmptyStack,

    #[error("mixture-of-experts is not supported (num_experts = {num_experts})")]
    MoeUnsupported { num_experts: usize },

    #[error("prefix caching is not supported for hybrid state-space models")]
    PrefixCachingUnsupported,

    #[error("{what} ({value}) must be divisible by {divisor}")]
    NotDivisible {
        what: &'static str,
        value: usize,
        divisor: usize,
    },

    #[error(
        "num_key_value_heads ({num_kv_heads}) and tensor_parallel_size ({tp}) \
         must divide one another"
    )]
    KvHeadsIncompatible { num_kv_heads: usize, tp: usize },

    #[error("num_hidden_layers ({layers}) must be >= pipeline_parallel_size ({stages})")]
    TooFewLayers { layers: usize, stages: usize },

    #[error("rank {rank} out of range for group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// HuggingFace-style `config.json` for PLaMo-2 checkpoints.
///
/// Missing fields fall back to the published 8B defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Plamo2Config {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub rms_norm_eps: f64,
    pub tie_word_embeddings: bool,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub hidden_size_per_head: usize,
    pub max_position_embeddings: usize,
    pub attention_window_size: usize,
    pub mamba_d_state: usize,
    pub mamba_d_conv: usize,
    pub mamba_num_heads: usize,
    pub mamba_step: usize,
    pub mamba_chunk_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub rope_theta: f64,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub pad_token_id: Option<u32>,
    #[serde(alias = "num_experts")]
    pub n_expert: Option<usize>,
    pub k_expert: Option<usize>,
}

impl Default for Plamo2Config {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            num_hidden_layers: 32,
            rms_norm_eps: 1e-6,
            tie_word_embeddings: false,
            num_attention_heads: 32,
            num_key_value_heads: 4,
            hidden_size_per_head: 128,
            max_position_embeddings: 2048,
            attention_window_size: 2048,
            mamba_d_state: 64,
            mamba_d_conv: 4,
            mamba_num_heads: 64,
            mamba_step: 2,
            mamba_chunk_size: 256,
            intermediate_size: 13312,
            vocab_size: 32000,
            rope_theta: 10000.0,
            bos_token_id: 1,
            eos_token_id: 2,
            pad_token_id: None,
            n_expert: None,
            k_expert: None,
        }
    }
}

impl Plamo2Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read `config.json` from disk.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Channel count of the recurrent mixer (all workers).
    pub fn mamba_intermediate_size(&self) -> usize {
        self.mamba_num_heads * self.hidden_size_per_head
    }

    /// Width of the low-rank time-step signal produced by `x_proj`.
    pub fn time_step_rank(&self) -> usize {
        (self.hidden_size / 16).max(64)
    }

    /// Check that this model can run under `runtime`.
    pub fn validate(&self, runtime: &RuntimeConfig) -> Result<(), ConfigError> {
        if self.num_hidden_layers == 0 {
            return Err(ConfigError::EmptyStack);
        }
        if self.mamba_step <= 1 {
            return Err(ConfigError::InvalidMambaStep {
                step: self.mamba_step,
            });
        }
        if self.mamba_d_conv < 2 {
            return Err(ConfigError::InvalidConvWidth {
                d_conv: self.mamba_d_conv,
            });
        }
        if let Some(num_experts) = self.n_expert {
            if num_experts > 1 {
                return Err(ConfigError::MoeUnsupported { num_experts });
            }
        }
        if runtime.enable_prefix_caching {
            return Err(ConfigError::PrefixCachingUnsupported);
        }

        let tp = runtime.parallel.tensor_parallel_size;
        let pp = runtime.parallel.pipeline_parallel_size;
        if runtime.tp_rank >= tp {
            return Err(ConfigError::InvalidRank {
                rank: runtime.tp_rank,
                size: tp,
            });
        }
        if runtime.pp_rank >= pp {
            return Err(ConfigError::InvalidRank {
                rank: runtime.pp_rank,
                size: pp,
            });
        }
        if self.num_hidden_layers < pp {
            return Err(ConfigError::TooFewLayers {
                layers: self.num_hidden_layers,
                stages: pp,
            });
        }

        check_divisible("num_attention_heads", self.num_attention_heads, tp)?;
        check_divisible("mamba_num_heads", self.mamba_num_heads, tp)?;
        check_divisible("intermediate_size", self.intermediate_size, tp)?;
        check_divisible(
            "num_attention_heads",
            self.num_attention_heads,
            self.num_key_value_heads,
        )?;
        let nkv = self.num_key_value_heads;
        if nkv == 0 || (nkv % tp != 0 && tp % nkv != 0) {
            return Err(ConfigError::KvHeadsIncompatible {
                num_kv_heads: nkv,
                tp,
            });
        }
        check_divisible("hidden_size_per_head", self.hidden_size_per_head, 2)?;
        Ok(())
    }
}

fn check_divisible(what: &'static str, value: usize, divisor: usize) -> Result<(), ConfigError> {
    if divisor == 0 || value % divisor != 0 {
        return Err(ConfigError::NotDivisible {
            what,
            value,
            divisor,
        });
    }
    Ok(())
}

/// Deployment-side settings: worker layout and cache options.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub parallel: ParallelConfig,
    /// This worker's rank in its tensor-parallel group.
    pub tp_rank: usize,
    /// This worker's pipeline stage.
    pub pp_rank: usize,
    pub enable_prefix_caching: bool,
    /// Longest sequence the scheduler will admit; sizes the rotary table.
    pub max_model_len: usize,
}

impl RuntimeConfig {
    pub fn single_gpu(max_model_len: usize) -> Self {
        Self {
            parallel: ParallelConfig::no_parallelism(),
            tp_rank: 0,
            pp_rank: 0,
            enable_prefix_caching: false,
            max_model_len,
        }
    }

    /// One stage of a pipeline-parallel deployment (no tensor parallelism).
    pub fn pipeline_stage(pp_rank: usize, num_stages: usize, max_model_len: usize) -> Self {
        Self {
            parallel: ParallelConfig::pipeline_parallel(num_stages),
            pp_rank,
            ..Self::single_gpu(max_model_len)
        }
    }

    /// One worker of a tensor-parallel group (single pipeline stage).
    pub fn tensor_rank(tp_rank: usize, tp_size: usize, max_model_len: usize) -> Self {
        Self {
            parallel: ParallelConfig::tensor_parallel(tp_size),
            tp_rank,
            ..Self::single_gpu(max_model_len)
        }
    }

    pub fn tp_size(&self) -> usize {
        self.parallel.tensor_parallel_size
    }

    pub fn pp_size(&self) -> usize {
        self.parallel.pipeline_parallel_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAMO2_1B_CONFIG: &str = r#"{
        "architectures": ["Plamo2ForCausalLM"],
        "attention_window_size": 2048,
        "bos_token_id": 1,
        "eos_token_id": 1,
        "hidden_size": 2048,
        "hidden_size_per_head": 128,
        "intermediate_size": 8192,
        "mamba_chunk_size": 256,
        "mamba_d_conv": 4,
        "mamba_d_state": 64,
        "mamba_enabled": true,
        "mamba_num_heads": 32,
        "mamba_step": 2,
        "max_position_embeddings": 10485760,
        "model_type": "plamo2",
        "num_attention_heads": 16,
        "num_hidden_layers": 16,
        "num_key_value_heads": 1,
        "pad_token_id": 3,
        "rms_norm_eps": 1e-06,
        "rope_theta": 10000,
        "tie_word_embeddings": true,
        "torch_dtype": "bfloat16",
        "vocab_size": 100000
    }"#;

    #[test]
    fn parse_plamo2_1b_config() {
        let config = Plamo2Config::from_json_str(PLAMO2_1B_CONFIG).expect("parse");
        assert_eq!(config.hidden_size, 2048);
        assert_eq!(config.num_hidden_layers, 16);
        assert_eq!(config.num_attention_heads, 16);
        assert_eq!(config.num_key_value_heads, 1);
        assert_eq!(config.mamba_num_heads, 32);
        assert_eq!(config.mamba_d_state, 64);
        assert_eq!(config.vocab_size, 100000);
        assert_eq!(config.pad_token_id, Some(3));
        assert!(config.tie_word_embeddings);
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.mamba_intermediate_size(), 32 * 128);
        // hidden/16 = 128 > 64
        assert_eq!(config.time_step_rank(), 128);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config = Plamo2Config::from_json_str(r#"{"hidden_size": 512}"#).expect("parse");
        assert_eq!(config.hidden_size, 512);
        assert_eq!(config.num_hidden_layers, 32);
        assert_eq!(config.mamba_d_conv, 4);
        assert_eq!(config.intermediate_size, 13312);
        assert_eq!(config.time_step_rank(), 64);
        assert!(config.n_expert.is_none());
    }

    #[test]
    fn default_config_validates_single_gpu() {
        let config = Plamo2Config::default();
        config
            .validate(&RuntimeConfig::single_gpu(4096))
            .expect("default config is valid");
    }

    #[test]
    fn rejects_mamba_step_of_one() {
        let config = Plamo2Config {
            mamba_step: 1,
            ..Default::default()
        };
        let err = config
            .validate(&RuntimeConfig::single_gpu(128))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMambaStep { step: 1 }));
    }

    #[test]
    fn rejects_moe() {
        let config = Plamo2Config {
            n_expert: Some(8),
            ..Default::default()
        };
        let err = config
            .validate(&RuntimeConfig::single_gpu(128))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MoeUnsupported { num_experts: 8 }));

        let single_expert = Plamo2Config {
            n_expert: Some(1),
            ..Default::default()
        };
        assert!(single_expert
            .validate(&RuntimeConfig::single_gpu(128))
            .is_ok());
    }

    #[test]
    fn rejects_conv_width_below_two() {
        for d_conv in [0, 1] {
            let config = Plamo2Config {
                mamba_d_conv: d_conv,
                ..Default::default()
            };
            let err = config
                .validate(&RuntimeConfig::single_gpu(128))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidConvWidth { d_conv: w } if w == d_conv));
        }
        let narrow = Plamo2Config {
            mamba_d_conv: 2,
            ..Default::default()
        };
        assert!(narrow.validate(&RuntimeConfig::single_gpu(128)).is_ok());
    }

    #[test]
    fn num_experts_key_is_read_as_expert_count() {
        let config =
            Plamo2Config::from_json_str(r#"{"num_experts": 8}"#).expect("parse");
        assert_eq!(config.n_expert, Some(8));
        let err = config
            .validate(&RuntimeConfig::single_gpu(128))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MoeUnsupported { num_experts: 8 }));

        let config = Plamo2Config::from_json_str(r#"{"n_expert": 2}"#).expect("parse");
        assert_eq!(config.n_expert, Some(2));
    }

    #[test]
    fn rejects_prefix_caching() {
        let runtime = RuntimeConfig {
            enable_prefix_caching: true,
            ..RuntimeConfig::single_gpu(128)
        };
        let err = Plamo2Config::default().validate(&runtime).unwrap_err();
        assert!(matches!(err, ConfigError::PrefixCachingUnsupported));
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = Plamo2Config {
            mamba_num_heads: 6,
            ..Default::default()
        };
        let err = config
            .validate(&RuntimeConfig::tensor_rank(0, 4, 128))
            .unwrap_err();
        assert!(err.to_string().contains("divisible"), "{err}");
    }

    #[test]
    fn kv_heads_may_be_replicated_across_workers() {
        // 4 KV heads over 8 workers: each KV head lives on two workers
        let config = Plamo2Config::default();
        assert!(config
            .validate(&RuntimeConfig::tensor_rank(3, 8, 128))
            .is_ok());

        let odd = Plamo2Config {
            num_attention_heads: 24,
            num_key_value_heads: 3,
            ..Default::default()
        };
        let err = odd
            .validate(&RuntimeConfig::tensor_rank(0, 8, 128))
            .unwrap_err();
        assert!(matches!(err, ConfigError::KvHeadsIncompatible { .. }));
    }

    #[test]
    fn rejects_more_stages_than_layers() {
        let config = Plamo2Config {
            num_hidden_layers: 2,
            ..Default::default()
        };
        let err = config
            .validate(&RuntimeConfig::pipeline_stage(0, 4, 128))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TooFewLayers { .. }));
    }
}
