use crate::config::{Plamo2Config, RuntimeConfig};

/// Tiny PLaMo-2 config for testing (4 layers alternating Mamba/attention,
/// 32 hidden, 4 query heads over 2 KV heads). Vocabulary is deliberately
/// not a multiple of the padding so logits trimming is exercised.
pub fn tiny_plamo2_config() -> Plamo2Config {
    Plamo2Config {
        hidden_size: 32,
        num_hidden_layers: 4,
        rms_norm_eps: 1e-6,
        tie_word_embeddings: false,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        hidden_size_per_head: 8,
        max_position_embeddings: 256,
        attention_window_size: 256,
        mamba_d_state: 8,
        mamba_d_conv: 4,
        mamba_num_heads: 4,
        mamba_step: 2,
        mamba_chunk_size: 16,
        intermediate_size: 64,
        vocab_size: 100,
        rope_theta: 10000.0,
        bos_token_id: 1,
        eos_token_id: 2,
        pad_token_id: None,
        n_expert: None,
        k_expert: None,
    }
}

/// Single-worker runtime with room for 128 positions.
pub fn tiny_plamo2_runtime() -> RuntimeConfig {
    RuntimeConfig::single_gpu(128)
}
