pub mod attention;
pub mod mask;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use attention::{repeat_kv, AttentionBackend, SlotKvAttention};
pub use mask::causal_mask;
pub use mlp::SwiGluMlp;
pub use normalization::{rms_norm, PerHeadRmsNorm, RmsNorm};
pub use rotary::RotaryEmbedding;
