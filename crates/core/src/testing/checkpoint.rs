use candle_core::{DType, Device, Result, Tensor};

use crate::config::Plamo2Config;
use crate::models::plamo2::{layer_kinds, LayerKind};

fn randn(shape: &[usize], std: f32) -> Result<Tensor> {
    Tensor::randn(0f32, std, shape, &Device::Cpu)
}

/// Random weights for `cfg` under the names and layouts of a published
/// checkpoint (nested layer prefix, per-head in_proj grouping, per-head
/// `A_log`/`D`, norm weights stored without their offsets).
///
/// Always includes `lm_head.weight`; loaders drop it for tied configs.
pub fn synthetic_checkpoint(cfg: &Plamo2Config) -> Result<Vec<(String, Tensor)>> {
    let h = cfg.hidden_size;
    let inter = cfg.intermediate_size;
    let hd = cfg.hidden_size_per_head;
    let d_inner = cfg.mamba_intermediate_size();
    let d_state = cfg.mamba_d_state;
    let rank = cfg.time_step_rank();
    let heads = cfg.mamba_num_heads;
    let proj_std = 1.0 / (h as f32).sqrt();

    let kinds = layer_kinds(cfg.num_hidden_layers, cfg.mamba_step)
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

    let mut out = vec![
        ("model.embed_tokens.weight".to_string(), randn(&[cfg.vocab_size, h], 1.0)?),
        ("model.norm.weight".to_string(), randn(&[h], 0.1)?),
        ("lm_head.weight".to_string(), randn(&[cfg.vocab_size, h], proj_std)?),
    ];

    for (i, kind) in kinds.into_iter().enumerate() {
        let name = |suffix: &str| format!("model.layers.layers.{i}.{suffix}");
        out.extend([
            (name("pre_mixer_norm.weight"), randn(&[h], 0.1)?),
            (name("post_mixer_norm.weight"), randn(&[h], 0.1)?),
            (name("pre_mlp_norm.weight"), randn(&[h], 0.1)?),
            (name("post_mlp_norm.weight"), randn(&[h], 0.1)?),
            (name("mlp.gate_up_proj.weight"), randn(&[2 * inter, h], proj_std)?),
            (
                name("mlp.down_proj.weight"),
                randn(&[h, inter], 1.0 / (inter as f32).sqrt())?,
            ),
        ]);
        match kind {
            LayerKind::Attention => {
                let nh = cfg.num_attention_heads;
                let nkv = cfg.num_key_value_heads;
                out.extend([
                    (name("mixer.qkv_proj.weight"), randn(&[(nh + 2 * nkv) * hd, h], proj_std)?),
                    (name("mixer.o_proj.weight"), randn(&[h, nh * hd], proj_std)?),
                    (name("mixer.q_weight"), (randn(&[nh, hd], 0.1)? + 1.0)?),
                    (name("mixer.k_weight"), (randn(&[nkv, hd], 0.1)? + 1.0)?),
                ]);
            }
            LayerKind::Mamba => {
                let a_log: Vec<f32> = (0..heads)
                    .map(|k| -1.0 + 1.5 * k as f32 / heads as f32)
                    .collect();
                let a_log = Tensor::from_vec(a_log, heads, &Device::Cpu)?;
                out.extend([
                    (name("mixer.in_proj.weight"), randn(&[2 * d_inner, h], proj_std)?),
                    (
                        name("mixer.conv1d.weight"),
                        randn(&[d_inner, 1, cfg.mamba_d_conv], 0.5)?,
                    ),
                    (
                        name("mixer.bcdt_proj.weight"),
                        randn(&[2 * d_state + rank, d_inner], 1.0 / (d_inner as f32).sqrt())?,
                    ),
                    (name("mixer.dt_proj.weight"), randn(&[heads, rank], 0.1)?),
                    (name("mixer.dt_bias"), randn(&[heads], 0.5)?),
                    (name("mixer.A_log"), a_log),
                    (name("mixer.D"), Tensor::ones(heads, DType::F32, &Device::Cpu)?),
                    (name("mixer.B_norm_weight"), (randn(&[d_state], 0.1)? + 1.0)?),
                    (name("mixer.C_norm_weight"), (randn(&[d_state], 0.1)? + 1.0)?),
                    (name("mixer.dt_norm_weight"), (randn(&[rank], 0.1)? + 1.0)?),
                    (
                        name("mixer.out_proj.weight"),
                        randn(&[h, d_inner], 1.0 / (d_inner as f32).sqrt())?,
                    ),
                ]);
            }
        }
    }
    Ok(out)
}

/// `[ids.len()]` u32 token tensor on the CPU.
pub fn tokens(ids: &[u32]) -> Result<Tensor> {
    Tensor::new(ids, &Device::Cpu)
}
