//! Which mixer each layer of the hybrid stack gets.

use std::ops::Range;

use crate::config::{ConfigError, Plamo2Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Mamba,
    Attention,
}

/// Kind of every layer in a stack of `total_layers` with alternation
/// period `period`.
///
/// Layer `i` is attention when `i % period == period / 2`. A stack too
/// shallow to reach that position gets a single attention layer at the end.
pub fn layer_kinds(total_layers: usize, period: usize) -> Result<Vec<LayerKind>, ConfigError> {
    if total_layers == 0 {
        return Err(ConfigError::EmptyStack);
    }
    if period <= 1 {
        return Err(ConfigError::InvalidMambaStep { step: period });
    }
    Ok((0..total_layers)
        .map(|i| kind_of(i, total_layers, period))
        .collect())
}

fn kind_of(layer_idx: usize, total_layers: usize, period: usize) -> LayerKind {
    let half = period / 2;
    if layer_idx % period == half || (total_layers <= half && layer_idx == total_layers - 1) {
        LayerKind::Attention
    } else {
        LayerKind::Mamba
    }
}

/// Whether layer `layer_idx` of `cfg` is recurrent. Configurations with a
/// degenerate period have no recurrent layers.
pub fn is_mamba(cfg: &Plamo2Config, layer_idx: usize) -> bool {
    if cfg.mamba_step <= 1 || layer_idx >= cfg.num_hidden_layers {
        return false;
    }
    kind_of(layer_idx, cfg.num_hidden_layers, cfg.mamba_step) == LayerKind::Mamba
}

/// Recurrent layers among `kinds[range]`.
pub fn num_mamba_layers(kinds: &[LayerKind], range: Range<usize>) -> usize {
    kinds[range]
        .iter()
        .filter(|&&k| k == LayerKind::Mamba)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use LayerKind::{Attention as A, Mamba as M};

    #[test]
    fn period_two_alternates() {
        assert_eq!(layer_kinds(4, 2).unwrap(), vec![M, A, M, A]);
    }

    #[test]
    fn period_four_places_attention_in_the_middle() {
        assert_eq!(
            layer_kinds(8, 4).unwrap(),
            vec![M, M, A, M, M, M, A, M]
        );
    }

    #[test]
    fn shallow_stack_ends_in_attention() {
        assert_eq!(layer_kinds(1, 2).unwrap(), vec![A]);
        assert_eq!(layer_kinds(2, 6).unwrap(), vec![M, A]);
        assert_eq!(layer_kinds(3, 6).unwrap(), vec![M, M, A]);
    }

    #[test]
    fn precondition_violations() {
        assert!(matches!(layer_kinds(0, 2), Err(ConfigError::EmptyStack)));
        assert!(matches!(
            layer_kinds(4, 1),
            Err(ConfigError::InvalidMambaStep { step: 1 })
        ));
    }

    #[test]
    fn deterministic_and_consistent_with_is_mamba() {
        let cfg = Plamo2Config {
            num_hidden_layers: 16,
            mamba_step: 2,
            ..Default::default()
        };
        let kinds = layer_kinds(16, 2).unwrap();
        assert_eq!(kinds, layer_kinds(16, 2).unwrap());
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(is_mamba(&cfg, i), *kind == M);
        }
        assert_eq!(num_mamba_layers(&kinds, 0..16), 8);
        assert_eq!(num_mamba_layers(&kinds, 4..7), 2);
    }
}
