//! Attention masks derived from a cache's key layout.
//!
//! Queries are always the newest `n` positions, i.e. `max_key - n + 1 ..=
//! max_key`. A query at absolute position `q` may attend a key at `p` iff
//!
//! ```text
//! q - window < p <= q        (window = infinity for global layers)
//! ```

use crate::cache::KeyLayout;
use crate::error::{CadenceError, Result};
use candle_core::{DType, Device, Tensor};

/// Mask handed to scaled dot-product attention.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// Every key is visible.
    None,
    /// Lower-triangular over contiguous keys, materialized by the attention kernel.
    Causal,
    /// Boolean `[queries, keys]` matrix, `u8` with 1 meaning visible.
    Explicit(Tensor),
}

impl AttentionMask {
    /// True for [`AttentionMask::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Additive `[queries, keys]` mask (0 visible, -inf hidden), if any.
    pub fn to_additive(
        &self,
        n_queries: usize,
        n_keys: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        match self {
            Self::None => Ok(None),
            Self::Causal => {
                if n_queries > n_keys {
                    return Err(CadenceError::ShapeMismatch(format!(
                        "causal mask with {} queries over {} keys",
                        n_queries, n_keys
                    )));
                }
                let past = n_keys - n_queries;
                let data: Vec<f32> = (0..n_queries)
                    .flat_map(|i| {
                        (0..n_keys).map(move |j| if j <= i + past { 0.0 } else { f32::NEG_INFINITY })
                    })
                    .collect();
                Ok(Some(Tensor::from_vec(data, (n_queries, n_keys), device)?))
            }
            Self::Explicit(allowed) => {
                let (rows, cols) = allowed.dims2()?;
                if rows != n_queries || cols != n_keys {
                    return Err(CadenceError::ShapeMismatch(format!(
                        "mask is [{}, {}] but attention is [{}, {}]",
                        rows, cols, n_queries, n_keys
                    )));
                }
                let zeros = Tensor::zeros((rows, cols), DType::F32, device)?;
                let hidden = Tensor::full(f32::NEG_INFINITY, (rows, cols), device)?;
                Ok(Some(allowed.where_cond(&zeros, &hidden)?))
            }
        }
    }
}

/// Build the mask for `n_queries` new tokens against keys laid out as `layout`.
pub fn build_attention_mask(
    n_queries: usize,
    layout: &KeyLayout,
    window: Option<usize>,
    device: &Device,
) -> Result<AttentionMask> {
    let (min_pos, max_pos) = layout.bounds().ok_or_else(|| {
        CadenceError::EmptyInput("cannot build a mask over an empty cache".to_string())
    })?;
    if n_queries == 0 || n_queries > max_pos + 1 {
        return Err(CadenceError::InvalidInput(format!(
            "{} queries cannot end at position {}",
            n_queries, max_pos
        )));
    }

    // No key is ever outside the window of any query
    let window_hides_nothing = window.map_or(true, |w| max_pos - min_pos < w);

    if window_hides_nothing && n_queries == 1 {
        return Ok(AttentionMask::None);
    }
    if window_hides_nothing && matches!(layout, KeyLayout::Contiguous { .. }) {
        return Ok(AttentionMask::Causal);
    }

    let positions = layout.positions();
    let first_query = max_pos + 1 - n_queries;
    let mut allowed = Vec::with_capacity(n_queries * positions.len());
    for q in first_query..=max_pos {
        for &p in &positions {
            let visible = p <= q && window.map_or(true, |w| p + w > q);
            allowed.push(u8::from(visible));
        }
    }
    let mask = Tensor::from_vec(allowed, (n_queries, positions.len()), device)?;
    Ok(AttentionMask::Explicit(mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit(mask: AttentionMask) -> Vec<Vec<u8>> {
        match mask {
            AttentionMask::Explicit(t) => t.to_vec2().unwrap(),
            other => panic!("expected explicit mask, got {:?}", other),
        }
    }

    #[test]
    fn single_query_needs_no_mask() {
        let layout = KeyLayout::Contiguous { start: 0, len: 9 };
        let mask = build_attention_mask(1, &layout, None, &Device::Cpu).unwrap();
        assert!(mask.is_none());

        // A full ring of the window size hides nothing either
        let ring = KeyLayout::Scattered(vec![8, 5, 6, 7]);
        let mask = build_attention_mask(1, &ring, Some(4), &Device::Cpu).unwrap();
        assert!(mask.is_none());
    }

    #[test]
    fn single_query_outside_window_is_explicit() {
        let layout = KeyLayout::Contiguous { start: 0, len: 6 };
        let rows = explicit(build_attention_mask(1, &layout, Some(4), &Device::Cpu).unwrap());
        assert_eq!(rows, vec![vec![0, 0, 1, 1, 1, 1]]);
    }

    #[test]
    fn prefill_uses_implicit_causal() {
        let layout = KeyLayout::Contiguous { start: 0, len: 7 };
        let mask = build_attention_mask(7, &layout, None, &Device::Cpu).unwrap();
        assert!(matches!(mask, AttentionMask::Causal));

        // Window larger than the prompt changes nothing
        let mask = build_attention_mask(7, &layout, Some(16), &Device::Cpu).unwrap();
        assert!(matches!(mask, AttentionMask::Causal));
    }

    #[test]
    fn windowed_prefill_is_banded() {
        let layout = KeyLayout::Contiguous { start: 0, len: 5 };
        let rows = explicit(build_attention_mask(5, &layout, Some(3), &Device::Cpu).unwrap());
        assert_eq!(
            rows,
            vec![
                vec![1, 0, 0, 0, 0],
                vec![1, 1, 0, 0, 0],
                vec![1, 1, 1, 0, 0],
                vec![0, 1, 1, 1, 0],
                vec![0, 0, 1, 1, 1],
            ]
        );
    }

    #[test]
    fn rotated_ring_uses_absolute_positions() {
        // Sinks [0] plus a wrapped ring; two new queries at 9 and 10
        let ring = KeyLayout::Scattered(vec![0, 9, 10, 7, 8]);
        let rows = explicit(build_attention_mask(2, &ring, None, &Device::Cpu).unwrap());
        assert_eq!(rows, vec![vec![1, 1, 0, 1, 1], vec![1, 1, 1, 1, 1]]);
    }

    #[test]
    fn causal_additive_offsets_past_keys() {
        let add = AttentionMask::Causal
            .to_additive(2, 4, &Device::Cpu)
            .unwrap()
            .unwrap();
        let rows: Vec<Vec<f32>> = add.to_vec2().unwrap();
        assert_eq!(rows[0][..3], [0.0, 0.0, 0.0]);
        assert_eq!(rows[0][3], f32::NEG_INFINITY);
        assert!(rows[1].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn explicit_additive_matches_boolean() {
        let layout = KeyLayout::Contiguous { start: 0, len: 3 };
        let mask = build_attention_mask(3, &layout, Some(2), &Device::Cpu).unwrap();
        let add: Vec<Vec<f32>> = mask
            .to_additive(3, 3, &Device::Cpu)
            .unwrap()
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(add[2][0], f32::NEG_INFINITY);
        assert_eq!(add[2][1], 0.0);
        assert_eq!(add[0][1], f32::NEG_INFINITY);
    }

    #[test]
    fn too_many_queries_rejected() {
        let layout = KeyLayout::Contiguous { start: 0, len: 2 };
        assert!(build_attention_mask(3, &layout, None, &Device::Cpu).is_err());
        let empty = KeyLayout::Contiguous { start: 0, len: 0 };
        assert!(matches!(
            build_attention_mask(1, &empty, None, &Device::Cpu),
            Err(CadenceError::EmptyInput(_))
        ));
    }
}
