//! Self-attention block of a decoder layer.
//!
//! Per call: project, (optionally) normalize q/k per head, rotate with the
//! layer's RoPE at the cache offset, append to the layer cache, build the
//! mask against the cache's post-update key layout, run SDPA, project out.
//! KV-sharing layers skip their own k/v and read another layer's cache.

use super::config::LayerConfig;
use super::rmsnorm::RmsNorm;
use super::weights::WeightMap;
use crate::attention::{build_attention_mask, scaled_dot_product_attention};
use crate::cache::{KvCache, LayerCache};
use crate::error::{CadenceError, Result};
use crate::rope::PositionEncoder;
use candle_core::Tensor;
use candle_nn::{Linear, Module};
use tracing::trace;

/// Where a layer gets its keys and values from.
pub enum KvAccess<'a> {
    /// The layer owns this cache and appends to it.
    Owned(&'a mut LayerCache),
    /// Read-only view of an earlier layer's cache, already updated for
    /// the current tokens.
    Shared(&'a LayerCache),
}

/// Attention geometry shared by every layer of a model.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    /// Query heads.
    pub num_heads: usize,
    /// KV heads.
    pub num_kv_heads: usize,
    /// Features per head.
    pub head_dim: usize,
}

/// Multi-head attention with grouped KV heads.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    q_proj: Linear,
    /// `None` for KV-sharing layers.
    kv_proj: Option<(Linear, Linear)>,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    rope: PositionEncoder,
    shape: AttentionShape,
    window: Option<usize>,
    softcap: Option<f64>,
    scale: f64,
}

impl AttentionBlock {
    /// Load `{prefix}.{q,k,v,o}_proj.weight` and optional `{q,k}_norm.weight`.
    pub fn from_weights(
        weights: &WeightMap,
        prefix: &str,
        layer: &LayerConfig,
        shape: AttentionShape,
        eps: f64,
        softcap: Option<f64>,
    ) -> Result<Self> {
        let linear = |name: &str| -> Result<Linear> {
            Ok(Linear::new(weights.get_tensor(&format!("{prefix}.{name}.weight"))?, None))
        };
        let norm = |name: &str| -> Result<Option<RmsNorm>> {
            weights
                .get(&format!("{prefix}.{name}.weight"))
                .map(|w| RmsNorm::new(w.clone(), eps))
                .transpose()
        };

        let q_proj = linear("q_proj")?;
        let q_rows = q_proj.weight().dims()[0];
        if q_rows != shape.num_heads * shape.head_dim {
            return Err(CadenceError::ShapeMismatch(format!(
                "layer {} q_proj has {} rows, expected {} heads x {}",
                layer.index, q_rows, shape.num_heads, shape.head_dim
            )));
        }
        let kv_proj = match layer.kv_source {
            Some(_) => None,
            None => Some((linear("k_proj")?, linear("v_proj")?)),
        };

        Ok(Self {
            q_proj,
            kv_proj,
            o_proj: linear("o_proj")?,
            q_norm: norm("q_norm")?,
            k_norm: norm("k_norm")?,
            rope: PositionEncoder::new(&layer.rope)?,
            shape,
            window: layer.attention.window(),
            softcap,
            scale: 1.0 / (shape.head_dim as f64).sqrt(),
        })
    }

    /// RoPE of this layer.
    pub fn rope(&self) -> &PositionEncoder {
        &self.rope
    }

    /// `[b, l, heads * head_dim]` -> `[b, heads, l, head_dim]`, with optional per-head norm.
    fn split_heads(&self, x: &Tensor, heads: usize, norm: Option<&RmsNorm>) -> Result<Tensor> {
        let (b, l, _) = x.dims3()?;
        let x = x.reshape((b, l, heads, self.shape.head_dim))?;
        let x = match norm {
            Some(norm) => norm.forward(&x)?,
            None => x,
        };
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    /// `x`: `[batch, seq, hidden]` -> `[batch, seq, hidden]`.
    pub fn forward(&self, x: &Tensor, kv: KvAccess<'_>) -> Result<Tensor> {
        let (b, l, _) = x.dims3()?;
        let q = self.q_proj.forward(x)?;
        let q = self.split_heads(&q, self.shape.num_heads, self.q_norm.as_ref())?;

        let (q, keys, values, layout) = match kv {
            KvAccess::Owned(cache) => {
                let (k_proj, v_proj) = self.kv_proj.as_ref().ok_or_else(|| {
                    CadenceError::ModelError("kv-sharing layer given its own cache".to_string())
                })?;
                let k = self.split_heads(&k_proj.forward(x)?, self.shape.num_kv_heads, self.k_norm.as_ref())?;
                let v = self.split_heads(&v_proj.forward(x)?, self.shape.num_kv_heads, None)?;

                let offset = cache.offset();
                let (q, k) = self.rope.apply_pair(&q, &k, offset)?;
                let (keys, values) = cache.update(&k, &v)?;
                (q, keys, values, cache.key_layout())
            }
            KvAccess::Shared(cache) => {
                let (keys, values) = cache.state()?.ok_or_else(|| {
                    CadenceError::ModelError("shared kv source has no state".to_string())
                })?;
                let offset = cache.offset().checked_sub(l).ok_or_else(|| {
                    CadenceError::ModelError(format!(
                        "shared kv source holds {} positions, fewer than {} queries",
                        cache.offset(),
                        l
                    ))
                })?;
                let q = self.rope.apply(&q, offset)?;
                (q, keys, values, cache.state_layout())
            }
        };

        let mask = build_attention_mask(l, &layout, self.window, x.device())?;
        trace!(queries = l, keys = layout.len(), masked = !mask.is_none(), "attention");
        let out = scaled_dot_product_attention(&q, &keys, &values, self.scale, &mask, self.softcap)?;

        let out = out
            .transpose(1, 2)?
            .reshape((b, l, self.shape.num_heads * self.shape.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}
