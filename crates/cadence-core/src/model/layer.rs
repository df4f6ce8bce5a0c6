//! Pre-norm decoder layer.
//!
//! ```text
//! h   = x + attn(norm(x))
//! out = h + mlp(norm(h))
//! ```

use super::attention::{AttentionBlock, AttentionShape, KvAccess};
use super::config::{LayerConfig, MlpKind, ModelConfig};
use super::mlp::{Mlp, SwiGluMlp};
use super::rmsnorm::RmsNorm;
use super::weights::WeightMap;
use crate::cache::LayerCache;
use crate::error::{CadenceError, Result};
use crate::moe::{MoeBlock, SwitchGlu};
use candle_core::Tensor;

/// One transformer decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    index: usize,
    kv_source: Option<usize>,
    input_layernorm: RmsNorm,
    attention: AttentionBlock,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    /// Load layer `layer.index` from `model.layers.{index}.*`.
    pub fn from_weights(weights: &WeightMap, model: &ModelConfig, layer: &LayerConfig) -> Result<Self> {
        let prefix = format!("model.layers.{}", layer.index);
        let eps = model.rms_norm_eps;
        let shape = AttentionShape {
            num_heads: model.num_attention_heads,
            num_kv_heads: model.num_kv_heads(),
            head_dim: model.head_dim(),
        };

        let norm = |name: &str| RmsNorm::new(weights.get_tensor(&format!("{prefix}.{name}.weight"))?, eps);
        let attention = AttentionBlock::from_weights(
            weights,
            &format!("{prefix}.self_attn"),
            layer,
            shape,
            eps,
            model.attn_logit_softcapping,
        )?;

        let mlp = match &layer.mlp {
            MlpKind::Dense { .. } => Mlp::Dense(SwiGluMlp::from_weights(weights, &format!("{prefix}.mlp"))?),
            MlpKind::Moe {
                top_k,
                norm_topk_prob,
                ..
            } => {
                let switch = format!("{prefix}.mlp.switch_mlp");
                let experts = SwitchGlu::new(
                    weights.get_tensor(&format!("{switch}.gate_proj.weight"))?,
                    weights.get_tensor(&format!("{switch}.up_proj.weight"))?,
                    weights.get_tensor(&format!("{switch}.down_proj.weight"))?,
                    model.swiglu_limit,
                )?;
                let router = weights.get_tensor(&format!("{prefix}.mlp.gate.weight"))?;
                Mlp::Moe(MoeBlock::new(router, experts, *top_k, *norm_topk_prob)?)
            }
        };

        Ok(Self {
            index: layer.index,
            kv_source: layer.kv_source,
            input_layernorm: norm("input_layernorm")?,
            attention,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            mlp,
        })
    }

    /// Layer index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Attention block.
    pub fn attention(&self) -> &AttentionBlock {
        &self.attention
    }

    /// Run the layer. `caches` holds one cache per cache-owning layer,
    /// indexed by layer; this layer's own entry is updated in place.
    pub fn forward(&self, x: &Tensor, caches: &mut [LayerCache]) -> Result<Tensor> {
        let kv = match self.kv_source {
            Some(source) => KvAccess::Shared(caches.get(source).ok_or_else(|| {
                CadenceError::ModelError(format!("layer {} shares missing cache {}", self.index, source))
            })?),
            None => KvAccess::Owned(caches.get_mut(self.index).ok_or_else(|| {
                CadenceError::ModelError(format!("no cache for layer {}", self.index))
            })?),
        };

        let normed = self.input_layernorm.forward(x)?;
        let h = (x + self.attention.forward(&normed, kv)?)?;
        let normed = self.post_attention_layernorm.forward(&h)?;
        Ok((&h + self.mlp.forward(&normed)?)?)
    }
}
