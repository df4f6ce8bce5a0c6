//! Model configuration and per-layer derivation.
//!
//! [`ModelConfig`] mirrors the HF-style `config.json` fields the engine
//! understands. [`ModelConfig::layer_configs`] turns the flat config into one
//! validated [`LayerConfig`] per decoder layer: attention kind, RoPE, cache
//! layout, MLP kind and (for KV-sharing layers) the layer whose cache is read.

use crate::cache::CacheConfig;
use crate::error::{CadenceError, Result};
use crate::rope::{RopeScalingConfig, RopeSpec};
use serde::{Deserialize, Serialize};

/// Sink positions kept by a global cache bounded by `max_kv_size`.
pub const DEFAULT_ATTENTION_SINKS: usize = 4;

/// `eos_token_id` appears as a number or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    /// A single id.
    Single(u32),
    /// Several ids.
    Multiple(Vec<u32>),
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_decoder_sparse_step() -> usize {
    1
}

/// Configuration for a decoder-only transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension of dense MLPs.
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (GQA); defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Head dimension; defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// RoPE base of global layers.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Interleaved RoPE pairs.
    #[serde(default)]
    pub rope_traditional: bool,
    /// Fraction of `head_dim` that is rotated.
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,
    /// Context-extension scaling.
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    /// RoPE base of sliding-window layers.
    #[serde(default)]
    pub rope_local_base_freq: Option<f64>,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Window of sliding-attention layers.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    /// Every `pattern`-th layer is global, the rest slide.
    #[serde(default)]
    pub sliding_window_pattern: Option<usize>,
    /// Explicit per-layer kinds: `full_attention` or `sliding_attention`.
    #[serde(default)]
    pub layer_types: Option<Vec<String>>,
    /// Sinks kept by global caches bounded by `max_kv_size`.
    #[serde(default)]
    pub attention_sinks: Option<usize>,
    /// Bound global caches to this many positions.
    #[serde(default)]
    pub max_kv_size: Option<usize>,
    /// Quantize global caches to this many bits.
    #[serde(default)]
    pub kv_bits: Option<usize>,
    /// Group size for quantized caches.
    #[serde(default)]
    pub kv_group_size: Option<usize>,

    /// Number of experts; enables MoE layers.
    #[serde(default, alias = "num_local_experts")]
    pub num_experts: Option<usize>,
    /// Experts per token.
    #[serde(default)]
    pub num_experts_per_tok: Option<usize>,
    /// Expert intermediate size; defaults to `intermediate_size`.
    #[serde(default)]
    pub moe_intermediate_size: Option<usize>,
    /// Every `step`-th layer is MoE.
    #[serde(default = "default_decoder_sparse_step")]
    pub decoder_sparse_step: usize,
    /// Layers forced to a dense MLP.
    #[serde(default)]
    pub mlp_only_layers: Vec<usize>,
    /// Renormalize the top-k routing probabilities.
    #[serde(default)]
    pub norm_topk_prob: bool,
    /// Clamp for SwiGLU gate pre-activations.
    #[serde(default)]
    pub swiglu_limit: Option<f64>,

    /// Trailing layers that reuse an earlier layer's cache.
    #[serde(default)]
    pub num_kv_shared_layers: usize,
    /// Attention score soft-cap.
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    /// Output logit soft-cap.
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    /// Multiplier applied to token embeddings.
    #[serde(default)]
    pub embedding_scale: Option<f64>,
    /// Use the embedding matrix as the output projection.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// End-of-sequence ids.
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    /// Model architecture type.
    #[serde(default)]
    pub model_type: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // A tiny Llama-style model
        Self {
            vocab_size: 64,
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            head_dim: Some(8),
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            rope_traditional: false,
            partial_rotary_factor: None,
            rope_scaling: None,
            rope_local_base_freq: None,
            max_position_embeddings: default_max_position_embeddings(),
            sliding_window: None,
            sliding_window_pattern: None,
            layer_types: None,
            attention_sinks: None,
            max_kv_size: None,
            kv_bits: None,
            kv_group_size: None,
            num_experts: None,
            num_experts_per_tok: None,
            moe_intermediate_size: None,
            decoder_sparse_step: default_decoder_sparse_step(),
            mlp_only_layers: Vec::new(),
            norm_topk_prob: false,
            swiglu_limit: None,
            num_kv_shared_layers: 0,
            attn_logit_softcapping: None,
            final_logit_softcapping: None,
            embedding_scale: None,
            tie_word_embeddings: false,
            eos_token_id: None,
            model_type: "llama".to_string(),
        }
    }
}

/// Attention span of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAttentionKind {
    /// Attends every earlier position.
    Global,
    /// Attends the last `window` positions.
    SlidingWindow(usize),
}

impl LayerAttentionKind {
    /// Window size, if any.
    pub fn window(&self) -> Option<usize> {
        match self {
            Self::Global => None,
            Self::SlidingWindow(w) => Some(*w),
        }
    }
}

/// MLP of a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MlpKind {
    /// Dense SwiGLU.
    Dense {
        /// Intermediate size.
        intermediate_size: usize,
    },
    /// Routed SwiGLU experts.
    Moe {
        /// Number of experts.
        num_experts: usize,
        /// Experts per token.
        top_k: usize,
        /// Expert intermediate size.
        intermediate_size: usize,
        /// Renormalize routing probabilities.
        norm_topk_prob: bool,
    },
}

/// Everything needed to build and run one decoder layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    /// Layer index.
    pub index: usize,
    /// Global or sliding attention.
    pub attention: LayerAttentionKind,
    /// Position encoding.
    pub rope: RopeSpec,
    /// Cache layout (unused when `kv_source` is set).
    pub cache: CacheConfig,
    /// MLP kind.
    pub mlp: MlpKind,
    /// Earlier layer whose cache this layer reads instead of owning one.
    pub kv_source: Option<usize>,
}

impl ModelConfig {
    /// Parse a `config.json` document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Query heads per KV head.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads().max(1)
    }

    /// Rotated features per head.
    pub fn rope_dimensions(&self) -> usize {
        let head_dim = self.head_dim();
        match self.partial_rotary_factor {
            Some(f) => ((head_dim as f64 * f) as usize) & !1,
            None => head_dim,
        }
    }

    /// End-of-sequence ids.
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(EosTokenId::Single(id)) => vec![*id],
            Some(EosTokenId::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    /// Check dimensions and head counts.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_kv_heads()),
            ("num_hidden_layers", self.num_hidden_layers),
            ("head_dim", self.head_dim()),
            ("decoder_sparse_step", self.decoder_sparse_step),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CadenceError::config(format!("{} must be positive", name)));
            }
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(CadenceError::config(format!(
                "{} attention heads are not a multiple of {} kv heads",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        if let Some(f) = self.partial_rotary_factor {
            if f.is_nan() || f <= 0.0 || f > 1.0 || self.rope_dimensions() == 0 {
                return Err(CadenceError::config(format!(
                    "partial_rotary_factor {} leaves no rotated dims",
                    f
                )));
            }
        }
        if self.num_kv_shared_layers >= self.num_hidden_layers {
            return Err(CadenceError::config(format!(
                "num_kv_shared_layers {} must leave at least one cache-owning layer",
                self.num_kv_shared_layers
            )));
        }
        if self.kv_bits.is_some() && self.max_kv_size.is_some() {
            return Err(CadenceError::config(
                "kv_bits cannot be combined with max_kv_size",
            ));
        }
        Ok(())
    }

    fn attention_kinds(&self) -> Result<Vec<LayerAttentionKind>> {
        let n = self.num_hidden_layers;
        let window = |layer: usize| match self.sliding_window {
            Some(0) => Err(CadenceError::config("sliding_window must be positive")),
            Some(w) => Ok(LayerAttentionKind::SlidingWindow(w)),
            None => Err(CadenceError::config(format!(
                "layer {} slides but sliding_window is unset",
                layer
            ))),
        };

        if let Some(types) = &self.layer_types {
            if types.len() != n {
                return Err(CadenceError::config(format!(
                    "layer_types has {} entries for {} layers",
                    types.len(),
                    n
                )));
            }
            return types
                .iter()
                .enumerate()
                .map(|(i, t)| match t.as_str() {
                    "full_attention" => Ok(LayerAttentionKind::Global),
                    "sliding_attention" => window(i),
                    other => Err(CadenceError::config(format!(
                        "unknown layer type '{}' at layer {}",
                        other, i
                    ))),
                })
                .collect();
        }

        match (self.sliding_window_pattern, self.sliding_window) {
            (Some(0), _) => Err(CadenceError::config("sliding_window_pattern must be positive")),
            (Some(pattern), _) => (0..n)
                .map(|i| {
                    if (i + 1) % pattern == 0 {
                        Ok(LayerAttentionKind::Global)
                    } else {
                        window(i)
                    }
                })
                .collect(),
            (None, Some(_)) => (0..n).map(window).collect(),
            (None, None) => Ok(vec![LayerAttentionKind::Global; n]),
        }
    }

    fn cache_config(&self, attention: LayerAttentionKind) -> Result<CacheConfig> {
        let config = match attention {
            LayerAttentionKind::SlidingWindow(w) => {
                if let Some(max) = self.max_kv_size {
                    if w > max {
                        return Err(CadenceError::config(format!(
                            "sliding_window {} exceeds max_kv_size {}",
                            w, max
                        )));
                    }
                }
                CacheConfig::Rotating {
                    max_size: w,
                    keep: 0,
                }
            }
            LayerAttentionKind::Global => match (self.max_kv_size, self.kv_bits) {
                (Some(max_size), _) => CacheConfig::Rotating {
                    max_size,
                    keep: self.attention_sinks.unwrap_or(DEFAULT_ATTENTION_SINKS),
                },
                (None, Some(bits)) => CacheConfig::Quantized {
                    group_size: self
                        .kv_group_size
                        .unwrap_or(crate::quantization::DEFAULT_GROUP_SIZE),
                    bits,
                },
                (None, None) => CacheConfig::Growing,
            },
        };
        config.validate(self.head_dim())?;
        Ok(config)
    }

    fn mlp_kind(&self, layer: usize) -> Result<MlpKind> {
        let dense = MlpKind::Dense {
            intermediate_size: self.intermediate_size,
        };
        let Some(num_experts) = self.num_experts.filter(|&e| e > 0) else {
            return Ok(dense);
        };
        if self.mlp_only_layers.contains(&layer) || (layer + 1) % self.decoder_sparse_step != 0 {
            return Ok(dense);
        }
        let top_k = self
            .num_experts_per_tok
            .ok_or_else(|| CadenceError::config("num_experts set without num_experts_per_tok"))?;
        if top_k == 0 || top_k > num_experts {
            return Err(CadenceError::config(format!(
                "num_experts_per_tok {} must be in 1..={}",
                top_k, num_experts
            )));
        }
        Ok(MlpKind::Moe {
            num_experts,
            top_k,
            intermediate_size: self.moe_intermediate_size.unwrap_or(self.intermediate_size),
            norm_topk_prob: self.norm_topk_prob,
        })
    }

    /// Derive and validate the configuration of every layer.
    pub fn layer_configs(&self) -> Result<Vec<LayerConfig>> {
        self.validate()?;
        let dims = self.rope_dimensions();
        let global_rope = RopeSpec::from_config(
            dims,
            self.rope_theta,
            self.rope_traditional,
            self.rope_scaling.as_ref(),
            self.max_position_embeddings,
        )?;
        let local_rope = match self.rope_local_base_freq {
            Some(base) => RopeSpec::from_config(dims, base, self.rope_traditional, None, 0)?,
            None => global_rope.clone(),
        };

        let kinds = self.attention_kinds()?;
        let first_shared = self.num_hidden_layers - self.num_kv_shared_layers;

        let mut layers = Vec::with_capacity(kinds.len());
        for (index, &attention) in kinds.iter().enumerate() {
            let rope = match attention {
                LayerAttentionKind::Global => global_rope.clone(),
                LayerAttentionKind::SlidingWindow(_) => local_rope.clone(),
            };
            let kv_source = if index >= first_shared {
                let source = (0..first_shared)
                    .rev()
                    .find(|&j| kinds[j] == attention)
                    .ok_or_else(|| {
                        CadenceError::config(format!(
                            "layer {} shares kv but no earlier {:?} layer owns a cache",
                            index, attention
                        ))
                    })?;
                Some(source)
            } else {
                None
            };
            layers.push(LayerConfig {
                index,
                attention,
                rope,
                cache: self.cache_config(attention)?,
                mlp: self.mlp_kind(index)?,
                kv_source,
            });
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rope::RopeScaling;

    const LLAMA_JSON: &str = r#"{
        "vocab_size": 128256,
        "hidden_size": 4096,
        "intermediate_size": 14336,
        "num_attention_heads": 32,
        "num_key_value_heads": 8,
        "num_hidden_layers": 32,
        "rms_norm_eps": 1e-5,
        "rope_theta": 500000.0,
        "max_position_embeddings": 131072,
        "rope_scaling": {
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 8192,
            "rope_type": "llama3"
        },
        "eos_token_id": [128001, 128008, 128009],
        "model_type": "llama"
    }"#;

    #[test]
    fn parses_llama_config() {
        let config = ModelConfig::from_json(LLAMA_JSON).unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.gqa_ratio(), 4);
        assert_eq!(config.eos_token_ids(), vec![128001, 128008, 128009]);

        let layers = config.layer_configs().unwrap();
        assert_eq!(layers.len(), 32);
        assert!(layers
            .iter()
            .all(|l| l.attention == LayerAttentionKind::Global && l.cache == CacheConfig::Growing));
        assert!(matches!(layers[0].rope.scaling, RopeScaling::Llama3 { .. }));
    }

    #[test]
    fn sliding_pattern_marks_every_nth_global() {
        let config = ModelConfig {
            num_hidden_layers: 6,
            sliding_window: Some(16),
            sliding_window_pattern: Some(3),
            rope_local_base_freq: Some(10000.0),
            rope_theta: 1_000_000.0,
            ..ModelConfig::default()
        };
        let layers = config.layer_configs().unwrap();
        let kinds: Vec<_> = layers.iter().map(|l| l.attention).collect();
        assert_eq!(kinds[2], LayerAttentionKind::Global);
        assert_eq!(kinds[5], LayerAttentionKind::Global);
        assert_eq!(kinds[0], LayerAttentionKind::SlidingWindow(16));
        assert_eq!(layers[0].cache, CacheConfig::Rotating { max_size: 16, keep: 0 });
        assert_eq!(layers[0].rope.base, 10000.0);
        assert_eq!(layers[2].rope.base, 1_000_000.0);
    }

    #[test]
    fn layer_types_take_precedence() {
        let config = ModelConfig {
            num_hidden_layers: 3,
            sliding_window: Some(8),
            sliding_window_pattern: Some(2),
            layer_types: Some(vec![
                "full_attention".into(),
                "sliding_attention".into(),
                "sliding_attention".into(),
            ]),
            ..ModelConfig::default()
        };
        let kinds: Vec<_> = config
            .layer_configs()
            .unwrap()
            .iter()
            .map(|l| l.attention)
            .collect();
        assert_eq!(
            kinds,
            vec![
                LayerAttentionKind::Global,
                LayerAttentionKind::SlidingWindow(8),
                LayerAttentionKind::SlidingWindow(8)
            ]
        );

        let bad = ModelConfig {
            layer_types: Some(vec!["full_attention".into(), "linear_attention".into()]),
            ..ModelConfig::default()
        };
        assert!(bad.layer_configs().is_err());
    }

    #[test]
    fn max_kv_size_bounds_global_caches() {
        let config = ModelConfig {
            max_kv_size: Some(32),
            ..ModelConfig::default()
        };
        let layers = config.layer_configs().unwrap();
        assert_eq!(
            layers[0].cache,
            CacheConfig::Rotating {
                max_size: 32,
                keep: DEFAULT_ATTENTION_SINKS
            }
        );

        let too_wide = ModelConfig {
            max_kv_size: Some(8),
            sliding_window: Some(16),
            ..ModelConfig::default()
        };
        assert!(matches!(
            too_wide.layer_configs(),
            Err(CadenceError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn kv_bits_selects_quantized_cache() {
        let config = ModelConfig {
            kv_bits: Some(4),
            kv_group_size: Some(8),
            ..ModelConfig::default()
        };
        let layers = config.layer_configs().unwrap();
        assert_eq!(layers[1].cache, CacheConfig::Quantized { group_size: 8, bits: 4 });

        // head_dim 8 cannot hold groups of 64
        let config = ModelConfig {
            kv_bits: Some(4),
            ..ModelConfig::default()
        };
        assert!(config.layer_configs().is_err());
    }

    #[test]
    fn moe_layers_follow_sparse_step() {
        let config = ModelConfig {
            num_hidden_layers: 4,
            num_experts: Some(8),
            num_experts_per_tok: Some(2),
            moe_intermediate_size: Some(16),
            decoder_sparse_step: 2,
            mlp_only_layers: vec![3],
            ..ModelConfig::default()
        };
        let layers = config.layer_configs().unwrap();
        assert!(matches!(layers[0].mlp, MlpKind::Dense { .. }));
        assert_eq!(
            layers[1].mlp,
            MlpKind::Moe {
                num_experts: 8,
                top_k: 2,
                intermediate_size: 16,
                norm_topk_prob: false
            }
        );
        assert!(matches!(layers[3].mlp, MlpKind::Dense { .. }));
    }

    #[test]
    fn shared_layers_point_at_same_kind() {
        let config = ModelConfig {
            num_hidden_layers: 6,
            sliding_window: Some(8),
            sliding_window_pattern: Some(2),
            num_kv_shared_layers: 2,
            ..ModelConfig::default()
        };
        let layers = config.layer_configs().unwrap();
        // Layers 0..4 own caches; 4 slides, 5 is global
        assert_eq!(layers[3].kv_source, None);
        assert_eq!(layers[4].kv_source, Some(2));
        assert_eq!(layers[5].kv_source, Some(3));
    }

    #[test]
    fn partial_rotary_dims_are_even() {
        let config = ModelConfig {
            head_dim: Some(10),
            hidden_size: 40,
            partial_rotary_factor: Some(0.5),
            ..ModelConfig::default()
        };
        assert_eq!(config.rope_dimensions(), 4);
        assert_eq!(config.layer_configs().unwrap()[0].rope.dimensions, 4);
    }

    #[test]
    fn rejects_out_of_range_partial_rotary_factor() {
        for f in [0.0, -0.5, 1.5, f64::NAN] {
            let config = ModelConfig {
                partial_rotary_factor: Some(f),
                ..ModelConfig::default()
            };
            assert!(config.validate().is_err(), "factor {}", f);
        }
    }

    #[test]
    fn rejects_bad_head_counts() {
        let config = ModelConfig {
            num_key_value_heads: Some(3),
            ..ModelConfig::default()
        };
        assert!(config.layer_configs().is_err());
    }
}
