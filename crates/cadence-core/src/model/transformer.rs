//! Decoder-only transformer assembled from named weights.

use super::config::{LayerConfig, ModelConfig};
use super::layer::DecoderLayer;
use super::rmsnorm::RmsNorm;
use super::weights::WeightMap;
use crate::cache::{KvCache, LayerCache};
use crate::error::{CadenceError, Result};
use crate::session::GenerationSession;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module};
use std::sync::Arc;
use tracing::{debug, info};

/// An immutable model, shareable across sessions and threads.
pub struct Transformer {
    config: ModelConfig,
    layer_configs: Vec<LayerConfig>,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    eos_token_ids: Vec<u32>,
    device: Device,
}

impl Transformer {
    /// Validate `config`, derive layer settings and load every weight.
    pub fn from_weights(config: ModelConfig, weights: &WeightMap) -> Result<Self> {
        let layer_configs = config.layer_configs()?;

        let embed = weights.get_tensor("model.embed_tokens.weight")?;
        let (vocab, hidden) = embed.dims2()?;
        if vocab != config.vocab_size || hidden != config.hidden_size {
            return Err(CadenceError::ShapeMismatch(format!(
                "embed_tokens is [{}, {}], config says [{}, {}]",
                vocab, hidden, config.vocab_size, config.hidden_size
            )));
        }
        let device = embed.device().clone();

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed.clone(), None)
        } else {
            Linear::new(weights.get_tensor("lm_head.weight")?, None)
        };

        let layers = layer_configs
            .iter()
            .map(|layer| DecoderLayer::from_weights(weights, &config, layer))
            .collect::<Result<Vec<_>>>()?;

        info!(
            model_type = %config.model_type,
            layers = layers.len(),
            hidden = hidden,
            vocab = vocab,
            "loaded transformer"
        );

        Ok(Self {
            norm: RmsNorm::new(weights.get_tensor("model.norm.weight")?, config.rms_norm_eps)?,
            embed_tokens: Embedding::new(embed, hidden),
            eos_token_ids: config.eos_token_ids(),
            config,
            layer_configs,
            layers,
            lm_head,
            device,
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Per-layer settings.
    pub fn layer_configs(&self) -> &[LayerConfig] {
        &self.layer_configs
    }

    /// Device holding the weights.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// End-of-sequence ids.
    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Empty caches for every cache-owning layer.
    pub fn new_caches(&self) -> Result<Vec<LayerCache>> {
        self.layer_configs
            .iter()
            .filter(|layer| layer.kv_source.is_none())
            .map(|layer| LayerCache::new(&layer.cache))
            .collect()
    }

    /// Start a generation session over this model.
    pub fn create_session(self: &Arc<Self>) -> Result<GenerationSession> {
        GenerationSession::new(Arc::clone(self))
    }

    /// Run `ids` through the model, updating `caches`.
    ///
    /// Returns f32 logits `[ids.len(), vocab]`.
    pub fn forward(&self, ids: &[u32], caches: &mut [LayerCache]) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(CadenceError::EmptyInput("no tokens to process".to_string()));
        }
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= self.config.vocab_size) {
            return Err(CadenceError::InvalidInput(format!(
                "token id {} out of range for vocab {}",
                bad, self.config.vocab_size
            )));
        }

        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let mut hidden = self.embed_tokens.forward(&input)?;
        if let Some(scale) = self.config.embedding_scale {
            hidden = (hidden * scale)?;
        }

        for layer in &self.layers {
            hidden = layer.forward(&hidden, caches)?;
        }

        let hidden = self.norm.forward(&hidden)?;
        let mut logits = self.lm_head.forward(&hidden)?.squeeze(0)?.to_dtype(DType::F32)?;
        if let Some(cap) = self.config.final_logit_softcapping {
            logits = ((logits / cap)?.tanh()? * cap)?;
        }
        debug!(
            tokens = ids.len(),
            offset = caches.first().map(KvCache::offset),
            "forward"
        );
        Ok(logits)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("layers", &self.layers.len())
            .field("device", &self.device)
            .finish()
    }
}
