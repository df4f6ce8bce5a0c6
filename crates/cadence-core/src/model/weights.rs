//! Named weight tensors handed to [`Transformer::from_weights`](super::Transformer::from_weights).
//!
//! Names follow the HuggingFace convention:
//!
//! - `model.embed_tokens.weight`
//! - `model.layers.{i}.self_attn.{q,k,v,o}_proj.weight`
//! - `model.layers.{i}.self_attn.{q,k}_norm.weight` (optional)
//! - `model.layers.{i}.{input,post_attention}_layernorm.weight`
//! - `model.layers.{i}.mlp.{gate,up,down}_proj.weight` (dense)
//! - `model.layers.{i}.mlp.gate.weight` and
//!   `model.layers.{i}.mlp.switch_mlp.{gate,up,down}_proj.weight` (MoE)
//! - `model.norm.weight`, `lm_head.weight`
//!
//! Reading files is the caller's business; [`WeightMap::random`] builds a
//! deterministic toy model for tests, benches and examples.

use super::config::{MlpKind, ModelConfig};
use crate::error::{CadenceError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Weight tensors indexed by name.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing tensors.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| CadenceError::ModelError(format!("missing weight: {}", name)))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True when no tensors are present.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Deterministic random weights for `config`, seeded by `seed`.
    ///
    /// Projections are uniform in `±1/sqrt(fan_in)`, norms are one.
    /// Layers that share another layer's cache get no k/v projections;
    /// `qwen3` models get per-head q/k norms.
    pub fn random(config: &ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        let layers = config.layer_configs()?;
        let mut builder = Generator {
            rng: StdRng::seed_from_u64(seed),
            device,
            map: Self::new(),
        };

        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_width = config.num_attention_heads * head_dim;
        let kv_width = config.num_kv_heads() * head_dim;

        builder.uniform("model.embed_tokens.weight", &[config.vocab_size, hidden], 1.0)?;
        for layer in &layers {
            let p = format!("model.layers.{}", layer.index);
            builder.ones(&format!("{p}.input_layernorm.weight"), hidden)?;
            builder.ones(&format!("{p}.post_attention_layernorm.weight"), hidden)?;

            builder.linear(&format!("{p}.self_attn.q_proj.weight"), q_width, hidden)?;
            builder.linear(&format!("{p}.self_attn.o_proj.weight"), hidden, q_width)?;
            if layer.kv_source.is_none() {
                builder.linear(&format!("{p}.self_attn.k_proj.weight"), kv_width, hidden)?;
                builder.linear(&format!("{p}.self_attn.v_proj.weight"), kv_width, hidden)?;
            }
            if config.model_type == "qwen3" {
                builder.ones(&format!("{p}.self_attn.q_norm.weight"), head_dim)?;
                builder.ones(&format!("{p}.self_attn.k_norm.weight"), head_dim)?;
            }

            match &layer.mlp {
                MlpKind::Dense { intermediate_size } => {
                    let i = *intermediate_size;
                    builder.linear(&format!("{p}.mlp.gate_proj.weight"), i, hidden)?;
                    builder.linear(&format!("{p}.mlp.up_proj.weight"), i, hidden)?;
                    builder.linear(&format!("{p}.mlp.down_proj.weight"), hidden, i)?;
                }
                MlpKind::Moe {
                    num_experts,
                    intermediate_size,
                    ..
                } => {
                    let (e, i) = (*num_experts, *intermediate_size);
                    let in_scale = 1.0 / (hidden as f32).sqrt();
                    let out_scale = 1.0 / (i as f32).sqrt();
                    builder.uniform(&format!("{p}.mlp.gate.weight"), &[e, hidden], in_scale)?;
                    let sw = format!("{p}.mlp.switch_mlp");
                    builder.uniform(&format!("{sw}.gate_proj.weight"), &[e, i, hidden], in_scale)?;
                    builder.uniform(&format!("{sw}.up_proj.weight"), &[e, i, hidden], in_scale)?;
                    builder.uniform(&format!("{sw}.down_proj.weight"), &[e, hidden, i], out_scale)?;
                }
            }
        }
        builder.ones("model.norm.weight", hidden)?;
        if !config.tie_word_embeddings {
            builder.linear("lm_head.weight", config.vocab_size, hidden)?;
        }
        Ok(builder.map)
    }
}

struct Generator<'a> {
    rng: StdRng,
    device: &'a Device,
    map: WeightMap,
}

impl Generator<'_> {
    fn uniform(&mut self, name: &str, shape: &[usize], scale: f32) -> Result<()> {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count)
            .map(|_| self.rng.gen_range(-scale..scale))
            .collect();
        let tensor = Tensor::from_vec(values, shape, self.device)?;
        self.map.insert(name, tensor);
        Ok(())
    }

    fn linear(&mut self, name: &str, out_features: usize, in_features: usize) -> Result<()> {
        let scale = 1.0 / (in_features as f32).sqrt();
        self.uniform(name, &[out_features, in_features], scale)
    }

    fn ones(&mut self, name: &str, dim: usize) -> Result<()> {
        let tensor = Tensor::ones(dim, candle_core::DType::F32, self.device)?;
        self.map.insert(name, tensor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_weights_are_deterministic() {
        let config = ModelConfig::default();
        let a = WeightMap::random(&config, 3, &Device::Cpu).unwrap();
        let b = WeightMap::random(&config, 3, &Device::Cpu).unwrap();
        let c = WeightMap::random(&config, 4, &Device::Cpu).unwrap();

        let name = "model.layers.1.self_attn.k_proj.weight";
        let ta: Vec<f32> = a.get_tensor(name).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let tb: Vec<f32> = b.get_tensor(name).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let tc: Vec<f32> = c.get_tensor(name).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ta, tb);
        assert_ne!(ta, tc);
    }

    #[test]
    fn random_weights_cover_layout() {
        let config = ModelConfig::default();
        let map = WeightMap::random(&config, 0, &Device::Cpu).unwrap();
        // embed, norm, lm_head + 9 per dense layer
        assert_eq!(map.len(), 3 + 2 * 9);
        assert_eq!(
            map.get("model.layers.0.self_attn.k_proj.weight").unwrap().dims(),
            &[16, 32]
        );
    }

    #[test]
    fn moe_and_tied_layouts() {
        let config = ModelConfig {
            num_experts: Some(4),
            num_experts_per_tok: Some(2),
            moe_intermediate_size: Some(16),
            tie_word_embeddings: true,
            ..ModelConfig::default()
        };
        let map = WeightMap::random(&config, 0, &Device::Cpu).unwrap();
        assert!(!map.contains("lm_head.weight"));
        assert_eq!(
            map.get("model.layers.0.mlp.switch_mlp.down_proj.weight").unwrap().dims(),
            &[4, 32, 16]
        );
        assert!(!map.contains("model.layers.0.mlp.gate_proj.weight"));
    }

    #[test]
    fn missing_weight_is_model_error() {
        let map = WeightMap::new();
        assert!(matches!(
            map.get_tensor("model.norm.weight"),
            Err(CadenceError::ModelError(_))
        ));
    }
}
