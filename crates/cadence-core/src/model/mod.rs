//! Decoder-only transformer built from named weights.
//!
//! - [`ModelConfig`] parses HF-style `config.json` and derives per-layer
//!   settings ([`LayerConfig`])
//! - [`WeightMap`] holds the named tensors
//! - [`Transformer`] runs the forward pass over caller-owned caches

mod attention;
mod config;
mod layer;
mod mlp;
mod rmsnorm;
mod transformer;
mod weights;

pub use attention::{AttentionBlock, AttentionShape, KvAccess};
pub use config::{
    EosTokenId, LayerAttentionKind, LayerConfig, MlpKind, ModelConfig, DEFAULT_ATTENTION_SINKS,
};
pub use layer::DecoderLayer;
pub use mlp::{Mlp, SwiGluMlp};
pub use rmsnorm::RmsNorm;
pub use transformer::Transformer;
pub use weights::WeightMap;
