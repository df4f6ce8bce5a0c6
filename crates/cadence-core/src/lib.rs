//! # Cadence Core
//!
//! Autoregressive decoding for decoder-only transformers.
//!
//! This crate provides:
//! - **KV caches**: growing, rotating (sliding window with attention sinks)
//!   and group-quantized, behind the [`cache::KvCache`] trait
//! - **Rotary position embeddings** with linear, Llama 3, YaRN and LongRoPE
//!   frequency scaling
//! - **Attention masks** derived from the cache's key layout, with sliding
//!   windows
//! - **Mixture-of-experts** routing with per-token and sorted dispatch
//! - **Sampling** with temperature, top-k, nucleus and repetition penalty
//! - **Generation sessions** driving prefill and decode over a shared
//!   [`model::Transformer`]

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod cache;
pub mod error;
pub mod model;
pub mod moe;
pub mod quantization;
pub mod rope;
pub mod sampling;
pub mod session;

pub use error::{CadenceError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheConfig, KvCache, LayerCache};
    pub use crate::error::{CadenceError, Result};
    pub use crate::model::{ModelConfig, Transformer, WeightMap};
    pub use crate::rope::{PositionEncoder, RopeSpec};
    pub use crate::sampling::{Sampler, SamplingParams};
    pub use crate::session::{
        FinishReason, GenerateConfig, GenerationOutput, GenerationSession, StepInput,
    };
}
