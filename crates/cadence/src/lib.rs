//! # Cadence
//!
//! Token generation over decoder-only transformers.
//!
//! The [`Engine`] keeps a registry of loaded models addressed by
//! [`ModelHandle`] and runs generate requests against them, each in its own
//! session:
//!
//! ```rust,ignore
//! use cadence::prelude::*;
//!
//! let engine = Engine::builder().build()?;
//! let handle = engine.load_model(config, &weights)?;
//!
//! let result = engine
//!     .generate(handle, &[1, 2, 3])
//!     .max_tokens(32)
//!     .temperature(0.0)
//!     .on_token(|id| { println!("{id}"); true })
//!     .execute()?;
//! println!("{}", result.to_json()?);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use cadence_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult, ModelHandle};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Whether generation can run in this build.
///
/// The CPU backend is always compiled in, so this only reports `false` when
/// candle cannot create a CPU tensor.
pub fn is_available() -> bool {
    candle_core::Tensor::zeros(1, candle_core::DType::F32, &candle_core::Device::Cpu).is_ok()
}

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{
        Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult, ModelHandle,
    };
    pub use crate::{
        cache::{CacheConfig, KvCache},
        error::{CadenceError, Result},
        model::{ModelConfig, Transformer, WeightMap},
        sampling::SamplingParams,
        session::{FinishReason, GenerateConfig, GenerationSession, StepInput},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_and_availability() {
        assert_eq!(super::version(), env!("CARGO_PKG_VERSION"));
        assert!(super::is_available());
    }
}
