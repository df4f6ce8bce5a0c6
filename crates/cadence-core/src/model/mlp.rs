//! Dense SwiGLU MLP.
//!
//! `SwiGLU(x) = down(silu(gate(x)) * up(x))`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::weights::WeightMap;
use crate::error::Result;
use crate::moe::MoeBlock;
use candle_core::Tensor;
use candle_nn::ops::silu;
use candle_nn::{Linear, Module};

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl SwiGluMlp {
    /// Create from `[intermediate, hidden]`, `[intermediate, hidden]` and
    /// `[hidden, intermediate]` weights.
    pub fn new(gate_proj: Tensor, up_proj: Tensor, down_proj: Tensor) -> Self {
        Self {
            gate_proj: Linear::new(gate_proj, None),
            up_proj: Linear::new(up_proj, None),
            down_proj: Linear::new(down_proj, None),
        }
    }

    /// Load `{prefix}.gate_proj.weight` and friends.
    pub fn from_weights(weights: &WeightMap, prefix: &str) -> Result<Self> {
        Ok(Self::new(
            weights.get_tensor(&format!("{prefix}.gate_proj.weight"))?,
            weights.get_tensor(&format!("{prefix}.up_proj.weight"))?,
            weights.get_tensor(&format!("{prefix}.down_proj.weight"))?,
        ))
    }

    /// `x`: `[..., hidden]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Feed-forward half of a decoder layer.
#[derive(Debug, Clone)]
pub enum Mlp {
    /// Dense SwiGLU.
    Dense(SwiGluMlp),
    /// Routed experts.
    Moe(MoeBlock),
}

impl Mlp {
    /// `x`: `[batch, seq, hidden]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(mlp) => mlp.forward(x),
            Self::Moe(moe) => moe.forward(x),
        }
    }
}
