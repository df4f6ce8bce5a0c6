//! Root Mean Square Layer Normalization.
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! Statistics are computed in f32 and the result is cast back to the input
//! dtype. Used before attention and MLP blocks, on the final hidden state
//! and (for some families) on per-head queries and keys.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{CadenceError, Result};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization over the last axis.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Create from a `[dim]` weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(CadenceError::ShapeMismatch(format!(
                "norm weight must be 1-D, got {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight, eps })
    }

    /// Unit weight of width `dim`.
    pub fn ones(dim: usize, eps: f64, device: &Device) -> Result<Self> {
        Self::new(Tensor::ones(dim, DType::F32, device)?, eps)
    }

    /// Normalized width.
    pub fn dim(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Normalize `x` (`[..., dim]`).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dims().last().copied().unwrap_or(0);
        if width != self.dim() {
            return Err(CadenceError::ShapeMismatch(format!(
                "norm of width {} applied to {:?}",
                self.dim(),
                x.dims()
            )));
        }
        let dtype = x.dtype();
        let xf = x.to_dtype(DType::F32)?;
        let rms = (xf.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        let normed = xf.broadcast_div(&rms)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        Ok(normed.broadcast_mul(&weight)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_input_normalizes_to_weight() {
        let weight = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let norm = RmsNorm::new(weight, 1e-6).unwrap();
        let x = Tensor::full(-5f32, (2, 4), &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        for row in rows {
            for (v, w) in row.iter().zip([1f32, 2.0, 3.0, 4.0]) {
                assert!((v + w).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn works_on_heads() {
        // [batch, heads, seq, head_dim]
        let norm = RmsNorm::ones(8, 1e-6, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 3.0, (1, 2, 5, 8), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
        let ms: Vec<f32> = y
            .sqr()
            .unwrap()
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(ms.iter().all(|m| (m - 1.0).abs() < 1e-3));
    }

    #[test]
    fn keeps_input_dtype() {
        let norm = RmsNorm::ones(4, 1e-6, &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 4), DType::F64, &Device::Cpu).unwrap();
        assert_eq!(norm.forward(&x).unwrap().dtype(), DType::F64);
    }

    #[test]
    fn width_mismatch_rejected() {
        let norm = RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 128), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(norm.forward(&x), Err(CadenceError::ShapeMismatch(_))));
        assert!(RmsNorm::new(Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(), 1e-5).is_err());
    }
}
