//! Affine quantize / dequantize kernels expressed as tensor ops.
//!
//! Packing and unpacking go through `f64` so every intermediate integer
//! (at most `2^32 - 1`) is exact.

use super::QuantConfig;
use crate::error::{CadenceError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Smallest scale stored for a group, so constant groups still dequantize.
const MIN_SCALE: f64 = 1e-7;

/// A tensor stored as packed affine levels.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// Packed levels, `u32`: `[..., dim / elements_per_word]`.
    pub data: Tensor,
    /// Per-group scales: `[..., dim / group_size]`.
    pub scales: Tensor,
    /// Per-group biases (group minimum): `[..., dim / group_size]`.
    pub biases: Tensor,
    /// Quantization parameters.
    pub config: QuantConfig,
    /// Element type of the original tensor.
    pub dtype: DType,
}

impl QuantizedTensor {
    /// Restore a real-valued tensor.
    pub fn dequantize(&self) -> Result<Tensor> {
        dequantize(&self.data, &self.scales, &self.biases, &self.config, self.dtype)
    }

    /// Bytes held by packed data plus scales and biases.
    pub fn size_bytes(&self) -> usize {
        let words = self.data.elem_count() * 4;
        let params = (self.scales.elem_count() + self.biases.elem_count()) * 4;
        words + params
    }

    /// Compression ratio against the same tensor in f16.
    pub fn compression_ratio(&self) -> f32 {
        let elements = self.data.elem_count() * self.config.elements_per_word();
        (elements * 2) as f32 / self.size_bytes() as f32
    }
}

/// Quantize the last axis of `x` group-wise.
pub fn quantize(x: &Tensor, config: &QuantConfig) -> Result<QuantizedTensor> {
    let dims = x.dims().to_vec();
    let (&dim, lead) = dims
        .split_last()
        .ok_or_else(|| CadenceError::ShapeMismatch("cannot quantize a scalar".to_string()))?;
    config.check_width(dim)?;

    let groups = config.num_groups(dim);
    let mut grouped_shape = lead.to_vec();
    grouped_shape.extend([groups, config.group_size]);
    let grouped = x.to_dtype(DType::F32)?.reshape(grouped_shape)?;

    // Per-group range
    let w_max = grouped.max_keepdim(D::Minus1)?;
    let w_min = grouped.min_keepdim(D::Minus1)?;
    let levels = config.max_level() as f64;
    let scales = ((&w_max - &w_min)? / levels)?.maximum(MIN_SCALE)?;

    let q = grouped
        .broadcast_sub(&w_min)?
        .broadcast_div(&scales)?
        .round()?
        .clamp(0.0, levels)?;

    let data = pack(&q, lead, dim, config)?;

    let mut group_shape = lead.to_vec();
    group_shape.push(groups);
    Ok(QuantizedTensor {
        data,
        scales: scales.reshape(group_shape.clone())?,
        biases: w_min.reshape(group_shape)?,
        config: *config,
        dtype: x.dtype(),
    })
}

/// Dequantize packed levels with their group parameters.
///
/// `data`, `scales` and `biases` may be strided views (e.g. a narrowed
/// cache buffer); the result is a fresh tensor of `dtype`.
pub fn dequantize(
    data: &Tensor,
    scales: &Tensor,
    biases: &Tensor,
    config: &QuantConfig,
    dtype: DType,
) -> Result<Tensor> {
    let dims = data.dims().to_vec();
    let (&words, lead) = dims
        .split_last()
        .ok_or_else(|| CadenceError::ShapeMismatch("cannot dequantize a scalar".to_string()))?;
    let dim = words * config.elements_per_word();
    let groups = config.num_groups(dim);
    if scales.dims().last() != Some(&groups) || biases.dims() != scales.dims() {
        return Err(CadenceError::ShapeMismatch(format!(
            "packed width {} expects {} groups, got scales {:?} biases {:?}",
            words,
            groups,
            scales.dims(),
            biases.dims()
        )));
    }

    let levels = unpack(data, config)?;

    let mut grouped_shape = lead.to_vec();
    grouped_shape.extend([groups, config.group_size]);
    let grouped = levels.reshape(grouped_shape)?;

    let scales = scales.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
    let biases = biases.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
    let restored = grouped.broadcast_mul(&scales)?.broadcast_add(&biases)?;

    let mut out_shape = lead.to_vec();
    out_shape.push(dim);
    Ok(restored.reshape(out_shape)?.to_dtype(dtype)?)
}

/// Place values of each word's elements: `2^(bits * j)`.
fn place_values(config: &QuantConfig, device: &Device) -> Result<Tensor> {
    let per_word = config.elements_per_word();
    let values: Vec<f64> = (0..per_word)
        .map(|j| 2f64.powi((config.bits * j) as i32))
        .collect();
    Ok(Tensor::from_vec(values, per_word, device)?)
}

fn pack(levels: &Tensor, lead: &[usize], dim: usize, config: &QuantConfig) -> Result<Tensor> {
    let mut word_shape = lead.to_vec();
    word_shape.extend([config.packed_width(dim), config.elements_per_word()]);
    let places = place_values(config, levels.device())?;

    let words = levels
        .reshape(word_shape)?
        .to_dtype(DType::F64)?
        .broadcast_mul(&places)?
        .sum(D::Minus1)?;
    Ok(words.to_dtype(DType::U32)?)
}

/// Unpack words into `f32` levels, `[..., words * elements_per_word]`.
fn unpack(data: &Tensor, config: &QuantConfig) -> Result<Tensor> {
    let places = place_values(config, data.device())?;
    let radix = 2f64.powi(config.bits as i32);

    // floor(word / 2^(bits*j)) mod 2^bits
    let shifted = data
        .to_dtype(DType::F64)?
        .unsqueeze(D::Minus1)?
        .broadcast_div(&places)?
        .floor()?;
    let carry = ((&shifted / radix)?.floor()? * radix)?;
    let levels = (shifted - carry)?;

    let dims = levels.dims().to_vec();
    let mut flat_shape = dims[..dims.len() - 2].to_vec();
    flat_shape.push(dims[dims.len() - 2] * dims[dims.len() - 1]);
    Ok(levels.reshape(flat_shape)?.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn quantize_shapes() {
        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 3, 128), &Device::Cpu).unwrap();
        let config = QuantConfig::new(64, 8).unwrap();
        let q = quantize(&x, &config).unwrap();

        assert_eq!(q.data.dims(), &[2, 4, 3, 32]);
        assert_eq!(q.data.dtype(), DType::U32);
        assert_eq!(q.scales.dims(), &[2, 4, 3, 2]);
        assert_eq!(q.biases.dims(), &[2, 4, 3, 2]);

        let restored = q.dequantize().unwrap();
        assert_eq!(restored.dims(), x.dims());
        assert_eq!(restored.dtype(), DType::F32);
    }

    #[test]
    fn exact_levels_survive_round_trip() {
        // Each row spans [0, 255]: scale 1, bias 0, so integers are exact
        let values: Vec<f32> = (0..4)
            .flat_map(|_| (0..64).map(|j| if j == 63 { 255.0 } else { (j * 4) as f32 }))
            .collect();
        let x = Tensor::from_vec(values, (4, 64), &Device::Cpu).unwrap();
        let config = QuantConfig::new(64, 8).unwrap();
        let restored = quantize(&x, &config).unwrap().dequantize().unwrap();

        assert!(max_abs_diff(&x, &restored) < 1e-4);
    }

    #[test]
    fn error_within_half_step() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 2.0, (8, 128), &device).unwrap();

        for bits in [2usize, 4, 8] {
            let config = QuantConfig::new(64, bits).unwrap();
            let q = quantize(&x, &config).unwrap();
            let restored = q.dequantize().unwrap();

            let max_scale = q.scales.flatten_all().unwrap().max(0).unwrap();
            let max_scale = max_scale.to_scalar::<f32>().unwrap();
            let err = max_abs_diff(&x, &restored);
            assert!(
                err <= max_scale * 0.5 + 1e-5,
                "{} bits: error {} exceeds half step {}",
                bits,
                err,
                max_scale * 0.5
            );
        }
    }

    #[test]
    fn constant_group_dequantizes_to_constant() {
        let x = Tensor::full(3.5f32, (2, 64), &Device::Cpu).unwrap();
        let config = QuantConfig::new(64, 4).unwrap();
        let restored = quantize(&x, &config).unwrap().dequantize().unwrap();
        assert!(max_abs_diff(&x, &restored) < 1e-5);
    }

    #[test]
    fn dequantize_strided_view() {
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 10, 64), &Device::Cpu).unwrap();
        let config = QuantConfig::new(32, 8).unwrap();
        let q = quantize(&x, &config).unwrap();

        let data = q.data.narrow(2, 0, 4).unwrap();
        let scales = q.scales.narrow(2, 0, 4).unwrap();
        let biases = q.biases.narrow(2, 0, 4).unwrap();
        let partial = dequantize(&data, &scales, &biases, &config, DType::F32).unwrap();
        let full = q.dequantize().unwrap().narrow(2, 0, 4).unwrap();

        assert_eq!(partial.dims(), &[1, 2, 4, 64]);
        assert!(max_abs_diff(&partial, &full) < 1e-6);
    }

    #[test]
    fn compression_beats_f16() {
        let x = Tensor::randn(0.0f32, 1.0, (256, 128), &Device::Cpu).unwrap();
        let q = quantize(&x, &QuantConfig::new(64, 4).unwrap()).unwrap();
        assert!(q.compression_ratio() > 3.0);
    }

    #[test]
    fn mismatched_groups_rejected() {
        let x = Tensor::randn(0.0f32, 1.0, (2, 64), &Device::Cpu).unwrap();
        let q = quantize(&x, &QuantConfig::new(32, 8).unwrap()).unwrap();
        let wrong = QuantConfig::new(64, 8).unwrap();
        assert!(matches!(
            dequantize(&q.data, &q.scales, &q.biases, &wrong, DType::F32),
            Err(CadenceError::ShapeMismatch(_))
        ));
    }
}
