//! Rotation kernel shared by every RoPE variant.

use crate::error::{CadenceError, Result};
use candle_core::{DType, Tensor, D};

/// Rotate the leading `dims` features of `x` by precomputed angles.
///
/// `cos` and `sin` hold `seq * dims / 2` values laid out `[seq, dims / 2]`.
/// Features past `dims` are copied through untouched.
pub(super) fn apply_rotation(
    x: &Tensor,
    cos: Vec<f32>,
    sin: Vec<f32>,
    dims: usize,
    traditional: bool,
    input_scale: f64,
) -> Result<Tensor> {
    let (b, h, l, head_dim) = x.dims4()?;
    if dims > head_dim {
        return Err(CadenceError::ShapeMismatch(format!(
            "rope rotates {} features but head_dim is {}",
            dims, head_dim
        )));
    }
    let half = dims / 2;
    let device = x.device();
    let cos = Tensor::from_vec(cos, (l, half), device)?;
    let sin = Tensor::from_vec(sin, (l, half), device)?;

    let mut rot = x.narrow(D::Minus1, 0, dims)?.to_dtype(DType::F32)?;
    if input_scale != 1.0 {
        rot = (rot * input_scale)?;
    }

    let rotated = if traditional {
        // Pairs (2i, 2i+1)
        let pairs = rot.contiguous()?.reshape((b, h, l, half, 2))?;
        let x1 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let x2 = pairs.narrow(4, 1, 1)?.squeeze(4)?;
        let o1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let o2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
        Tensor::stack(&[o1, o2], 4)?.reshape((b, h, l, dims))?
    } else {
        // Pairs (i, i + dims/2)
        let x1 = rot.narrow(D::Minus1, 0, half)?;
        let x2 = rot.narrow(D::Minus1, half, half)?;
        let o1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let o2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
        Tensor::cat(&[o1, o2], D::Minus1)?
    };
    let rotated = rotated.to_dtype(x.dtype())?;

    if dims == head_dim {
        Ok(rotated)
    } else {
        let pass = x.narrow(D::Minus1, dims, head_dim - dims)?;
        Ok(Tensor::cat(&[&rotated, &pass], D::Minus1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn quarter_turn_swaps_halves() {
        // [a, b] rotated by pi/2 gives [-b, a]
        let x = Tensor::new(&[[[[1f32, 2.0]]]], &Device::Cpu).unwrap();
        let out = apply_rotation(&x, vec![0.0], vec![1.0], 2, false, 1.0).unwrap();
        let v: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![-2.0, 1.0]);
    }

    #[test]
    fn traditional_rotates_adjacent_pairs() {
        let x = Tensor::new(&[[[[1f32, 2.0, 3.0, 4.0]]]], &Device::Cpu).unwrap();
        let out = apply_rotation(&x, vec![0.0, 1.0], vec![1.0, 0.0], 4, true, 1.0).unwrap();
        let v: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![-2.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn input_scale_applies_to_rotated_part_only() {
        let x = Tensor::new(&[[[[1f32, 1.0, 5.0]]]], &Device::Cpu).unwrap();
        let out = apply_rotation(&x, vec![1.0], vec![0.0], 2, false, 2.0).unwrap();
        let v: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![2.0, 2.0, 5.0]);
    }

    #[test]
    fn too_many_dims_rejected() {
        let x = Tensor::zeros((1, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(apply_rotation(&x, vec![0.0; 3], vec![0.0; 3], 6, false, 1.0).is_err());
    }
}
