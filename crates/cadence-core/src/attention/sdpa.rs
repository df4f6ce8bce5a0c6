//! Scaled dot-product attention over cached keys and values.

use super::mask::AttentionMask;
use crate::error::{CadenceError, Result};
use candle_core::{DType, Tensor, D};

/// Repeat KV heads so grouped-query attention can use a plain matmul.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [b, kv, seq, d] -> [b, kv, repeat, seq, d] -> [b, kv * repeat, seq, d]
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?;
    Ok(x)
}

/// `softmax(softcap(q k^T * scale) + mask) v`.
///
/// * `q` - `[batch, heads, queries, head_dim]`
/// * `k`, `v` - `[batch, kv_heads, keys, head_dim]`; `heads` must be a
///   multiple of `kv_heads`
/// * `softcap` - when set, scores become `cap * tanh(scores / cap)`
///
/// Scores and softmax run in f32; the output has `q`'s dtype.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    mask: &AttentionMask,
    softcap: Option<f64>,
) -> Result<Tensor> {
    let out_dtype = q.dtype();
    let (_, num_heads, n_queries, _) = q.dims4()?;
    let (_, num_kv_heads, n_keys, _) = k.dims4()?;
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(CadenceError::ShapeMismatch(format!(
            "{} query heads cannot share {} kv heads",
            num_heads, num_kv_heads
        )));
    }
    let repeat = num_heads / num_kv_heads;
    let k = repeat_kv(k, repeat)?.to_dtype(DType::F32)?;
    let v = repeat_kv(v, repeat)?.to_dtype(DType::F32)?;
    let q = q.to_dtype(DType::F32)?;

    let mut scores = (q.contiguous()?.matmul(&k.t()?.contiguous()?)? * scale)?;
    if let Some(cap) = softcap {
        scores = ((scores / cap)?.tanh()? * cap)?;
    }
    if let Some(additive) = mask.to_additive(n_queries, n_keys, scores.device())? {
        scores = scores.broadcast_add(&additive)?;
    }

    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let out = weights.matmul(&v.contiguous()?)?;
    Ok(out.to_dtype(out_dtype)?)
}
