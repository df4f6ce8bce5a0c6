//! Growing cache that stores keys and values as packed affine levels.
//!
//! Memory per position drops from `head_dim` floats to
//! `head_dim * bits / 32` words plus two floats per group. `update` always
//! hands back real-valued tensors; callers with a kernel that consumes
//! packed levels use [`QuantizedKvCache::update_quantized`].

use super::{allocate_shaped, check_kv_pair, reallocate, KeyLayout, KvCache, CACHE_STEP, SEQ_AXIS};
use crate::error::{CadenceError, Result};
use crate::quantization::{dequantize, quantize, QuantConfig, QuantizedTensor};
use candle_core::{DType, Tensor};
use tracing::debug;

/// Packed storage for one of keys or values.
#[derive(Debug, Clone)]
struct PackedBuffer {
    data: Tensor,
    scales: Tensor,
    biases: Tensor,
    dtype: DType,
}

impl PackedBuffer {
    fn empty_like(q: &QuantizedTensor, capacity: usize) -> Result<Self> {
        let alloc = |t: &Tensor| allocate_shaped(t.dims(), capacity, t.dtype(), t.device());
        Ok(Self {
            data: alloc(&q.data)?,
            scales: alloc(&q.scales)?,
            biases: alloc(&q.biases)?,
            dtype: q.dtype,
        })
    }

    fn capacity(&self) -> usize {
        self.data.dims()[SEQ_AXIS]
    }

    fn reallocated(&self, valid: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            data: reallocate(&self.data, valid, capacity)?,
            scales: reallocate(&self.scales, valid, capacity)?,
            biases: reallocate(&self.biases, valid, capacity)?,
            dtype: self.dtype,
        })
    }

    fn write(&self, q: &QuantizedTensor, at: usize) -> Result<()> {
        self.data.slice_set(&q.data.contiguous()?, SEQ_AXIS, at)?;
        self.scales.slice_set(&q.scales.contiguous()?, SEQ_AXIS, at)?;
        self.biases.slice_set(&q.biases.contiguous()?, SEQ_AXIS, at)?;
        Ok(())
    }

    fn view(&self, len: usize, config: QuantConfig) -> Result<QuantizedTensor> {
        Ok(QuantizedTensor {
            data: self.data.narrow(SEQ_AXIS, 0, len)?,
            scales: self.scales.narrow(SEQ_AXIS, 0, len)?,
            biases: self.biases.narrow(SEQ_AXIS, 0, len)?,
            config,
            dtype: self.dtype,
        })
    }

    fn dequantized(&self, len: usize, config: &QuantConfig) -> Result<Tensor> {
        dequantize(
            &self.data.narrow(SEQ_AXIS, 0, len)?,
            &self.scales.narrow(SEQ_AXIS, 0, len)?,
            &self.biases.narrow(SEQ_AXIS, 0, len)?,
            config,
            self.dtype,
        )
    }
}

/// Unbounded cache of group-quantized keys and values.
#[derive(Debug, Clone)]
pub struct QuantizedKvCache {
    keys: Option<PackedBuffer>,
    values: Option<PackedBuffer>,
    offset: usize,
    step: usize,
    config: QuantConfig,
}

impl QuantizedKvCache {
    /// Create an empty cache.
    pub fn new(config: QuantConfig) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            step: CACHE_STEP,
            config,
        }
    }

    /// Quantization parameters.
    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// Positions the current buffers can hold.
    pub fn capacity(&self) -> usize {
        self.keys.as_ref().map(PackedBuffer::capacity).unwrap_or(0)
    }

    fn buffers(&self) -> Result<(&PackedBuffer, &PackedBuffer)> {
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(CadenceError::AllocationFailure(
                "quantized buffers missing after growth".to_string(),
            )),
        }
    }

    /// Append new positions and return the packed views of every position.
    pub fn update_quantized(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(QuantizedTensor, QuantizedTensor)> {
        let new_len = check_kv_pair(keys, values)?;
        let qk = quantize(keys, &self.config)?;
        let qv = quantize(values, &self.config)?;

        let needed = self.offset + new_len;
        if needed > self.capacity() {
            let capacity = needed.div_ceil(self.step) * self.step;
            let (new_keys, new_values) = match (&self.keys, &self.values) {
                (Some(k), Some(v)) => (
                    k.reallocated(self.offset, capacity)?,
                    v.reallocated(self.offset, capacity)?,
                ),
                _ => (
                    PackedBuffer::empty_like(&qk, capacity)?,
                    PackedBuffer::empty_like(&qv, capacity)?,
                ),
            };
            debug!(
                to = capacity,
                offset = self.offset,
                bits = self.config.bits,
                "growing quantized kv cache"
            );
            self.keys = Some(new_keys);
            self.values = Some(new_values);
        }

        let (k_buf, v_buf) = self.buffers()?;
        k_buf.write(&qk, self.offset)?;
        v_buf.write(&qv, self.offset)?;
        let out = (k_buf.view(needed, self.config)?, v_buf.view(needed, self.config)?);
        self.offset = needed;
        Ok(out)
    }
}

impl KvCache for QuantizedKvCache {
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let (qk, qv) = self.update_quantized(keys, values)?;
        Ok((qk.dequantize()?, qv.dequantize()?))
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn len(&self) -> usize {
        self.offset
    }

    fn trim(&mut self, n: usize) -> Result<usize> {
        let n = n.min(self.offset);
        if n == 0 {
            return Ok(0);
        }
        let retained = self.offset - n;
        if let (Some(k), Some(v)) = (&self.keys, &self.values) {
            let capacity = k.capacity();
            let new_keys = k.reallocated(retained, capacity)?;
            let new_values = v.reallocated(retained, capacity)?;
            self.keys = Some(new_keys);
            self.values = Some(new_values);
        }
        self.offset = retained;
        Ok(n)
    }

    fn state(&self) -> Result<Option<(Tensor, Tensor)>> {
        if self.offset == 0 {
            return Ok(None);
        }
        let (k, v) = self.buffers()?;
        Ok(Some((
            k.dequantized(self.offset, &self.config)?,
            v.dequantized(self.offset, &self.config)?,
        )))
    }

    fn key_layout(&self) -> KeyLayout {
        KeyLayout::Contiguous {
            start: 0,
            len: self.offset,
        }
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.offset = 0;
    }
}
