//! Contiguous cache grown in fixed steps.

use super::{allocate, check_kv_pair, reallocate, KeyLayout, KvCache, CACHE_STEP, SEQ_AXIS};
use crate::error::{CadenceError, Result};
use candle_core::Tensor;
use tracing::debug;

/// Unbounded cache storing positions `[0, offset)` contiguously.
///
/// Capacity is always a multiple of the step; new positions are written
/// into spare capacity in place, so a decode step costs one slice copy.
#[derive(Debug, Clone)]
pub struct GrowingKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    offset: usize,
    step: usize,
}

impl Default for GrowingKvCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowingKvCache {
    /// Create an empty cache growing by [`CACHE_STEP`].
    pub fn new() -> Self {
        Self::with_step(CACHE_STEP)
    }

    /// Create an empty cache growing by `step` positions.
    pub fn with_step(step: usize) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            step: step.max(1),
        }
    }

    /// Positions the current buffers can hold.
    pub fn capacity(&self) -> usize {
        self.keys.as_ref().map(|k| k.dims()[SEQ_AXIS]).unwrap_or(0)
    }

    fn buffers(&self) -> Result<(&Tensor, &Tensor)> {
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(CadenceError::AllocationFailure(
                "cache buffers missing after growth".to_string(),
            )),
        }
    }

    /// Make room for `needed` positions, copying the valid prefix.
    fn grow(&mut self, keys: &Tensor, values: &Tensor, needed: usize) -> Result<()> {
        let capacity = needed.div_ceil(self.step) * self.step;
        let (new_keys, new_values) = match (&self.keys, &self.values) {
            (Some(k), Some(v)) => (
                reallocate(k, self.offset, capacity)?,
                reallocate(v, self.offset, capacity)?,
            ),
            _ => (allocate(keys, capacity)?, allocate(values, capacity)?),
        };
        debug!(
            from = self.capacity(),
            to = capacity,
            offset = self.offset,
            "growing kv cache"
        );
        self.keys = Some(new_keys);
        self.values = Some(new_values);
        Ok(())
    }
}

impl KvCache for GrowingKvCache {
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let new_len = check_kv_pair(keys, values)?;
        let needed = self.offset + new_len;
        if needed > self.capacity() {
            self.grow(keys, values, needed)?;
        }

        let (k_buf, v_buf) = self.buffers()?;
        // Only [offset, needed) is written; earlier views never see it change
        k_buf.slice_set(&keys.contiguous()?, SEQ_AXIS, self.offset)?;
        v_buf.slice_set(&values.contiguous()?, SEQ_AXIS, self.offset)?;
        let out = (
            k_buf.narrow(SEQ_AXIS, 0, needed)?,
            v_buf.narrow(SEQ_AXIS, 0, needed)?,
        );
        self.offset = needed;
        Ok(out)
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
        // Trimmed slots are visible through earlier views, so the retained
        // prefix moves to fresh storage before anything is rewritten.
        if let (Some(k), Some(v)) = (&self.keys, &self.values) {
            let capacity = k.dims()[SEQ_AXIS];
            let new_keys = reallocate(k, retained, capacity)?;
            let new_values = reallocate(v, retained, capacity)?;
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
            k.narrow(SEQ_AXIS, 0, self.offset)?,
            v.narrow(SEQ_AXIS, 0, self.offset)?,
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
