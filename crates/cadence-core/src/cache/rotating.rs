//! Fixed-capacity ring cache for sliding-window attention.
//!
//! The ring keeps the first `keep` positions (attention sinks) forever and
//! cycles the remaining `max_size - keep` slots through the newest
//! positions. Each physical slot records the absolute position it holds,
//! so masks and `state()` never have to infer where the ring wrapped.
//!
//! Two write paths:
//!
//! - **Bulk** (several positions at once): reorder to temporal order, drop
//!   the oldest non-sink positions so that `max_size - 1` old positions
//!   remain, then append. The buffer may temporarily exceed `max_size` so
//!   that every new query still sees a full window.
//! - **Single**: grow in steps up to `max_size`, then overwrite the oldest
//!   non-sink slot.
//!
//! Single-token writes go straight into the buffer with `slice_set` when the
//! slot has never been returned. Overwriting a slot that an earlier update
//! handed out first copies the ring into fresh storage, so tensors returned
//! by earlier updates never change. Buffers are kept contiguous.

use super::{allocate, check_kv_pair, reallocate, KeyLayout, KvCache, CACHE_STEP, SEQ_AXIS};
use crate::error::{CadenceError, Result};
use candle_core::Tensor;
use tracing::{debug, trace};

pub(super) fn validate(max_size: usize, keep: usize) -> Result<()> {
    if max_size == 0 {
        return Err(CadenceError::config("rotating cache needs max_size > 0"));
    }
    if keep >= max_size {
        return Err(CadenceError::config(format!(
            "rotating cache keeps {} sinks but holds only {} positions",
            keep, max_size
        )));
    }
    Ok(())
}

/// Ring cache holding at most `max_size` positions between decode steps.
#[derive(Debug, Clone)]
pub struct RotatingKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    /// Absolute position held by each filled slot, in physical order.
    /// Filled slots are always `[0, slots.len())`.
    slots: Vec<usize>,
    max_size: usize,
    keep: usize,
    step: usize,
    offset: usize,
    write_idx: usize,
}

impl RotatingKvCache {
    /// Create an empty ring.
    pub fn new(max_size: usize, keep: usize) -> Result<Self> {
        validate(max_size, keep)?;
        Ok(Self {
            keys: None,
            values: None,
            slots: Vec::new(),
            max_size,
            keep,
            step: CACHE_STEP,
            offset: 0,
            write_idx: 0,
        })
    }

    /// Ring capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of attention sinks.
    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Physical slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.keys.as_ref().map(|k| k.dims()[SEQ_AXIS]).unwrap_or(0)
    }

    fn buffers(&self) -> Result<(&Tensor, &Tensor)> {
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(CadenceError::AllocationFailure(
                "ring buffers missing".to_string(),
            )),
        }
    }

    /// Physical slot indices sorted by the position they hold.
    fn temporal_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by_key(|&i| self.slots[i]);
        order
    }

    /// Sinks plus the newest `recent` non-sink slots, in temporal order.
    fn sinks_and_recent(&self, recent: usize) -> Vec<usize> {
        let order = self.temporal_order();
        let sinks = self.keep.min(order.len());
        let tail_start = order.len().saturating_sub(recent).max(sinks);
        order[..sinks]
            .iter()
            .chain(&order[tail_start..])
            .copied()
            .collect()
    }

    /// Rebuild the buffers from the given physical slots, in that order.
    fn gather(&mut self, physical: &[usize]) -> Result<()> {
        if physical.is_empty() {
            self.keys = None;
            self.values = None;
            self.slots.clear();
            return Ok(());
        }
        let (k, v) = self.buffers()?;
        let ids: Vec<u32> = physical.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, physical.len(), k.device())?;
        let keys = k.contiguous()?.index_select(&ids, SEQ_AXIS)?;
        let values = v.contiguous()?.index_select(&ids, SEQ_AXIS)?;
        self.slots = physical.iter().map(|&i| self.slots[i]).collect();
        self.keys = Some(keys);
        self.values = Some(values);
        Ok(())
    }

    fn update_concat(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        n: usize,
    ) -> Result<(Tensor, Tensor)> {
        if self.keys.is_some() {
            // Every new query needs max_size - 1 predecessors
            let retained = self.sinks_and_recent(self.max_size - 1 - self.keep);
            self.gather(&retained)?;
        }

        let (new_keys, new_values) = match (&self.keys, &self.values) {
            (Some(k), Some(v)) => (
                Tensor::cat(&[k, keys], SEQ_AXIS)?.contiguous()?,
                Tensor::cat(&[v, values], SEQ_AXIS)?.contiguous()?,
            ),
            _ => (keys.contiguous()?, values.contiguous()?),
        };
        self.slots.extend(self.offset..self.offset + n);
        self.keys = Some(new_keys.clone());
        self.values = Some(new_values.clone());
        self.offset += n;
        self.write_idx = self.slots.len();
        Ok((new_keys, new_values))
    }

    fn update_in_place(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        if self.keys.is_none() {
            let capacity = self.step.min(self.max_size);
            self.keys = Some(allocate(keys, capacity)?);
            self.values = Some(allocate(values, capacity)?);
            self.slots.clear();
            self.write_idx = 0;
        } else if self.slots.len() > self.max_size {
            // Oversized after a bulk update: shrink to the ring
            let retained = self.sinks_and_recent(self.max_size - self.keep);
            self.gather(&retained)?;
            self.write_idx = self.max_size;
        } else if self.write_idx == self.capacity() && self.capacity() < self.max_size {
            let capacity = self.capacity() + self.step.min(self.max_size - self.capacity());
            let filled = self.slots.len();
            let (k, v) = self.buffers()?;
            let grown_k = reallocate(k, filled, capacity)?;
            let grown_v = reallocate(v, filled, capacity)?;
            debug!(capacity, max_size = self.max_size, "growing ring");
            self.keys = Some(grown_k);
            self.values = Some(grown_v);
        }

        if self.write_idx == self.max_size {
            self.write_idx = self.keep;
        }

        let (k, v) = self.buffers()?;
        let (k, v) = if self.write_idx < self.slots.len() {
            // The slot is visible through earlier returned tensors
            let capacity = self.capacity();
            trace!(slot = self.write_idx, evicted = self.slots[self.write_idx], "ring overwrite");
            (reallocate(k, capacity, capacity)?, reallocate(v, capacity, capacity)?)
        } else {
            (k.clone(), v.clone())
        };
        k.slice_set(&keys.contiguous()?, SEQ_AXIS, self.write_idx)?;
        v.slice_set(&values.contiguous()?, SEQ_AXIS, self.write_idx)?;
        if self.write_idx == self.slots.len() {
            self.slots.push(self.offset);
        } else {
            self.slots[self.write_idx] = self.offset;
        }
        self.keys = Some(k);
        self.values = Some(v);
        self.offset += 1;
        self.write_idx += 1;

        let filled = self.slots.len();
        let (k, v) = self.buffers()?;
        Ok((k.narrow(SEQ_AXIS, 0, filled)?, v.narrow(SEQ_AXIS, 0, filled)?))
    }
}

impl KvCache for RotatingKvCache {
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = check_kv_pair(keys, values)?;
        if n == 1 {
            self.update_in_place(keys, values)
        } else {
            self.update_concat(keys, values, n)
        }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn trim(&mut self, n: usize) -> Result<usize> {
        let n = n.min(self.offset);
        if n == 0 {
            return Ok(0);
        }
        let cutoff = self.offset - n;
        let retained: Vec<usize> = self
            .temporal_order()
            .into_iter()
            .filter(|&i| self.slots[i] < cutoff)
            .collect();
        self.gather(&retained)?;
        self.offset = cutoff;
        self.write_idx = self.slots.len();
        Ok(n)
    }

    fn state(&self) -> Result<Option<(Tensor, Tensor)>> {
        if self.slots.is_empty() {
            return Ok(None);
        }
        let (k, v) = self.buffers()?;
        let order: Vec<u32> = self.temporal_order().into_iter().map(|i| i as u32).collect();
        let ids = Tensor::from_vec(order, self.slots.len(), k.device())?;
        let keys = k.contiguous()?.index_select(&ids, SEQ_AXIS)?;
        let values = v.contiguous()?.index_select(&ids, SEQ_AXIS)?;
        Ok(Some((keys, values)))
    }

    fn key_layout(&self) -> KeyLayout {
        KeyLayout::Scattered(self.slots.clone())
    }

    fn state_layout(&self) -> KeyLayout {
        let mut positions = self.slots.clone();
        positions.sort_unstable();
        KeyLayout::Scattered(positions)
    }

    fn is_trimmable(&self) -> bool {
        self.offset < self.max_size
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.slots.clear();
        self.offset = 0;
        self.write_idx = 0;
    }
}
