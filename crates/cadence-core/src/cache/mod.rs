//! Per-layer key/value caches for autoregressive decoding.
//!
//! Every attention layer owns one cache. Three layouts are provided:
//!
//! 1. **Growing** - contiguous buffer grown in steps of [`CACHE_STEP`] positions
//! 2. **Rotating** - fixed-capacity ring for sliding-window layers, with
//!    attention sinks that are never evicted
//! 3. **Quantized** - growing buffer of packed affine levels
//!
//! Tensors are `[batch, kv_heads, seq, head_dim]`; the sequence axis is
//! [`SEQ_AXIS`].
//!
//! # Aliasing
//!
//! Tensors returned by `update` may share storage with the cache. A cache
//! only ever writes storage positions that no previously returned tensor
//! covers; anything that would rewrite a visible position (trimming, ring
//! wrap-around) builds fresh storage instead.
//!
//! # Example
//!
//! ```rust
//! use cadence_core::cache::{CacheConfig, KvCache, LayerCache};
//! use candle_core::{DType, Device, Tensor};
//!
//! let mut cache = LayerCache::new(&CacheConfig::Rotating { max_size: 4, keep: 1 }).unwrap();
//! let k = Tensor::zeros((1, 2, 6, 8), DType::F32, &Device::Cpu).unwrap();
//! let (keys, _values) = cache.update(&k, &k).unwrap();
//!
//! assert_eq!(keys.dims(), &[1, 2, 6, 8]);
//! assert_eq!(cache.offset(), 6);
//! ```

mod growing;
mod quantized;
mod rotating;

pub use growing::GrowingKvCache;
pub use quantized::QuantizedKvCache;
pub use rotating::RotatingKvCache;

use crate::error::{CadenceError, Result};
use crate::quantization::QuantConfig;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// Positions added per buffer growth.
pub const CACHE_STEP: usize = 256;

/// Sequence axis of cached tensors.
pub const SEQ_AXIS: usize = 2;

/// Absolute token position of every key in a tensor handed out by a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLayout {
    /// Keys hold positions `start..start + len` in order.
    Contiguous {
        /// First position.
        start: usize,
        /// Number of keys.
        len: usize,
    },
    /// Key `i` holds position `positions[i]`.
    Scattered(Vec<usize>),
}

impl KeyLayout {
    /// Number of keys.
    pub fn len(&self) -> usize {
        match self {
            Self::Contiguous { len, .. } => *len,
            Self::Scattered(positions) => positions.len(),
        }
    }

    /// True when no keys are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of every key.
    pub fn positions(&self) -> Vec<usize> {
        match self {
            Self::Contiguous { start, len } => (*start..*start + *len).collect(),
            Self::Scattered(positions) => positions.clone(),
        }
    }

    /// Smallest and largest key position.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        match self {
            Self::Contiguous { len: 0, .. } => None,
            Self::Contiguous { start, len } => Some((*start, *start + *len - 1)),
            Self::Scattered(positions) => {
                let min = positions.iter().min()?;
                let max = positions.iter().max()?;
                Some((*min, *max))
            }
        }
    }

    /// True when keys are consecutive ascending positions.
    pub fn is_contiguous(&self) -> bool {
        match self {
            Self::Contiguous { .. } => true,
            Self::Scattered(positions) => positions.windows(2).all(|w| w[1] == w[0] + 1),
        }
    }
}

/// Capability shared by all per-layer caches.
pub trait KvCache {
    /// Append keys/values for new positions and return every retained
    /// key/value the layer should attend over.
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Absolute positions processed so far (the RoPE offset).
    fn offset(&self) -> usize;

    /// Positions currently stored.
    fn len(&self) -> usize;

    /// True when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the newest `n` positions. Returns `min(offset, n)`.
    fn trim(&mut self, n: usize) -> Result<usize>;

    /// Real-valued keys/values in temporal order, if any.
    fn state(&self) -> Result<Option<(Tensor, Tensor)>>;

    /// Positions of the keys returned by the last `update`.
    fn key_layout(&self) -> KeyLayout;

    /// Positions of the keys returned by `state`.
    fn state_layout(&self) -> KeyLayout {
        self.key_layout()
    }

    /// Whether `trim` can restore an exact earlier state.
    fn is_trimmable(&self) -> bool {
        true
    }

    /// Forget everything.
    fn reset(&mut self);
}

/// Cache layout chosen for a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Unbounded contiguous cache.
    #[default]
    Growing,
    /// Ring of `max_size` positions keeping the first `keep` forever.
    Rotating {
        /// Capacity of the ring.
        max_size: usize,
        /// Number of attention-sink positions.
        keep: usize,
    },
    /// Unbounded cache of packed affine levels.
    Quantized {
        /// Elements per scale/bias group.
        group_size: usize,
        /// Bits per element.
        bits: usize,
    },
}

impl CacheConfig {
    /// Validate against a layer's head dimension.
    pub fn validate(&self, head_dim: usize) -> Result<()> {
        match *self {
            Self::Growing => Ok(()),
            Self::Rotating { max_size, keep } => rotating::validate(max_size, keep),
            Self::Quantized { group_size, bits } => {
                QuantConfig::new(group_size, bits)?.check_width(head_dim)
            }
        }
    }
}

/// One layer's cache, dispatched statically by variant.
#[derive(Debug, Clone)]
pub enum LayerCache {
    /// See [`GrowingKvCache`].
    Growing(GrowingKvCache),
    /// See [`RotatingKvCache`].
    Rotating(RotatingKvCache),
    /// See [`QuantizedKvCache`].
    Quantized(QuantizedKvCache),
}

impl LayerCache {
    /// Build an empty cache for `config`.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        Ok(match *config {
            CacheConfig::Growing => Self::Growing(GrowingKvCache::new()),
            CacheConfig::Rotating { max_size, keep } => {
                Self::Rotating(RotatingKvCache::new(max_size, keep)?)
            }
            CacheConfig::Quantized { group_size, bits } => {
                Self::Quantized(QuantizedKvCache::new(QuantConfig::new(group_size, bits)?))
            }
        })
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Growing(_) => "growing",
            Self::Rotating(_) => "rotating",
            Self::Quantized(_) => "quantized",
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $cache:ident => $body:expr) => {
        match $self {
            LayerCache::Growing($cache) => $body,
            LayerCache::Rotating($cache) => $body,
            LayerCache::Quantized($cache) => $body,
        }
    };
}

impl KvCache for LayerCache {
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        dispatch!(self, c => c.update(keys, values))
    }

    fn offset(&self) -> usize {
        dispatch!(self, c => c.offset())
    }

    fn len(&self) -> usize {
        dispatch!(self, c => c.len())
    }

    fn trim(&mut self, n: usize) -> Result<usize> {
        dispatch!(self, c => c.trim(n))
    }

    fn state(&self) -> Result<Option<(Tensor, Tensor)>> {
        dispatch!(self, c => c.state())
    }

    fn key_layout(&self) -> KeyLayout {
        dispatch!(self, c => c.key_layout())
    }

    fn state_layout(&self) -> KeyLayout {
        dispatch!(self, c => c.state_layout())
    }

    fn is_trimmable(&self) -> bool {
        dispatch!(self, c => c.is_trimmable())
    }

    fn reset(&mut self) {
        dispatch!(self, c => c.reset())
    }
}

/// Validate a key/value pair and return its sequence length.
pub(crate) fn check_kv_pair(keys: &Tensor, values: &Tensor) -> Result<usize> {
    let (kb, kh, ks, _) = keys.dims4()?;
    let (vb, vh, vs, _) = values.dims4()?;
    if (kb, kh, ks) != (vb, vh, vs) {
        return Err(CadenceError::ShapeMismatch(format!(
            "keys {:?} and values {:?} disagree on batch/heads/seq",
            keys.dims(),
            values.dims()
        )));
    }
    if ks == 0 {
        return Err(CadenceError::EmptyInput(
            "cache update with zero positions".to_string(),
        ));
    }
    Ok(ks)
}

/// Zero-filled buffer shaped like `like` with `capacity` positions.
pub(crate) fn allocate(like: &Tensor, capacity: usize) -> Result<Tensor> {
    allocate_shaped(like.dims(), capacity, like.dtype(), like.device())
}

pub(crate) fn allocate_shaped(
    dims: &[usize],
    capacity: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let mut shape = dims.to_vec();
    shape[SEQ_AXIS] = capacity;
    Tensor::zeros(shape.as_slice(), dtype, device).map_err(|e| {
        CadenceError::AllocationFailure(format!(
            "cannot allocate {:?} {:?} cache buffer: {}",
            shape, dtype, e
        ))
    })
}

/// Fresh buffer of `capacity` positions holding the first `valid` of `buffer`.
pub(crate) fn reallocate(buffer: &Tensor, valid: usize, capacity: usize) -> Result<Tensor> {
    let fresh = allocate(buffer, capacity)?;
    if valid > 0 {
        let prefix = buffer.narrow(SEQ_AXIS, 0, valid)?.contiguous()?;
        fresh.slice_set(&prefix, SEQ_AXIS, 0)?;
    }
    Ok(fresh)
}



#[cfg(test)]
mod proptests {
    use super::testing::{positional, slot_positions};
    use super::*;
    use proptest::prelude::*;

    fn arb_config() -> impl Strategy<Value = CacheConfig> {
        prop_oneof![
            Just(CacheConfig::Growing),
            (2usize..12, 0usize..3).prop_map(|(max_size, keep)| CacheConfig::Rotating {
                max_size,
                keep: keep.min(max_size - 1),
            }),
            Just(CacheConfig::Quantized { group_size: 32, bits: 8 }),
        ]
    }

    proptest! {
        /// Invariant: offset counts every position ever inserted
        #[test]
        fn invariant_offset_counts_positions(
            config in arb_config(),
            chunks in prop::collection::vec(1usize..5, 1..8),
        ) {
            let mut cache = LayerCache::new(&config).unwrap();
            let mut total = 0;
            for n in chunks {
                let k = positional(total, n, 1, 32);
                cache.update(&k, &k).unwrap();
                total += n;
                prop_assert_eq!(cache.offset(), total);
            }
        }

        /// Invariant: trim removes min(offset, n) and never underflows
        #[test]
        fn invariant_trim_saturates(
            config in arb_config(),
            inserted in 1usize..20,
            requested in 0usize..40,
        ) {
            let mut cache = LayerCache::new(&config).unwrap();
            for p in 0..inserted {
                let k = positional(p, 1, 1, 32);
                cache.update(&k, &k).unwrap();
            }
            let removed = cache.trim(requested).unwrap();
            prop_assert_eq!(removed, requested.min(inserted));
            prop_assert_eq!(cache.offset(), inserted - removed);
        }

        /// Invariant: the rotating cache holds the sinks plus the newest positions
        #[test]
        fn invariant_rotating_holds_sinks_and_recent(
            max_size in 2usize..10,
            keep in 0usize..3,
            prefill in 1usize..12,
            decode in 0usize..20,
        ) {
            let keep = keep.min(max_size - 1);
            let mut cache = RotatingKvCache::new(max_size, keep).unwrap();
            let k = positional(0, prefill, 1, 4);
            cache.update(&k, &k).unwrap();
            for p in prefill..prefill + decode {
                let k = positional(p, 1, 1, 4);
                cache.update(&k, &k).unwrap();
            }

            let total = prefill + decode;
            let (keys, _) = cache.state().unwrap().unwrap();
            let held = slot_positions(&keys);
            if decode > 0 && total > max_size {
                let mut expected: Vec<usize> = (0..keep).collect();
                expected.extend(total - (max_size - keep)..total);
                prop_assert_eq!(held, expected);
            } else {
                // Bulk prefill keeps everything until the next single-token step
                prop_assert_eq!(held.len(), cache.len());
                prop_assert_eq!(held.last().copied(), Some(total - 1));
            }
        }
    }
}
