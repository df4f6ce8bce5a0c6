//! Group-wise affine quantization.
//!
//! Values along the last axis are split into groups of `group_size`
//! elements. Each group stores a scale and a bias (its minimum) and every
//! element is mapped to an integer level in `[0, 2^bits - 1]`:
//!
//! `q = round((x - bias) / scale)`, `x' = q * scale + bias`
//!
//! Levels are packed little-end-first into `u32` words, so a row of `dim`
//! elements occupies `dim / (32 / bits)` words.
//!
//! # Supported widths
//!
//! | bits | elements per word | max error per element |
//! |------|-------------------|-----------------------|
//! | 2    | 16                | range / 6             |
//! | 4    | 8                 | range / 30            |
//! | 8    | 4                 | range / 510           |
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::quantization::{quantize, QuantConfig};
//!
//! let config = QuantConfig::new(64, 8)?;
//! let quantized = quantize(&keys, &config)?;
//! let restored = quantized.dequantize()?;
//! ```

mod affine;

pub use affine::{dequantize, quantize, QuantizedTensor};

use crate::error::{CadenceError, Result};
use serde::{Deserialize, Serialize};

/// Default number of elements sharing one scale/bias pair.
pub const DEFAULT_GROUP_SIZE: usize = 64;

/// Default bit width.
pub const DEFAULT_BITS: usize = 8;

/// Bit widths that pack evenly into `u32` words.
pub const SUPPORTED_BITS: [usize; 3] = [2, 4, 8];

/// Quantization configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Elements per scale/bias group.
    pub group_size: usize,
    /// Bits per element.
    pub bits: usize,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            bits: DEFAULT_BITS,
        }
    }
}

impl QuantConfig {
    /// Create a validated configuration.
    pub fn new(group_size: usize, bits: usize) -> Result<Self> {
        let config = Self { group_size, bits };
        config.validate()?;
        Ok(config)
    }

    /// Check that the bit width packs into words and groups hold whole words.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BITS.contains(&self.bits) {
            return Err(CadenceError::config(format!(
                "unsupported quantization width {} bits (expected one of {:?})",
                self.bits, SUPPORTED_BITS
            )));
        }
        if self.group_size == 0 || self.group_size % self.elements_per_word() != 0 {
            return Err(CadenceError::config(format!(
                "group size {} must be a positive multiple of {}",
                self.group_size,
                self.elements_per_word()
            )));
        }
        Ok(())
    }

    /// Check that a row of `dim` elements splits into whole groups.
    pub fn check_width(&self, dim: usize) -> Result<()> {
        self.validate()?;
        if dim == 0 || dim % self.group_size != 0 {
            return Err(CadenceError::config(format!(
                "feature width {} is not divisible by group size {}",
                dim, self.group_size
            )));
        }
        Ok(())
    }

    /// Number of elements packed in one `u32`.
    pub fn elements_per_word(&self) -> usize {
        32 / self.bits
    }

    /// Number of `u32` words needed for `dim` elements.
    pub fn packed_width(&self, dim: usize) -> usize {
        dim / self.elements_per_word()
    }

    /// Number of scale/bias groups for `dim` elements.
    pub fn num_groups(&self, dim: usize) -> usize {
        dim / self.group_size
    }

    /// Highest integer level.
    pub fn max_level(&self) -> u32 {
        (1u32 << self.bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_eight_bit_groups_of_64() {
        let config = QuantConfig::default();
        assert_eq!(config.group_size, 64);
        assert_eq!(config.bits, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn packed_geometry() {
        let config = QuantConfig::new(64, 4).unwrap();
        assert_eq!(config.elements_per_word(), 8);
        assert_eq!(config.packed_width(128), 16);
        assert_eq!(config.num_groups(128), 2);
        assert_eq!(config.max_level(), 15);
    }

    #[test]
    fn rejects_widths_that_do_not_pack() {
        assert!(matches!(
            QuantConfig::new(64, 3),
            Err(CadenceError::InvalidConfiguration(_))
        ));
        assert!(QuantConfig::new(64, 16).is_err());
        // 2-bit packs 16 per word; a group of 8 would split a word
        assert!(QuantConfig::new(8, 2).is_err());
    }

    #[test]
    fn rejects_ragged_rows() {
        let config = QuantConfig::new(32, 8).unwrap();
        assert!(config.check_width(64).is_ok());
        assert!(config.check_width(48).is_err());
    }
}
