//! LongRope (Phi-3 "su") scaling with per-pair rescale factors.
//!
//! Positions inside the original context use the short factors, later
//! positions the long ones. The choice is made per absolute position, so a
//! prompt that crosses the boundary encodes the same as token-by-token
//! decoding would.

use super::base_periods;

/// Precomputed short and long frequency tables.
#[derive(Debug, Clone)]
pub struct LongRope {
    short_inv_freq: Vec<f64>,
    long_inv_freq: Vec<f64>,
    original_max_position: usize,
    scale: f64,
}

impl LongRope {
    /// Build both tables. Factor lengths are checked by the caller.
    pub fn new(
        dimensions: usize,
        base: f64,
        short_factor: &[f64],
        long_factor: &[f64],
        original_max_position: usize,
        max_position: usize,
        magnitude_scale: Option<f64>,
    ) -> Self {
        let periods = base_periods(dimensions, base);
        let table = |factors: &[f64]| -> Vec<f64> {
            periods
                .iter()
                .zip(factors)
                .map(|(period, factor)| 1.0 / (factor * period))
                .collect()
        };

        let scale = magnitude_scale.unwrap_or_else(|| {
            let ratio = max_position as f64 / original_max_position as f64;
            if ratio <= 1.0 {
                1.0
            } else {
                (1.0 + ratio.ln() / (original_max_position as f64).ln()).sqrt()
            }
        });

        Self {
            short_inv_freq: table(short_factor),
            long_inv_freq: table(long_factor),
            original_max_position,
            scale,
        }
    }

    /// Frequencies used at absolute `position`.
    pub fn inv_freq(&self, position: usize) -> &[f64] {
        if position < self.original_max_position {
            &self.short_inv_freq
        } else {
            &self.long_inv_freq
        }
    }

    /// Input magnitude scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}
