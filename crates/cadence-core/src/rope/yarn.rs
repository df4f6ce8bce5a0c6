//! YaRN ("Yet another RoPE extensioN") scaling.
//!
//! Dims that complete many rotations inside the original context keep
//! their frequency (extrapolation), slow dims are divided by `factor`
//! (interpolation), and a linear ramp blends the range in between. Inputs
//! are rescaled by `mscale` to keep attention entropy stable.

use super::base_periods;
use std::f64::consts::PI;

/// Precomputed YaRN frequencies and magnitude scale.
#[derive(Debug, Clone)]
pub struct YarnRope {
    inv_freq: Vec<f64>,
    mscale: f64,
}

fn correction_dim(rotations: f64, dimensions: usize, base: f64, original: f64) -> f64 {
    dimensions as f64 * (original / (rotations * 2.0 * PI)).ln() / (2.0 * base.ln())
}

fn get_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}

impl YarnRope {
    /// Build the frequency table.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dimensions: usize,
        base: f64,
        factor: f64,
        original_max_position: usize,
        beta_fast: f64,
        beta_slow: f64,
        mscale: f64,
        mscale_all_dim: f64,
    ) -> Self {
        let original = original_max_position as f64;
        let low = correction_dim(beta_fast, dimensions, base, original)
            .floor()
            .max(0.0);
        let mut high = correction_dim(beta_slow, dimensions, base, original)
            .ceil()
            .min((dimensions - 1) as f64);
        if low == high {
            high += 0.001;
        }

        let inv_freq = base_periods(dimensions, base)
            .into_iter()
            .enumerate()
            .map(|(i, freq_extra)| {
                let ramp = ((i as f64 - low) / (high - low)).clamp(0.0, 1.0);
                let extrapolate = 1.0 - ramp;
                let freq_inter = factor * freq_extra;
                let freq = (freq_inter * freq_extra)
                    / (freq_inter * extrapolate + freq_extra * (1.0 - extrapolate));
                1.0 / freq
            })
            .collect();

        Self {
            inv_freq,
            mscale: get_mscale(factor, mscale) / get_mscale(factor, mscale_all_dim),
        }
    }

    /// Frequencies of every rotated pair.
    pub fn inv_freq(&self) -> &[f64] {
        &self.inv_freq
    }

    /// Input magnitude scale.
    pub fn mscale(&self) -> f64 {
        self.mscale
    }
}
