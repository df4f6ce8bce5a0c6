//! Llama 3.1 frequency scaling.
//!
//! Wavelengths longer than `original / low_freq_factor` are interpolated by
//! `factor`, wavelengths shorter than `original / high_freq_factor` are left
//! alone, and the band in between blends smoothly between the two.

use super::base_periods;
use std::f64::consts::PI;

/// Precomputed Llama3 frequencies.
#[derive(Debug, Clone)]
pub struct Llama3Rope {
    inv_freq: Vec<f64>,
}

impl Llama3Rope {
    /// Build the frequency table. Callers guarantee `high_freq_factor > low_freq_factor`.
    pub fn new(
        dimensions: usize,
        base: f64,
        factor: f64,
        low_freq_factor: f64,
        high_freq_factor: f64,
        original_max_position: usize,
    ) -> Self {
        let original = original_max_position as f64;
        let low_freq_wavelen = original / low_freq_factor;
        let high_freq_wavelen = original / high_freq_factor;

        let inv_freq = base_periods(dimensions, base)
            .into_iter()
            .map(|period| {
                let wavelen = 2.0 * PI * period;
                let scaled = if wavelen > low_freq_wavelen {
                    period * factor
                } else if wavelen < high_freq_wavelen {
                    period
                } else {
                    let smooth = (original / wavelen - low_freq_factor)
                        / (high_freq_factor - low_freq_factor);
                    period / ((1.0 - smooth) / factor + smooth)
                };
                1.0 / scaled
            })
            .collect();
        Self { inv_freq }
    }

    /// Frequencies of every rotated pair.
    pub fn inv_freq(&self) -> &[f64] {
        &self.inv_freq
    }
}
