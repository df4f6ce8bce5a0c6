//! Rotary Position Embeddings (RoPE) and their long-context variants.
//!
//! RoPE encodes position by rotating pairs of query/key features by an
//! angle `position * inv_freq[i]`. The variants differ only in how the
//! per-pair frequencies (and optionally the input magnitude) are derived:
//!
//! | variant   | frequencies                                         | input scale |
//! |-----------|-----------------------------------------------------|-------------|
//! | Default   | `base^(-2i/d)`                                      | 1           |
//! | Linear    | default, position divided by `factor`               | 1           |
//! | Llama3    | low band divided by `factor`, medium band smoothed  | 1           |
//! | Yarn      | NTK-by-parts ramp between interpolated/extrapolated | `mscale`    |
//! | LongRope  | per-pair short/long rescale, chosen per position    | `sqrt(1 + ln s / ln L)` |
//!
//! Angles are computed per absolute position, so applying RoPE to a whole
//! prompt at offset 0 gives the same result as applying it one token at a
//! time with offsets `0..n`.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

mod llama3;
mod longrope;
mod rotate;
mod yarn;

pub use llama3::Llama3Rope;
pub use longrope::LongRope;
pub use yarn::YarnRope;

use crate::error::{CadenceError, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// How frequencies are rescaled for context extension.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RopeScaling {
    /// Plain RoPE.
    #[default]
    Default,
    /// Positions divided by `factor`.
    Linear {
        /// Interpolation factor.
        factor: f64,
    },
    /// Llama 3.1 wavelength-banded scaling.
    Llama3 {
        /// Scale applied to the low-frequency band.
        factor: f64,
        /// Wavelength boundary of the low band, as a divisor of the original context.
        low_freq_factor: f64,
        /// Wavelength boundary of the high band, as a divisor of the original context.
        high_freq_factor: f64,
        /// Context length the model was trained on.
        original_max_position: usize,
    },
    /// YaRN scaling.
    Yarn {
        /// Context extension factor.
        factor: f64,
        /// Context length the model was trained on.
        original_max_position: usize,
        /// Rotation count bounding the extrapolated (fast) dims.
        beta_fast: f64,
        /// Rotation count bounding the interpolated (slow) dims.
        beta_slow: f64,
        /// Magnitude coefficient.
        mscale: f64,
        /// Magnitude coefficient shared by all dims.
        mscale_all_dim: f64,
    },
    /// Phi-3 style LongRope.
    LongRope {
        /// Per-pair factors for positions below `original_max_position`.
        short_factor: Vec<f64>,
        /// Per-pair factors for positions at or beyond it.
        long_factor: Vec<f64>,
        /// Context length the model was trained on.
        original_max_position: usize,
        /// Extended context length.
        max_position: usize,
        /// Input magnitude override.
        magnitude_scale: Option<f64>,
    },
}

/// Full RoPE description for a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeSpec {
    /// Number of leading features rotated (the rest pass through).
    pub dimensions: usize,
    /// Frequency base (theta).
    pub base: f64,
    /// Rotate interleaved pairs `(2i, 2i+1)` instead of halves `(i, i + d/2)`.
    pub traditional: bool,
    /// Frequency rescaling.
    pub scaling: RopeScaling,
}

impl RopeSpec {
    /// Plain RoPE over `dimensions` features.
    pub fn new(dimensions: usize, base: f64) -> Self {
        Self {
            dimensions,
            base,
            traditional: false,
            scaling: RopeScaling::Default,
        }
    }

    /// Set the frequency rescaling.
    pub fn with_scaling(mut self, scaling: RopeScaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// Use interleaved pairs.
    pub fn traditional(mut self, traditional: bool) -> Self {
        self.traditional = traditional;
        self
    }

    /// Build a spec from a `rope_scaling` config block.
    ///
    /// Recognized types: `default`, `linear`, `llama3`, `yarn`,
    /// `deepseek_yarn`, `longrope`, `su`.
    pub fn from_config(
        dimensions: usize,
        base: f64,
        traditional: bool,
        scaling: Option<&RopeScalingConfig>,
        max_position: usize,
    ) -> Result<Self> {
        let scaling = match scaling {
            Some(cfg) => cfg.resolve(dimensions, max_position)?,
            None => RopeScaling::Default,
        };
        let spec = Self {
            dimensions,
            base,
            traditional,
            scaling,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check dimensions, base and factors.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 || self.dimensions % 2 != 0 {
            return Err(CadenceError::config(format!(
                "rope dimensions must be a positive even number, got {}",
                self.dimensions
            )));
        }
        if self.base.is_nan() || self.base <= 0.0 {
            return Err(CadenceError::config(format!(
                "rope base must be positive, got {}",
                self.base
            )));
        }
        let factor = match &self.scaling {
            RopeScaling::Default | RopeScaling::LongRope { .. } => 1.0,
            RopeScaling::Linear { factor }
            | RopeScaling::Llama3 { factor, .. }
            | RopeScaling::Yarn { factor, .. } => *factor,
        };
        if !(factor > 0.0) {
            return Err(CadenceError::config(format!(
                "rope scaling factor must be positive, got {}",
                factor
            )));
        }
        if let RopeScaling::Llama3 {
            low_freq_factor,
            high_freq_factor,
            ..
        } = &self.scaling
        {
            if high_freq_factor <= low_freq_factor {
                return Err(CadenceError::config(format!(
                    "llama3 rope needs high_freq_factor > low_freq_factor ({} <= {})",
                    high_freq_factor, low_freq_factor
                )));
            }
        }
        if let RopeScaling::LongRope {
            short_factor,
            long_factor,
            original_max_position,
            ..
        } = &self.scaling
        {
            let half = self.dimensions / 2;
            if short_factor.len() != half || long_factor.len() != half {
                return Err(CadenceError::config(format!(
                    "longrope factors must have {} entries, got {} short and {} long",
                    half,
                    short_factor.len(),
                    long_factor.len()
                )));
            }
            if *original_max_position < 2 {
                return Err(CadenceError::config(
                    "longrope original_max_position must be at least 2",
                ));
            }
        }
        Ok(())
    }
}

/// The `rope_scaling` object of a HF-style `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RopeScalingConfig {
    /// Variant name.
    #[serde(default)]
    pub rope_type: Option<String>,
    /// Legacy spelling of `rope_type`.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    /// Scaling factor.
    #[serde(default)]
    pub factor: Option<f64>,
    /// Llama3 low band divisor.
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    /// Llama3 high band divisor.
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    /// Training context length.
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    /// YaRN fast boundary.
    #[serde(default)]
    pub beta_fast: Option<f64>,
    /// YaRN slow boundary.
    #[serde(default)]
    pub beta_slow: Option<f64>,
    /// YaRN magnitude coefficient.
    #[serde(default)]
    pub mscale: Option<f64>,
    /// YaRN shared magnitude coefficient.
    #[serde(default)]
    pub mscale_all_dim: Option<f64>,
    /// LongRope short factors.
    #[serde(default)]
    pub short_factor: Option<Vec<f64>>,
    /// LongRope long factors.
    #[serde(default)]
    pub long_factor: Option<Vec<f64>>,
    /// LongRope magnitude override.
    #[serde(default)]
    pub attention_factor: Option<f64>,
}

impl RopeScalingConfig {
    /// Variant name, preferring `rope_type` over `type`.
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }

    fn require_factor(&self) -> Result<f64> {
        self.factor.ok_or_else(|| {
            CadenceError::config(format!("rope scaling '{}' requires 'factor'", self.kind()))
        })
    }

    fn resolve(&self, dimensions: usize, max_position: usize) -> Result<RopeScaling> {
        Ok(match self.kind() {
            "default" => RopeScaling::Default,
            "linear" => RopeScaling::Linear {
                factor: self.require_factor()?,
            },
            "llama3" => RopeScaling::Llama3 {
                factor: self.require_factor()?,
                low_freq_factor: self.low_freq_factor.unwrap_or(1.0),
                high_freq_factor: self.high_freq_factor.unwrap_or(4.0),
                original_max_position: self.original_max_position_embeddings.unwrap_or(8192),
            },
            "yarn" | "deepseek_yarn" => RopeScaling::Yarn {
                factor: self.require_factor()?,
                original_max_position: self.original_max_position_embeddings.unwrap_or(4096),
                beta_fast: self.beta_fast.unwrap_or(32.0),
                beta_slow: self.beta_slow.unwrap_or(1.0),
                mscale: self.mscale.unwrap_or(1.0),
                mscale_all_dim: self.mscale_all_dim.unwrap_or(0.0),
            },
            "longrope" | "su" => {
                let missing = |field: &str| {
                    CadenceError::config(format!("longrope scaling requires '{}'", field))
                };
                RopeScaling::LongRope {
                    short_factor: self.short_factor.clone().ok_or_else(|| missing("short_factor"))?,
                    long_factor: self.long_factor.clone().ok_or_else(|| missing("long_factor"))?,
                    original_max_position: self
                        .original_max_position_embeddings
                        .ok_or_else(|| missing("original_max_position_embeddings"))?,
                    max_position,
                    magnitude_scale: self.attention_factor,
                }
            }
            other => {
                return Err(CadenceError::config(format!(
                    "unsupported rope scaling type '{}' (dims {})",
                    other, dimensions
                )))
            }
        })
    }
}

/// Plain or linearly interpolated RoPE.
#[derive(Debug, Clone)]
pub struct DefaultRope {
    inv_freq: Vec<f64>,
    position_scale: f64,
}

impl DefaultRope {
    /// Frequencies for `dimensions` features with positions divided by `factor`.
    pub fn new(dimensions: usize, base: f64, factor: f64) -> Self {
        Self {
            inv_freq: base_inv_freq(dimensions, base),
            position_scale: 1.0 / factor,
        }
    }
}

/// `base^(-2i/dims)` for every rotated pair.
pub(crate) fn base_inv_freq(dimensions: usize, base: f64) -> Vec<f64> {
    base_periods(dimensions, base).iter().map(|p| 1.0 / p).collect()
}

/// `base^(2i/dims)`: the wavelength (in radians per position) of each pair.
pub(crate) fn base_periods(dimensions: usize, base: f64) -> Vec<f64> {
    (0..dimensions / 2)
        .map(|i| base.powf((2 * i) as f64 / dimensions as f64))
        .collect()
}

#[derive(Debug, Clone)]
enum Variant {
    Default(DefaultRope),
    Llama3(Llama3Rope),
    Yarn(YarnRope),
    LongRope(LongRope),
}

/// A ready-to-apply position encoder for one layer group.
#[derive(Debug, Clone)]
pub struct PositionEncoder {
    dimensions: usize,
    traditional: bool,
    variant: Variant,
}

impl PositionEncoder {
    /// Precompute frequencies for `spec`.
    pub fn new(spec: &RopeSpec) -> Result<Self> {
        spec.validate()?;
        let dims = spec.dimensions;
        let variant = match &spec.scaling {
            RopeScaling::Default => Variant::Default(DefaultRope::new(dims, spec.base, 1.0)),
            RopeScaling::Linear { factor } => {
                Variant::Default(DefaultRope::new(dims, spec.base, *factor))
            }
            RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position,
            } => Variant::Llama3(Llama3Rope::new(
                dims,
                spec.base,
                *factor,
                *low_freq_factor,
                *high_freq_factor,
                *original_max_position,
            )),
            RopeScaling::Yarn {
                factor,
                original_max_position,
                beta_fast,
                beta_slow,
                mscale,
                mscale_all_dim,
            } => Variant::Yarn(YarnRope::new(
                dims,
                spec.base,
                *factor,
                *original_max_position,
                *beta_fast,
                *beta_slow,
                *mscale,
                *mscale_all_dim,
            )),
            RopeScaling::LongRope {
                short_factor,
                long_factor,
                original_max_position,
                max_position,
                magnitude_scale,
            } => Variant::LongRope(LongRope::new(
                dims,
                spec.base,
                short_factor,
                long_factor,
                *original_max_position,
                *max_position,
                *magnitude_scale,
            )),
        };
        Ok(Self {
            dimensions: dims,
            traditional: spec.traditional,
            variant,
        })
    }

    /// Rotated feature count.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self.variant {
            Variant::Default(_) => "default",
            Variant::Llama3(_) => "llama3",
            Variant::Yarn(_) => "yarn",
            Variant::LongRope(_) => "longrope",
        }
    }

    /// Frequencies used at absolute `position`.
    pub fn inv_freq(&self, position: usize) -> &[f64] {
        match &self.variant {
            Variant::Default(r) => &r.inv_freq,
            Variant::Llama3(r) => r.inv_freq(),
            Variant::Yarn(r) => r.inv_freq(),
            Variant::LongRope(r) => r.inv_freq(position),
        }
    }

    /// Factor applied to rotated features before rotation.
    pub fn input_scale(&self) -> f64 {
        match &self.variant {
            Variant::Default(_) | Variant::Llama3(_) => 1.0,
            Variant::Yarn(r) => r.mscale(),
            Variant::LongRope(r) => r.scale(),
        }
    }

    fn position_scale(&self) -> f64 {
        match &self.variant {
            Variant::Default(r) => r.position_scale,
            _ => 1.0,
        }
    }

    /// Rotate `x` (`[batch, heads, seq, head_dim]`) for positions
    /// `offset..offset + seq`.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        let half = self.dimensions / 2;
        let position_scale = self.position_scale();

        let mut cos = Vec::with_capacity(seq_len * half);
        let mut sin = Vec::with_capacity(seq_len * half);
        for position in offset..offset + seq_len {
            let scaled = position as f64 * position_scale;
            for f in self.inv_freq(position) {
                let angle = scaled * f;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        rotate::apply_rotation(
            x,
            cos,
            sin,
            self.dimensions,
            self.traditional,
            self.input_scale(),
        )
    }

    /// Rotate queries and keys with the same offset.
    pub fn apply_pair(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.apply(q, offset)?, self.apply(k, offset)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    fn all_variants(dims: usize) -> Vec<RopeSpec> {
        let half = dims / 2;
        vec![
            RopeSpec::new(dims, 10000.0),
            RopeSpec::new(dims, 10000.0).with_scaling(RopeScaling::Linear { factor: 4.0 }),
            RopeSpec::new(dims, 500000.0).with_scaling(RopeScaling::Llama3 {
                factor: 8.0,
                low_freq_factor: 1.0,
                high_freq_factor: 4.0,
                original_max_position: 16,
            }),
            RopeSpec::new(dims, 10000.0).with_scaling(RopeScaling::Yarn {
                factor: 4.0,
                original_max_position: 64,
                beta_fast: 32.0,
                beta_slow: 1.0,
                mscale: 1.0,
                mscale_all_dim: 0.0,
            }),
            RopeSpec::new(dims, 10000.0).with_scaling(RopeScaling::LongRope {
                short_factor: (0..half).map(|i| 1.0 + i as f64 * 0.1).collect(),
                long_factor: (0..half).map(|i| 2.0 + i as f64 * 0.5).collect(),
                // Switch inside the test sequence
                original_max_position: 5,
                max_position: 40,
                magnitude_scale: None,
            }),
        ]
    }

    #[test]
    fn token_by_token_matches_full_sequence() {
        let x = Tensor::randn(0f32, 1.0, (1, 3, 9, 16), &Device::Cpu).unwrap();
        for traditional in [false, true] {
            for spec in all_variants(16) {
                let rope = PositionEncoder::new(&spec.clone().traditional(traditional)).unwrap();
                let full = rope.apply(&x, 0).unwrap();

                let steps: Vec<Tensor> = (0..9)
                    .map(|p| rope.apply(&x.narrow(2, p, 1).unwrap(), p).unwrap())
                    .collect();
                let stepwise = Tensor::cat(&steps, 2).unwrap();
                assert!(
                    max_diff(&full, &stepwise) < 1e-6,
                    "{} traditional={}",
                    rope.kind(),
                    traditional
                );
            }
        }
    }

    #[test]
    fn position_zero_is_identity_without_input_scale() {
        let x = Tensor::randn(0f32, 1.0, (1, 2, 1, 8), &Device::Cpu).unwrap();
        let rope = PositionEncoder::new(&RopeSpec::new(8, 10000.0)).unwrap();
        assert!(max_diff(&rope.apply(&x, 0).unwrap(), &x) < 1e-7);
    }

    #[test]
    fn rotation_preserves_pair_norms() {
        let x = Tensor::randn(0f32, 1.0, (1, 1, 4, 8), &Device::Cpu).unwrap();
        let rope = PositionEncoder::new(&RopeSpec::new(8, 10000.0)).unwrap();
        let y = rope.apply(&x, 37).unwrap();
        let nx = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let ny = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((nx - ny).abs() < 1e-3);
    }

    #[test]
    fn linear_divides_position() {
        let x = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &Device::Cpu).unwrap();
        let plain = PositionEncoder::new(&RopeSpec::new(8, 10000.0)).unwrap();
        let linear = PositionEncoder::new(
            &RopeSpec::new(8, 10000.0).with_scaling(RopeScaling::Linear { factor: 4.0 }),
        )
        .unwrap();
        let a = linear.apply(&x, 12).unwrap();
        let b = plain.apply(&x, 3).unwrap();
        assert!(max_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn partial_rotation_passes_tail_through() {
        let x = Tensor::randn(0f32, 1.0, (1, 2, 3, 16), &Device::Cpu).unwrap();
        let rope = PositionEncoder::new(&RopeSpec::new(8, 10000.0)).unwrap();
        let y = rope.apply(&x, 5).unwrap();
        assert_eq!(y.dims(), x.dims());
        let tail_x = x.narrow(3, 8, 8).unwrap();
        let tail_y = y.narrow(3, 8, 8).unwrap();
        assert_eq!(max_diff(&tail_x, &tail_y), 0.0);
    }

    #[test]
    fn parses_scaling_types() {
        let parse = |json: &str| {
            let cfg: RopeScalingConfig = serde_json::from_str(json).unwrap();
            RopeSpec::from_config(64, 10000.0, false, Some(&cfg), 8192)
        };

        let linear = parse(r#"{"type": "linear", "factor": 2.0}"#).unwrap();
        assert_eq!(linear.scaling, RopeScaling::Linear { factor: 2.0 });

        let llama3 = parse(
            r#"{"rope_type": "llama3", "factor": 8.0, "low_freq_factor": 1.0,
                "high_freq_factor": 4.0, "original_max_position_embeddings": 8192}"#,
        )
        .unwrap();
        assert!(matches!(llama3.scaling, RopeScaling::Llama3 { .. }));

        let yarn = parse(r#"{"type": "deepseek_yarn", "factor": 40.0}"#).unwrap();
        assert!(matches!(
            yarn.scaling,
            RopeScaling::Yarn { original_max_position: 4096, .. }
        ));

        let su = parse(&format!(
            r#"{{"type": "su", "short_factor": {:?}, "long_factor": {:?},
                "original_max_position_embeddings": 4096}}"#,
            vec![1.0; 32],
            vec![2.0; 32]
        ))
        .unwrap();
        assert!(matches!(su.scaling, RopeScaling::LongRope { max_position: 8192, .. }));

        // Both spellings present: rope_type wins
        let both = parse(r#"{"type": "linear", "rope_type": "default"}"#).unwrap();
        assert_eq!(both.scaling, RopeScaling::Default);
    }

    #[test]
    fn rejects_unknown_or_incomplete_scaling() {
        let parse = |json: &str| {
            let cfg: RopeScalingConfig = serde_json::from_str(json).unwrap();
            RopeSpec::from_config(64, 10000.0, false, Some(&cfg), 8192)
        };
        assert!(matches!(
            parse(r#"{"type": "dynamic", "factor": 2.0}"#),
            Err(CadenceError::InvalidConfiguration(_))
        ));
        assert!(parse(r#"{"type": "linear"}"#).is_err());
        assert!(parse(r#"{"type": "longrope", "short_factor": [1.0], "long_factor": [1.0],
                         "original_max_position_embeddings": 4096}"#)
            .is_err());
        assert!(parse(r#"{"type": "linear", "factor": 0.0}"#).is_err());
    }

    #[test]
    fn rejects_odd_dimensions() {
        assert!(PositionEncoder::new(&RopeSpec::new(7, 10000.0)).is_err());
    }

    #[test]
    fn rejects_non_positive_or_nan_base() {
        for base in [0.0, -1.0, f64::NAN] {
            assert!(RopeSpec::new(8, base).validate().is_err(), "base {}", base);
        }
    }
}
