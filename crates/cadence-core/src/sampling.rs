//! Next-token selection from logits.
//!
//! Processing order:
//!
//! 1. Repetition penalty over the last `repetition_context_size` tokens of
//!    history (positive logits divided, negative multiplied)
//! 2. `temperature == 0` returns the arg-max
//! 3. Temperature-scaled softmax
//! 4. Top-k (when `top_k > 0`), then nucleus filtering (when `0 < top_p < 1`)
//! 5. Renormalize and draw from a seeded [`StdRng`]

use crate::error::{CadenceError, Result};
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature; 0 means greedy.
    pub temperature: f32,
    /// Nucleus mass; values outside `(0, 1)` disable the filter.
    pub top_p: f32,
    /// Keep only the `top_k` most probable tokens; 0 disables the filter.
    pub top_k: usize,
    /// Penalty for recently seen tokens.
    pub repetition_penalty: Option<f32>,
    /// How many trailing history tokens the penalty looks at.
    pub repetition_context_size: usize,
    /// Seed for reproducible draws.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 0,
            repetition_penalty: None,
            repetition_context_size: 20,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            ..Self::default()
        }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(CadenceError::config(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(CadenceError::config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if let Some(penalty) = self.repetition_penalty {
            if !penalty.is_finite() || penalty <= 0.0 {
                return Err(CadenceError::config(format!(
                    "repetition_penalty must be positive, got {}",
                    penalty
                )));
            }
        }
        Ok(())
    }
}

/// Stateful sampler owning its random generator.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler, seeding from entropy when no seed is given.
    pub fn new(params: SamplingParams) -> Result<Self> {
        params.validate()?;
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { params, rng })
    }

    /// Active parameters.
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Sample from a `[vocab]` (or `[1, vocab]`) logits tensor.
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        self.sample_slice(&logits, history)
    }

    /// Sample from host logits.
    pub fn sample_slice(&mut self, logits: &[f32], history: &[u32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(CadenceError::EmptyInput("no logits to sample from".to_string()));
        }
        let mut logits = logits.to_vec();
        self.apply_repetition_penalty(&mut logits, history);

        if self.params.temperature == 0.0 {
            return Ok(argmax(&logits));
        }

        let probs = self.filtered_probabilities(&logits);
        let dist = WeightedIndex::new(&probs).map_err(|e| {
            CadenceError::InvalidInput(format!("cannot sample from distribution: {}", e))
        })?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    /// Final sampling distribution for `logits` after every filter.
    ///
    /// At temperature 0 this is one-hot on the arg-max.
    pub fn probabilities(&self, logits: &[f32], history: &[u32]) -> Vec<f32> {
        let mut logits = logits.to_vec();
        self.apply_repetition_penalty(&mut logits, history);
        if self.params.temperature == 0.0 {
            let mut probs = vec![0.0; logits.len()];
            if !probs.is_empty() {
                probs[argmax(&logits) as usize] = 1.0;
            }
            return probs;
        }
        self.filtered_probabilities(&logits)
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[u32]) {
        let Some(penalty) = self.params.repetition_penalty else {
            return;
        };
        if penalty == 1.0 || self.params.repetition_context_size == 0 {
            return;
        }
        let start = history.len().saturating_sub(self.params.repetition_context_size);
        let mut recent: Vec<usize> = history[start..].iter().map(|&t| t as usize).collect();
        recent.sort_unstable();
        recent.dedup();

        for idx in recent {
            if let Some(logit) = logits.get_mut(idx) {
                if *logit > 0.0 {
                    *logit /= penalty;
                } else {
                    *logit *= penalty;
                }
            }
        }
    }

    fn filtered_probabilities(&self, logits: &[f32]) -> Vec<f32> {
        let mut probs = softmax(logits, self.params.temperature);
        let top_k = self.params.top_k;
        let top_p = self.params.top_p;
        if top_k == 0 && !(top_p > 0.0 && top_p < 1.0) {
            return probs;
        }

        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut keep = order.len();
        if top_k > 0 {
            keep = keep.min(top_k);
        }
        if top_p > 0.0 && top_p < 1.0 {
            // Renormalized over the top-k survivors
            let kept_mass: f32 = order[..keep].iter().map(|&i| probs[i]).sum();
            let mut cumulative = 0.0;
            let mut nucleus = 0;
            for &i in &order[..keep] {
                if cumulative >= top_p {
                    break;
                }
                cumulative += probs[i] / kept_mass;
                nucleus += 1;
            }
            keep = nucleus.max(1);
        }

        for &i in &order[keep..] {
            probs[i] = 0.0;
        }
        let total: f32 = probs.iter().sum();
        if total > 0.0 {
            for p in probs.iter_mut() {
                *p /= total;
            }
        }
        probs
    }
}

/// Index of the largest logit, lowest index on ties.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Temperature softmax. Degenerates to one-hot on the arg-max when the
/// scaled logits overflow or carry no mass.
fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let scaled: Vec<f32> = logits.iter().map(|&x| x / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max.is_finite() {
        let exps: Vec<f32> = scaled.iter().map(|&x| (x - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        if sum.is_finite() && sum > 0.0 {
            return exps.into_iter().map(|e| e / sum).collect();
        }
    }
    let mut one_hot = vec![0.0; logits.len()];
    one_hot[argmax(logits) as usize] = 1.0;
    one_hot
}
