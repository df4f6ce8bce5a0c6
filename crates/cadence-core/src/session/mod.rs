//! Generation sessions: one token stream over a shared model.
//!
//! A session owns one cache per cache-owning layer and drives the
//! `Prefill -> Decode -> Done` lifecycle. The model behind it is an
//! `Arc<Transformer>` and may back any number of sessions on other threads.

mod golden;

pub use golden::{GoldenCase, GoldenResult, GoldenSummary, GoldenTestHarness, GoldenTestable};

use crate::cache::{KvCache, LayerCache};
use crate::error::{CadenceError, Result};
use crate::model::Transformer;
use crate::sampling::{Sampler, SamplingParams};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Input to a single [`GenerationSession::step`].
#[derive(Debug, Clone, Copy)]
pub enum StepInput<'a> {
    /// A block of prompt tokens processed in one forward pass.
    Prefill(&'a [u32]),
    /// One decode token.
    Token(u32),
}

impl StepInput<'_> {
    fn tokens(&self) -> &[u32] {
        match self {
            StepInput::Prefill(ids) => ids,
            StepInput::Token(id) => std::slice::from_ref(id),
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// An end-of-sequence or stop token was sampled.
    Stop,
    /// `max_tokens` tokens were emitted.
    Length,
    /// The token callback asked to stop.
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No tokens processed yet.
    Prefill,
    /// At least one forward pass done; more tokens may follow.
    Decode,
    /// The last `generate` call finished.
    Done(FinishReason),
    /// A step failed; the caches may be partially updated.
    Failed,
}

/// Settings for [`GenerationSession::generate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Upper bound on emitted tokens.
    pub max_tokens: usize,
    /// Sampler settings.
    pub sampling: SamplingParams,
    /// Extra ids that end generation, in addition to the model's EOS ids.
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            sampling: SamplingParams::default(),
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerateConfig {
    /// Greedy decoding of at most `max_tokens` tokens.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            sampling: SamplingParams::greedy(),
            stop_tokens: Vec::new(),
        }
    }
}

/// Result of [`GenerationSession::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Emitted tokens, excluding the prompt and any stop token.
    pub tokens: Vec<u32>,
    /// `tokens.len()`.
    pub token_count: usize,
    /// Decode throughput.
    pub tokens_per_second: f64,
    /// Prefill throughput.
    pub prompt_tokens_per_second: f64,
    /// Why the loop ended.
    pub finish_reason: FinishReason,
}

/// Running counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Tokens processed by prefill steps.
    pub prompt_tokens: usize,
    /// Tokens processed by decode steps.
    pub generated_tokens: usize,
    /// Time spent in prefill steps.
    pub prefill_time: Duration,
    /// Time spent in decode steps.
    pub decode_time: Duration,
}

fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// One decoding stream with its own caches.
pub struct GenerationSession {
    model: Arc<Transformer>,
    caches: Vec<LayerCache>,
    history: Vec<u32>,
    stats: SessionStats,
    phase: SessionPhase,
}

impl GenerationSession {
    /// Create a session with empty caches for `model`.
    pub fn new(model: Arc<Transformer>) -> Result<Self> {
        let caches = model.new_caches()?;
        info!(
            model_type = %model.config().model_type,
            caches = caches.len(),
            layers = model.layer_configs().len(),
            "created generation session"
        );
        Ok(Self {
            model,
            caches,
            history: Vec::new(),
            stats: SessionStats::default(),
            phase: SessionPhase::Prefill,
        })
    }

    /// The model behind this session.
    pub fn model(&self) -> &Arc<Transformer> {
        &self.model
    }

    /// Per-layer caches, one for each cache-owning layer.
    pub fn caches(&self) -> &[LayerCache] {
        &self.caches
    }

    /// Absolute position of the next token.
    pub fn offset(&self) -> usize {
        self.caches.first().map(KvCache::offset).unwrap_or(0)
    }

    /// Every token fed so far, prompt included.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Counters since creation or the last reset.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Drop all cached state and counters.
    pub fn reset(&mut self) {
        self.caches.iter_mut().for_each(KvCache::reset);
        self.history.clear();
        self.stats = SessionStats::default();
        self.phase = SessionPhase::Prefill;
    }

    /// Feed tokens and return the logits `[vocab]` for the last one.
    ///
    /// Empty input and out-of-vocabulary ids are rejected up front and leave
    /// the session as it was. A failed forward pass leaves the session in
    /// [`SessionPhase::Failed`] and every later step returns
    /// [`CadenceError::SessionFailed`] until [`reset`](Self::reset).
    pub fn step(&mut self, input: StepInput<'_>) -> Result<Tensor> {
        if self.phase == SessionPhase::Failed {
            return Err(CadenceError::SessionFailed(
                "session must be reset after a failed step".to_string(),
            ));
        }
        let ids = input.tokens();
        if ids.is_empty() {
            return Err(CadenceError::EmptyInput("prefill with no tokens".to_string()));
        }
        let vocab = self.model.vocab_size();
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= vocab) {
            return Err(CadenceError::InvalidInput(format!(
                "token id {} out of range for vocab {}",
                bad, vocab
            )));
        }

        let start = Instant::now();
        let logits = match self.model.forward(ids, &mut self.caches) {
            Ok(logits) => logits,
            Err(err) => {
                warn!(error = %err, offset = self.offset(), "step failed");
                self.phase = SessionPhase::Failed;
                return Err(err);
            }
        };
        let elapsed = start.elapsed();

        match input {
            StepInput::Prefill(_) => {
                self.stats.prompt_tokens += ids.len();
                self.stats.prefill_time += elapsed;
            }
            StepInput::Token(_) => {
                self.stats.generated_tokens += 1;
                self.stats.decode_time += elapsed;
            }
        }
        self.history.extend_from_slice(ids);
        self.phase = SessionPhase::Decode;
        debug!(tokens = ids.len(), offset = self.offset(), "step");

        let last = logits.dim(0)? - 1;
        Ok(logits.get(last)?)
    }

    /// Prefill `prompt`, then sample and feed tokens until a stop token,
    /// `max_tokens`, or `on_token` returning `false`.
    ///
    /// Each emitted token is fed through the model before `on_token` sees it,
    /// so afterwards [`offset`](Self::offset) has grown by the prompt length
    /// plus the number of emitted tokens. Stop tokens are neither emitted nor
    /// fed.
    pub fn generate<F>(
        &mut self,
        prompt: &[u32],
        config: &GenerateConfig,
        mut on_token: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(u32) -> bool,
    {
        if prompt.is_empty() {
            return Err(CadenceError::EmptyInput("prompt has no tokens".to_string()));
        }
        let mut sampler = Sampler::new(config.sampling.clone())?;
        let eos = self.model.eos_token_ids().to_vec();
        let is_stop = |token: u32| eos.contains(&token) || config.stop_tokens.contains(&token);

        let prefill_start = Instant::now();
        let mut logits = self.step(StepInput::Prefill(prompt))?;
        let prefill_time = prefill_start.elapsed();

        let decode_start = Instant::now();
        let mut tokens = Vec::with_capacity(config.max_tokens);
        let mut finish_reason = FinishReason::Length;
        while tokens.len() < config.max_tokens {
            let token = sampler.sample(&logits, &self.history)?;
            if is_stop(token) {
                finish_reason = FinishReason::Stop;
                break;
            }
            tokens.push(token);
            logits = self.step(StepInput::Token(token))?;
            if !on_token(token) {
                finish_reason = FinishReason::Cancelled;
                break;
            }
        }
        let decode_time = decode_start.elapsed();

        let output = GenerationOutput {
            token_count: tokens.len(),
            tokens_per_second: per_second(tokens.len(), decode_time),
            prompt_tokens_per_second: per_second(prompt.len(), prefill_time),
            tokens,
            finish_reason,
        };
        self.phase = SessionPhase::Done(finish_reason);
        info!(
            prompt_tokens = prompt.len(),
            tokens = output.token_count,
            tokens_per_second = output.tokens_per_second,
            finish_reason = %finish_reason,
            offset = self.offset(),
            "generation finished"
        );
        Ok(output)
    }
}

impl std::fmt::Debug for GenerationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationSession")
            .field("offset", &self.offset())
            .field("history", &self.history.len())
            .field("phase", &self.phase)
            .finish()
    }
}
