//! High-level generation engine.

use anyhow::{anyhow, Context, Result};
use cadence_core::{
    model::{ModelConfig, Transformer, WeightMap},
    sampling::SamplingParams,
    session::{FinishReason, GenerateConfig, GenerationOutput},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque id of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelHandle(pub u32);

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Defaults applied to every generate request.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tokens generated when a request does not say otherwise.
    pub max_tokens: usize,
    /// Default softmax temperature.
    pub temperature: f32,
    /// Default nucleus mass.
    pub top_p: f32,
    /// Default repetition penalty.
    pub repetition_penalty: Option<f32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: None,
        }
    }
}

/// Builder for creating an Engine.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default maximum tokens.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    /// Set default temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    /// Set default top-p.
    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p;
        self
    }

    /// Set default repetition penalty.
    pub fn repetition_penalty(mut self, penalty: f32) -> Self {
        self.config.repetition_penalty = Some(penalty);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let defaults = SamplingParams {
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            repetition_penalty: self.config.repetition_penalty,
            ..SamplingParams::default()
        };
        defaults.validate().context("invalid engine defaults")?;

        Ok(Engine {
            config: self.config,
            models: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        })
    }
}

/// Registry of loaded models plus request defaults.
///
/// Shared freely across threads; each request runs its own session.
pub struct Engine {
    config: EngineConfig,
    models: RwLock<HashMap<ModelHandle, Arc<Transformer>>>,
    next_handle: AtomicU32,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an already-built model.
    pub fn register_model(&self, model: Arc<Transformer>) -> ModelHandle {
        let handle = ModelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info!(%handle, model_type = %model.config().model_type, "registered model");
        self.models.write().insert(handle, model);
        handle
    }

    /// Build a model from `weights` and register it.
    pub fn load_model(&self, config: ModelConfig, weights: &WeightMap) -> Result<ModelHandle> {
        let model = Transformer::from_weights(config, weights).context("failed to build model")?;
        Ok(self.register_model(Arc::new(model)))
    }

    /// Drop a model. Sessions already running keep their reference.
    pub fn unload_model(&self, handle: ModelHandle) -> bool {
        let removed = self.models.write().remove(&handle).is_some();
        if removed {
            info!(%handle, "unloaded model");
        }
        removed
    }

    /// Look up a registered model.
    pub fn model(&self, handle: ModelHandle) -> Option<Arc<Transformer>> {
        self.models.read().get(&handle).cloned()
    }

    /// Handles of every registered model, ascending.
    pub fn handles(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<_> = self.models.read().keys().copied().collect();
        handles.sort();
        handles
    }

    /// Start a generate request against `handle`.
    pub fn generate(&self, handle: ModelHandle, prompt_ids: &[u32]) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            handle,
            prompt: prompt_ids.to_vec(),
            max_tokens: self.config.max_tokens,
            sampling: SamplingParams {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                repetition_penalty: self.config.repetition_penalty,
                ..SamplingParams::default()
            },
            stop_tokens: Vec::new(),
            on_token: None,
        }
    }
}

type TokenCallback = Box<dyn FnMut(u32) -> bool + Send>;

/// A generation request.
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    handle: ModelHandle,
    prompt: Vec<u32>,
    max_tokens: usize,
    sampling: SamplingParams,
    stop_tokens: Vec<u32>,
    on_token: Option<TokenCallback>,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.sampling.temperature = t;
        self
    }

    /// Set top-p.
    pub fn top_p(mut self, p: f32) -> Self {
        self.sampling.top_p = p;
        self
    }

    /// Set top-k.
    pub fn top_k(mut self, k: usize) -> Self {
        self.sampling.top_k = k;
        self
    }

    /// Penalize tokens seen in the last `context` history tokens.
    pub fn repetition_penalty(mut self, penalty: f32, context: usize) -> Self {
        self.sampling.repetition_penalty = Some(penalty);
        self.sampling.repetition_context_size = context;
        self
    }

    /// Seed the sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling.seed = Some(seed);
        self
    }

    /// End generation at any of `ids`, in addition to the model's EOS ids.
    pub fn stop_tokens(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.stop_tokens.extend(ids);
        self
    }

    /// Stream tokens as they are produced. Returning `false` cancels.
    pub fn on_token(mut self, callback: impl FnMut(u32) -> bool + Send + 'static) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    fn prepare(self) -> Result<(Arc<Transformer>, Job)> {
        let model = self
            .engine
            .model(self.handle)
            .ok_or_else(|| anyhow!("unknown model handle {}", self.handle))?;
        let job = Job {
            handle: self.handle,
            prompt: self.prompt,
            config: GenerateConfig {
                max_tokens: self.max_tokens,
                sampling: self.sampling,
                stop_tokens: self.stop_tokens,
            },
            on_token: self.on_token,
        };
        Ok((model, job))
    }

    /// Run the request on the current thread.
    pub fn execute(self) -> Result<GenerateResult> {
        let (model, job) = self.prepare()?;
        job.run(&model)
    }

    /// Run the request on the blocking pool.
    pub async fn execute_async(self) -> Result<GenerateResult> {
        let (model, job) = self.prepare()?;
        tokio::task::spawn_blocking(move || job.run(&model))
            .await
            .context("generation task panicked")?
    }

    /// Run the request, folding any error into an unsuccessful result.
    pub fn execute_to_result(self) -> GenerateResult {
        self.execute().unwrap_or_else(|err| GenerateResult::failure(&err))
    }
}

/// Owned half of a request, movable to another thread.
struct Job {
    handle: ModelHandle,
    prompt: Vec<u32>,
    config: GenerateConfig,
    on_token: Option<TokenCallback>,
}

impl Job {
    fn run(self, model: &Arc<Transformer>) -> Result<GenerateResult> {
        let mut session = model.create_session()?;
        let mut on_token = self.on_token;
        debug!(handle = %self.handle, prompt = self.prompt.len(), "generate");
        let output = session.generate(&self.prompt, &self.config, |token| match on_token.as_mut() {
            Some(callback) => callback(token),
            None => true,
        })?;
        Ok(GenerateResult::from(output))
    }
}

/// Result of a generate request, serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResult {
    /// False when the request failed before producing output.
    pub success: bool,
    /// Generated token ids.
    pub tokens: Vec<u32>,
    /// Number of generated tokens.
    pub token_count: usize,
    /// Decode throughput.
    pub tokens_per_second: f64,
    /// Why generation stopped; absent on failure.
    pub finish_reason: Option<FinishReason>,
    /// Failure message.
    pub error: Option<String>,
}

impl GenerateResult {
    /// Unsuccessful result carrying `err`'s message chain.
    pub fn failure(err: &anyhow::Error) -> Self {
        Self {
            success: false,
            tokens: Vec::new(),
            token_count: 0,
            tokens_per_second: 0.0,
            finish_reason: None,
            error: Some(format!("{:#}", err)),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<GenerationOutput> for GenerateResult {
    fn from(output: GenerationOutput) -> Self {
        Self {
            success: true,
            token_count: output.token_count,
            tokens_per_second: output.tokens_per_second,
            finish_reason: Some(output.finish_reason),
            tokens: output.tokens,
            error: None,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("models", &self.models.read().len())
            .finish()
    }
}
