//! Error types for Cadence Core.

use thiserror::Error;

/// Result type alias for Cadence operations.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Errors that can occur while building or running a decoding session.
#[derive(Error, Debug)]
pub enum CadenceError {
    /// A cache buffer could not be grown.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A layer, cache, RoPE or sampling setting is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Prefill was requested with no prompt tokens.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A runtime argument is out of range (token id, expert id, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Missing or malformed model weights.
    #[error("model error: {0}")]
    ModelError(String),

    /// The session hit an error mid-step and must be reset before reuse.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl CadenceError {
    /// Shorthand for [`CadenceError::InvalidConfiguration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
