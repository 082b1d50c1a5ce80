//! Crate-wide error type.
//!
//! | Category | Variants | Caller action |
//! |----------|----------|---------------|
//! | Lifecycle | `Initialization`, `NotReady`, `Busy` | Rebuild the model / retry later |
//! | Input | `DimensionMismatch`, `EmptyInput`, `InvalidInput`, `ActionOutOfRange`, `InvalidConfig` | Fix the input |
//! | Persistence | `Store`, `Serialization`, `Io` | Inspect the backing store |
//!
//! Invalid clusters are not errors: the quality service drops them and an
//! all-invalid batch is an empty `Ok`.

use thiserror::Error;

/// Errors surfaced by the ranking engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The quality model could not be loaded or constructed.
    ///
    /// Fatal for that `QualityModel` instance; there is no automatic retry.
    #[error("model initialization failed: {reason}")]
    Initialization { reason: String },

    /// A training run is already in progress.
    #[error("training already in progress")]
    Busy,

    /// The model is not in a state that accepts the request.
    #[error("model not ready (state: {state})")]
    NotReady { state: String },

    /// Vectors or batches of incompatible length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An operation that needs at least one element got none.
    #[error("empty input: {what}")]
    EmptyInput { what: &'static str },

    /// Bandit action index outside `0..num_actions`.
    #[error("action {action} out of range (num_actions = {num_actions})")]
    ActionOutOfRange { action: usize, num_actions: usize },

    /// Rejected input value (e.g. a label outside `[0, 1]`).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Rejected configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A store collaborator failed.
    #[error("store operation on {key:?} failed: {source}")]
    Store {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A persisted blob could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in [`FileStore`](crate::FileStore).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn store(
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Store {
            key: key.into(),
            source: source.into(),
        }
    }

    pub(crate) fn dims(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
