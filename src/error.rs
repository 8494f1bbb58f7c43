//! Error types shared across the crate
//!
//! Contract violations (wrong shapes, backward before forward, uninitialized
//! weights) and I/O failures are both reported through [`NetError`] so that
//! release builds check them instead of running into undefined state.

use thiserror::Error;

/// Errors raised by layers, the network orchestrator, solvers and config loading.
#[derive(Debug, Error)]
pub enum NetError {
    /// Two buffers that must agree on shape do not.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Kernel, stride or padding do not tile the input exactly.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Weights were neither initialized nor loaded.
    #[error("Weights are not initialized: {0}")]
    NotInitialized(String),

    /// A backward pass was requested before any forward pass.
    #[error("No forward pass has been run: {0}")]
    NoForwardPass(String),

    /// The network has no layers.
    #[error("Network has no layers")]
    EmptyNetwork,

    /// No input sample has been loaded into the network.
    #[error("No input sample loaded")]
    MissingInput,

    /// The current sample carries no label vector.
    #[error("Current sample has no labels")]
    MissingLabels,

    /// The sample source could not provide a sample.
    #[error("Sample source error: {0}")]
    Source(String),

    /// Invalid solver or architecture configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A weight stream could not be parsed.
    #[error("Corrupt weight stream: {0}")]
    CorruptWeights(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;
