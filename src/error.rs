//! Error types for the qwen2 crate.

use thiserror::Error;

use crate::sampling::SamplingError;

/// Top-level error type for qwen2 operations.
#[derive(Error, Debug)]
pub enum Qwen2Error {
    /// Malformed or structurally insufficient model configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A checkpoint tensor is stored in a precision with no conversion path.
    #[error("Unsupported precision: no conversion from {from} to {to}")]
    UnsupportedPrecision { from: String, to: String },

    /// The compute engine rejected the descriptor or device placement.
    #[error("Engine init error: {0}")]
    EngineInit(String),

    #[error("Weight loading error: {0}")]
    WeightLoad(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Qwen2Error>;
