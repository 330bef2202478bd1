//! Error types for RustZImage.

use thiserror::Error;

/// Main error type for image generation.
#[derive(Error, Debug)]
pub enum ZImageError {
    /// Configuration errors (rejected before any forward pass).
    #[error("Config error: {0}")]
    Config(String),

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Required weights are missing from a checkpoint.
    #[error("Missing weights: {0}")]
    WeightsMissing(String),

    /// Device errors (Metal/CUDA initialization, synchronization).
    #[error("Device error: {0}")]
    Device(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for image generation.
pub type ZImageResult<T> = Result<T, ZImageError>;
