//! Errors raised while loading configuration and data.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Time axes of a sample or batch disagree. Never truncated silently.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("{0} has no frames")]
    EmptySample(&'static str),

    #[error("dataset is empty: {0}")]
    EmptyDataset(String),

    #[error("missing tensor `{key}` in {path}")]
    MissingTensor { key: &'static str, path: PathBuf },

    #[error("unknown phoneme `{0}`")]
    UnknownPhoneme(String),

    #[error("batch source closed")]
    SourceClosed,
}
