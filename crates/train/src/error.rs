//! Failure modes the training engine distinguishes.
//!
//! Everything else travels as `anyhow::Error`; these variants can be
//! recovered with `downcast_ref::<TrainError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    /// A loss component went NaN/inf. Fatal.
    #[error("non-finite {component} loss ({value}) at step {step}")]
    NonFiniteLoss {
        step: usize,
        component: &'static str,
        value: f32,
    },

    /// Model output and targets disagree on shape.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("checkpoint already exists: {0}")]
    CheckpointExists(PathBuf),

    #[error("validation set produced no batches")]
    EmptyValidationSet,

    #[error("test corpus is empty")]
    EmptyTestCorpus,
}
