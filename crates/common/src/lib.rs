//! # phoneseg-common - Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`Config`]**: run configuration (serialised as JSON).
//! * **[`Vocab`]**: phoneme ↔ class-id map.
//! * **[`BatchSource`]** / **[`Prefetcher`]**: cyclic batching and prefetch.
//! * **[`Figure`]**: diagnostic matrices for the logging sink.

pub mod config;
pub mod data;
pub mod error;
pub mod figure;
pub mod vocab;

pub use config::{Config, DataConfig, LrDecay, ModelConfig, RampShape, TrainConfig};
pub use data::{
    ordered_batches, BatchSource, BatchStream, Collate, Dataset, InMemoryDataset, LabeledDataset,
    LabeledSample, Prefetcher, SampleFile, SupervisedBatch, UnlabeledDataset, UnlabeledSample,
    UnsupervisedBatch,
};
pub use error::DataError;
pub use figure::Figure;
pub use vocab::Vocab;
