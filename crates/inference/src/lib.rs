//! # phoneseg-infer - Full-Utterance Inference
//!
//! * **[`ForcedAligner`]**: [`FullInference`](phoneseg_core::FullInference)
//!   by monotonic Viterbi over the segmentation head.
//! * **[`discover_test_corpus`]**: `transcriptions.csv` walking.
//! * **[`NoneDetector`]**: identity post-processing.
//! * **[`LoadedModel`]**: segmenter restored from a checkpoint.

pub mod aligner;
pub mod corpus;
pub mod detector;
pub mod runtime;

pub use aligner::{viterbi, ForcedAligner};
pub use corpus::discover_test_corpus;
pub use detector::{detector_by_name, NoneDetector};
pub use runtime::LoadedModel;
