//! # phoneseg-core - Model Contracts
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | `SegmentationModel`, `ModelOutput`, `Mode` |
//! | [`segmenter`] | `FrameSegmenter`, the reference candle network |
//! | [`align`] | `FullInference`, `Alignment` (full-utterance decode contract) |
//! | [`detect`] | `Detector`, `Prediction` (post-processing of alignments) |
//! | [`device`] | `select_device` |

pub mod align;
pub mod detect;
pub mod device;
pub mod model;
pub mod segmenter;

pub use align::{Alignment, FullInference};
pub use detect::{Detector, Prediction};
pub use device::select_device;
pub use model::{with_mode, Mode, ModelOutput, SegmentationModel};
pub use segmenter::FrameSegmenter;
