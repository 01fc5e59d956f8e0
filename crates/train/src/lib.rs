//! # phoneseg-train - Semi-Supervised Training Engine
//!
//! * **[`Trainer`]**: owns model + optimiser + schedules. One call to
//!   [`Trainer::step`] runs the supervised forward, the consistency forward
//!   when the ramp weight is positive, backward, clipping, AdamW, EMA update
//!   and schedule advancement.
//! * **[`TrainingLoop`]**: drives steps and the validation / test /
//!   checkpoint cadence, reporting to a [`MetricsSink`].
//! * **[`RampScheduler`]** / **[`LrScheduler`]**: unsupervised weight and
//!   learning rate as functions of the step.
//! * **[`CompositeLoss`]**: segmentation + boundary + consistency terms.

pub mod checkpoint;
pub mod ema;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod run;
pub mod scheduler;
pub mod testing;
pub mod trainer;
pub mod validation;

pub use checkpoint::CheckpointManager;
pub use ema::{Ema, EmaSwap};
pub use error::TrainError;
pub use loss::{accuracy, masked_accuracy, CompositeLoss, SupervisedLoss};
pub use metrics::{tags, CsvSink, FanoutSink, MemorySink, MetricsSink, TracingSink};
pub use run::{Cadence, RunSummary, TrainingLoop};
pub use scheduler::{LrScheduler, RampScheduler};
pub use testing::{TestReport, TestRunner, TestSample};
pub use trainer::{StepMetrics, Trainer};
pub use validation::{ValidationMetrics, ValidationRunner};
