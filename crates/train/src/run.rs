//! Outer training loop: steps, metric emission, and the periodic
//! validation / test / checkpoint actions.
//!
//! Periodic actions run after the optimiser step of the step they are
//! keyed on. Their failures, and a failed final save, are logged and
//! counted in the [`RunSummary`]; only a failing training step ends the run.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use phoneseg_common::{BatchStream, SupervisedBatch, TrainConfig, UnsupervisedBatch};
use phoneseg_core::{FullInference, SegmentationModel};

use crate::checkpoint::CheckpointManager;
use crate::ema::EmaSwap;
use crate::metrics::{tags, MetricsSink};
use crate::testing::TestRunner;
use crate::trainer::{StepMetrics, Trainer};
use crate::validation::ValidationRunner;

// ── Cadence ─────────────────────────────────────────────────────────────────

/// Which periodic actions fire at a step. An interval of 0 disables its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub val_interval: usize,
    pub test_interval: usize,
    pub ckpt_interval: usize,
}

impl Cadence {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            val_interval: config.val_interval,
            test_interval: config.test_interval,
            ckpt_interval: config.save_ckpt_interval,
        }
    }

    pub fn should_validate(&self, step: usize) -> bool {
        every(self.val_interval, step)
    }

    pub fn should_test(&self, step: usize) -> bool {
        every(self.test_interval, step)
    }

    /// Never at step 0: there is nothing trained to keep yet.
    pub fn should_checkpoint(&self, step: usize) -> bool {
        step != 0 && every(self.ckpt_interval, step)
    }
}

fn every(interval: usize, step: usize) -> bool {
    interval != 0 && step % interval == 0
}

// ── Summary ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub steps: usize,
    pub last: Option<StepMetrics>,
    pub checkpoints: Vec<PathBuf>,
    pub final_checkpoint: Option<PathBuf>,
    pub validation_failures: usize,
    pub test_failures: usize,
    pub checkpoint_failures: usize,
    pub sink_failures: usize,
}

// ── Loop ────────────────────────────────────────────────────────────────────

pub struct TrainingLoop<M> {
    trainer: Trainer<M>,
    cadence: Cadence,
    max_steps: usize,
    validation: Option<ValidationRunner>,
    test: Option<(TestRunner, Box<dyn FullInference>)>,
    checkpoints: Option<CheckpointManager>,
    show_progress: bool,
}

impl<M: SegmentationModel> TrainingLoop<M> {
    pub fn new(trainer: Trainer<M>, config: &TrainConfig) -> Self {
        Self {
            trainer,
            cadence: Cadence::from_config(config),
            max_steps: config.max_steps,
            validation: None,
            test: None,
            checkpoints: None,
            show_progress: false,
        }
    }

    pub fn with_validation(mut self, runner: ValidationRunner) -> Self {
        self.validation = Some(runner);
        self
    }

    pub fn with_test(mut self, runner: TestRunner, inference: Box<dyn FullInference>) -> Self {
        self.test = Some((runner, inference));
        self
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn trainer(&self) -> &Trainer<M> {
        &self.trainer
    }

    pub fn into_trainer(self) -> Trainer<M> {
        self.trainer
    }

    /// Train for steps `[0, max_steps)`, then write the final weights.
    pub fn run(
        &mut self,
        sup: &mut dyn BatchStream<SupervisedBatch>,
        usp: &mut dyn BatchStream<UnsupervisedBatch>,
        sink: &mut dyn MetricsSink,
    ) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();
        let pb = self.progress_bar()?;
        tracing::info!(max_steps = self.max_steps, cadence = ?self.cadence, "Training started");

        for _ in 0..self.max_steps {
            let m = self.trainer.step(sup, usp)?;
            let step = m.step;

            for (tag, value) in m.scalars() {
                emit(sink, &mut summary, step, |s| s.scalar(tag, value, step));
            }
            if let Some(gn) = m.grad_norm {
                tracing::debug!(step, grad_norm = gn, "Gradient norm");
            }

            if self.cadence.should_validate(step) {
                self.validate(step, sink, &mut summary);
            }
            if self.cadence.should_test(step) {
                self.test(step, sink, &mut summary);
            }
            if self.cadence.should_checkpoint(step) {
                self.checkpoint(step, &mut summary);
            }

            pb.set_message(format!("loss {:.4}", m.total_loss));
            pb.inc(1);
            summary.steps += 1;
            summary.last = Some(m);
        }
        pb.finish_with_message("done");

        self.save_final(&mut summary);
        if let Err(e) = sink.flush() {
            tracing::warn!(error = %e, "Metrics sink flush failed");
            summary.sink_failures += 1;
        }
        Ok(summary)
    }

    fn validate(&mut self, step: usize, sink: &mut dyn MetricsSink, summary: &mut RunSummary) {
        let Some(runner) = &self.validation else {
            return;
        };
        let (model, ema) = self.trainer.model_and_ema();
        let result = ema
            .map(|e| e.swap_in())
            .transpose()
            .map_err(anyhow::Error::from)
            .and_then(|_swap| runner.run(model));

        match result {
            Ok(metrics) => {
                tracing::info!(
                    step,
                    accuracy = metrics.accuracy,
                    seg_loss = metrics.seg_loss,
                    edge_loss = metrics.edge_loss,
                    "Validation"
                );
                for (tag, value) in metrics.scalars() {
                    emit(sink, summary, step, |s| s.scalar(tag, value, step));
                }
            }
            Err(e) => {
                tracing::error!(step, error = %e, "Validation failed");
                summary.validation_failures += 1;
            }
        }
    }

    fn test(&mut self, step: usize, sink: &mut dyn MetricsSink, summary: &mut RunSummary) {
        let Some((runner, inference)) = &self.test else {
            return;
        };
        let (model, ema) = self.trainer.model_and_ema();
        let result = ema
            .map(|e| e.swap_in())
            .transpose()
            .map_err(anyhow::Error::from)
            .and_then(|_swap| runner.run(model, inference.as_ref(), true));

        match result {
            Ok(report) => {
                tracing::info!(step, confidence = report.mean_confidence, "Test");
                let confidence = report.mean_confidence as f64;
                emit(sink, summary, step, |s| {
                    s.scalar(tags::TEST_CONFIDENCE, confidence, step)
                });
                for (tag, figure) in &report.figures {
                    emit(sink, summary, step, |s| s.figure(tag, figure, step));
                }
            }
            Err(e) => {
                tracing::error!(step, error = %e, "Test pass failed");
                summary.test_failures += 1;
            }
        }
    }

    fn checkpoint(&self, step: usize, summary: &mut RunSummary) {
        let Some(manager) = &self.checkpoints else {
            return;
        };
        let result = swap_in_ema(&self.trainer)
            .and_then(|_swap| manager.save(step, &self.trainer.varmap));
        match result {
            Ok(path) => summary.checkpoints.push(path),
            Err(e) => {
                tracing::error!(step, error = %e, "Checkpoint failed");
                summary.checkpoint_failures += 1;
            }
        }
    }

    fn save_final(&self, summary: &mut RunSummary) {
        let Some(manager) = &self.checkpoints else {
            return;
        };
        let result = swap_in_ema(&self.trainer)
            .and_then(|_swap| manager.save_final(&self.trainer.varmap));
        match result {
            Ok(path) => summary.final_checkpoint = Some(path),
            Err(e) => {
                tracing::error!(steps = summary.steps, error = %e, "Final checkpoint failed");
                summary.checkpoint_failures += 1;
            }
        }
    }

    fn progress_bar(&self) -> anyhow::Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(self.max_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")?
                .progress_chars("=>-"),
        );
        Ok(pb)
    }
}

fn swap_in_ema<M: SegmentationModel>(trainer: &Trainer<M>) -> anyhow::Result<Option<EmaSwap<'_>>> {
    Ok(trainer.ema().map(|e| e.swap_in()).transpose()?)
}

/// Forward to the sink; a failure is logged and counted, never fatal.
fn emit(
    sink: &mut dyn MetricsSink,
    summary: &mut RunSummary,
    step: usize,
    f: impl FnOnce(&mut dyn MetricsSink) -> anyhow::Result<()>,
) {
    if let Err(e) = f(sink) {
        tracing::warn!(step, error = %e, "Metrics sink failed");
        summary.sink_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_test_fire_on_multiples_including_zero() {
        let c = Cadence {
            val_interval: 5,
            test_interval: 7,
            ckpt_interval: 100,
        };
        let val: Vec<usize> = (0..12).filter(|&s| c.should_validate(s)).collect();
        assert_eq!(val, vec![0, 5, 10]);
        let test: Vec<usize> = (0..15).filter(|&s| c.should_test(s)).collect();
        assert_eq!(test, vec![0, 7, 14]);
    }

    #[test]
    fn checkpoint_skips_step_zero() {
        let c = Cadence {
            val_interval: 1,
            test_interval: 1,
            ckpt_interval: 100,
        };
        let ckpt: Vec<usize> = (0..250).filter(|&s| c.should_checkpoint(s)).collect();
        assert_eq!(ckpt, vec![100, 200]);
    }

    #[test]
    fn zero_interval_disables_action() {
        let c = Cadence {
            val_interval: 0,
            test_interval: 0,
            ckpt_interval: 0,
        };
        assert!((0..50).all(|s| {
            !c.should_validate(s) && !c.should_test(s) && !c.should_checkpoint(s)
        }));
    }
}
