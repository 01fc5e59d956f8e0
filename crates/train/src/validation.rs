//! Periodic validation: one ordered pass over the validation set in eval mode.

use candle_core::Device;

use phoneseg_common::{ordered_batches, Dataset, LabeledDataset, LabeledSample};
use phoneseg_core::{with_mode, Mode, SegmentationModel};

use crate::error::TrainError;
use crate::loss::{masked_accuracy, CompositeLoss};
use crate::metrics::tags;

/// Means over validation batches. Accuracy counts real frames only; the
/// losses also see padded frames, which are targeted as silence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationMetrics {
    pub accuracy: f32,
    pub seg_loss: f32,
    pub edge_loss: f32,
    pub batches: usize,
}

impl ValidationMetrics {
    pub fn scalars(&self) -> [(&'static str, f64); 3] {
        [
            (tags::VALID_ACCURACY, self.accuracy as f64),
            (tags::VALID_SEG, self.seg_loss as f64),
            (tags::VALID_EDGE, self.edge_loss as f64),
        ]
    }
}

pub struct ValidationRunner<D = LabeledDataset> {
    dataset: D,
    batch_size: usize,
    loss: CompositeLoss,
    device: Device,
}

impl<D: Dataset<Sample = LabeledSample>> ValidationRunner<D> {
    pub fn new(dataset: D, batch_size: usize, label_smoothing: f64, device: Device) -> Self {
        Self {
            dataset,
            batch_size,
            loss: CompositeLoss::new(label_smoothing),
            device,
        }
    }

    /// Evaluate without touching the optimiser. The model's mode is restored
    /// afterwards whether or not evaluation succeeds.
    pub fn run<M>(&self, model: &mut M) -> anyhow::Result<ValidationMetrics>
    where
        M: SegmentationModel + ?Sized,
    {
        with_mode(model, Mode::Eval, |model| self.evaluate(model))
    }

    fn evaluate<M>(&self, model: &M) -> anyhow::Result<ValidationMetrics>
    where
        M: SegmentationModel + ?Sized,
    {
        let (mut acc_sum, mut seg_sum, mut edge_sum) = (0.0f64, 0.0f64, 0.0f64);
        let mut batches = 0usize;

        for batch in ordered_batches(&self.dataset, self.batch_size) {
            let batch = batch?;
            let (melspec, target, edge_target) = batch.to_tensors(&self.device)?;
            let out = model.forward(&melspec)?;
            let loss = self.loss.supervised_output(&out, &target, &edge_target)?;
            let mask = batch.frame_mask(&self.device)?;
            acc_sum += masked_accuracy(&out.seg, &target, &mask)? as f64;
            seg_sum += loss.seg.to_scalar::<f32>()? as f64;
            edge_sum += loss.edge.to_scalar::<f32>()? as f64;
            batches += 1;
        }

        if batches == 0 {
            return Err(TrainError::EmptyValidationSet.into());
        }
        let n = batches as f64;
        Ok(ValidationMetrics {
            accuracy: (acc_sum / n) as f32,
            seg_loss: (seg_sum / n) as f32,
            edge_loss: (edge_sum / n) as f32,
            batches,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use phoneseg_core::ModelOutput;

    /// Predicts class 1 everywhere, no boundaries.
    struct Constant(Mode);

    impl SegmentationModel for Constant {
        fn forward(&self, features: &Tensor) -> candle_core::Result<ModelOutput> {
            let (b, t, _) = features.dims3()?;
            let seg = Tensor::from_slice(&[0f32, 10.0, 0.0], 3, features.device())?
                .reshape((1, 1, 3))?
                .broadcast_as((b, t, 3))?
                .contiguous()?;
            let edge = Tensor::full(-10f32, (b, t), features.device())?;
            Ok(ModelOutput {
                hidden: features.clone(),
                ctc: Tensor::zeros((b, t, 4), DType::F32, features.device())?,
                seg,
                edge,
            })
        }
        fn set_mode(&mut self, mode: Mode) {
            self.0 = mode;
        }
        fn mode(&self) -> Mode {
            self.0
        }
    }

    struct Empty;

    impl Dataset for Empty {
        type Sample = LabeledSample;
        fn len(&self) -> usize {
            0
        }
        fn get(&self, _idx: usize) -> &LabeledSample {
            unreachable!()
        }
    }

    fn sample(target: Vec<u32>) -> LabeledSample {
        let frames = target.len();
        LabeledSample::new(vec![0.0; frames * 2], 2, target, vec![0.0; frames]).unwrap()
    }

    #[test]
    fn averages_over_batches_and_restores_mode() {
        // Batch 1: all class 1 → accuracy 1. Batch 2: half class 1 → 0.5.
        let ds = LabeledDataset::from_samples(
            "valid",
            vec![sample(vec![1, 1]), sample(vec![1, 0])],
        )
        .unwrap();
        let runner = ValidationRunner::new(ds, 1, 0.0, Device::Cpu);
        let mut model = Constant(Mode::Train);
        let m = runner.run(&mut model).unwrap();
        assert_eq!(m.batches, 2);
        assert!((m.accuracy - 0.75).abs() < 1e-6);
        assert!(m.seg_loss > 0.0 && m.edge_loss > 0.0);
        assert_eq!(model.mode(), Mode::Train);
    }

    #[test]
    fn padded_frames_do_not_count_toward_accuracy() {
        let ds = LabeledDataset::from_samples(
            "valid",
            vec![sample(vec![1, 1]), sample(vec![1, 1, 1, 1])],
        )
        .unwrap();
        let runner = ValidationRunner::new(ds, 2, 0.0, Device::Cpu);
        let m = runner.run(&mut Constant(Mode::Train)).unwrap();
        assert_eq!(m.batches, 1);
        assert_eq!(m.accuracy, 1.0);
    }

    #[test]
    fn empty_validation_set_is_reported() {
        let runner = ValidationRunner::new(Empty, 4, 0.0, Device::Cpu);
        let mut model = Constant(Mode::Train);
        let err = runner.run(&mut model).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::EmptyValidationSet)
        ));
        assert_eq!(model.mode(), Mode::Train);
    }
}
