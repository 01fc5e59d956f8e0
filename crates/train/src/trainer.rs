//! Trainer: one optimisation step of the semi-supervised regime.
//!
//! Decouples the compute graph (forward + composite loss) from the
//! optimisation step (backward, gradient clipping, AdamW, EMA update,
//! schedule advance). Periodic actions live in [`crate::run`].

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::Serialize;

use phoneseg_common::{BatchStream, SupervisedBatch, TrainConfig, UnsupervisedBatch};
use phoneseg_core::{Mode, SegmentationModel};

use crate::ema::Ema;
use crate::error::TrainError;
use crate::loss::{masked_accuracy, CompositeLoss};
use crate::metrics::tags;
use crate::scheduler::{LrScheduler, RampScheduler};

/// Metrics returned after each training step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub seg_loss: f32,
    pub edge_loss: f32,
    /// `None` when the ramp weight was 0 and the unlabeled stream was skipped.
    pub consistency_loss: Option<f32>,
    pub total_loss: f32,
    pub accuracy: f32,
    pub lr: f64,
    pub ramp_weight: f64,
    pub grad_norm: Option<f64>,
}

impl StepMetrics {
    /// `(tag, value)` pairs in emission order.
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![
            (tags::TRAIN_ACCURACY, self.accuracy as f64),
            (tags::TRAIN_SEG, self.seg_loss as f64),
            (tags::TRAIN_EDGE, self.edge_loss as f64),
        ];
        if let Some(c) = self.consistency_loss {
            out.push((tags::TRAIN_CONSISTENCY, c as f64));
        }
        out.push((tags::TRAIN_TOTAL, self.total_loss as f64));
        out.push((tags::LR, self.lr));
        out.push((tags::RAMP, self.ramp_weight));
        out
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and all schedules.
pub struct Trainer<M> {
    pub model: M,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    ramp: RampScheduler,
    loss: CompositeLoss,
    ema: Option<Ema>,
    grad_clip_max_norm: f64,
    pub global_step: usize,
    device: Device,
}

impl<M: SegmentationModel> Trainer<M> {
    /// `model` must have been built from `varmap`.
    pub fn new(model: M, varmap: VarMap, config: &TrainConfig, device: Device) -> anyhow::Result<Self> {
        let vars = varmap.all_vars();
        let n_params: usize = vars.iter().map(|v| v.as_tensor().elem_count()).sum();
        tracing::info!(tensors = vars.len(), params = n_params, "Model parameters");

        let lr_scheduler = LrScheduler::new(
            config.learning_rate,
            config.lr_min,
            config.lr_warmup_steps,
            config.max_steps,
            config.lr_decay,
        );
        let ramp = RampScheduler::new(
            config.max_steps,
            config.ramp_start(),
            config.ramp_end(),
            config.ramp_shape,
        );
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: lr_scheduler.current_lr(),
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let ema = match config.ema_decay {
            Some(decay) => {
                tracing::info!(decay, "EMA weights enabled");
                Some(Ema::new(vars.clone(), decay)?)
            }
            None => None,
        };

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            ramp,
            loss: CompositeLoss::new(config.label_smoothing),
            ema,
            grad_clip_max_norm: config.grad_clip_max_norm,
            global_step: 0,
            device,
        })
    }

    /// One optimiser step: supervised batch, optional consistency batch,
    /// backward, clip, AdamW, then advance the schedules.
    pub fn step(
        &mut self,
        sup: &mut dyn BatchStream<SupervisedBatch>,
        usp: &mut dyn BatchStream<UnsupervisedBatch>,
    ) -> anyhow::Result<StepMetrics> {
        let step = self.global_step;
        self.model.set_mode(Mode::Train);

        // Supervised
        let batch = sup.next_batch()?;
        let (melspec, target, edge_target) = batch.to_tensors(&self.device)?;
        let out = self.model.forward(&melspec)?;
        let sup_loss = self.loss.supervised_output(&out, &target, &edge_target)?;
        let acc = masked_accuracy(&out.seg, &target, &batch.frame_mask(&self.device)?)?;

        let seg_loss = finite_scalar(&sup_loss.seg, step, "seg")?;
        let edge_loss = finite_scalar(&sup_loss.edge, step, "edge")?;
        let mut total = sup_loss.total()?;

        // Unsupervised, only when it contributes
        let ramp_weight = self.ramp.value();
        let mut consistency_loss = None;
        if ramp_weight > 0.0 {
            let [clean, weak, strong] = usp.next_batch()?.to_tensors(&self.device)?;
            let out_clean = self.model.forward(&clean)?;
            let out_weak = self.model.forward(&weak)?;
            let out_strong = self.model.forward(&strong)?;
            let consistency = self.loss.consistency(&out_clean, &out_weak, &out_strong)?;
            consistency_loss = Some(finite_scalar(&consistency, step, "consistency")?);
            total = (total + consistency.affine(ramp_weight, 0.0)?)?;
        }
        let total_loss = finite_scalar(&total, step, "total")?;

        // Backward
        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = total.backward()?;

        let grad_norm = if self.grad_clip_max_norm > 0.0 {
            Some(clip_grad_norm(&mut grads, &self.vars, self.grad_clip_max_norm)?)
        } else {
            None
        };

        self.optimizer.step(&grads)?;
        if let Some(ema) = &mut self.ema {
            ema.update()?;
        }

        // Advance schedules
        self.lr_scheduler.advance();
        self.ramp.step();
        self.global_step += 1;

        Ok(StepMetrics {
            step,
            seg_loss,
            edge_loss,
            consistency_loss,
            total_loss,
            accuracy: acc,
            lr,
            ramp_weight,
            grad_norm,
        })
    }

    /// Unlabeled-loss weight the next step will use.
    pub fn ramp_weight(&self) -> f64 {
        self.ramp.value()
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_scheduler.current_lr()
    }

    pub fn ema(&self) -> Option<&Ema> {
        self.ema.as_ref()
    }

    /// Split borrow for evaluating under EMA weights.
    pub fn model_and_ema(&mut self) -> (&mut M, Option<&Ema>) {
        (&mut self.model, self.ema.as_ref())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Read a scalar loss, failing the run if it is NaN or infinite.
fn finite_scalar(loss: &Tensor, step: usize, component: &'static str) -> anyhow::Result<f32> {
    let value = loss.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NonFiniteLoss {
            step,
            component,
            value,
        }
        .into())
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use phoneseg_common::{Collate, LabeledSample, ModelConfig, RampShape, UnlabeledSample};
    use phoneseg_core::FrameSegmenter;

    const N_MELS: usize = 4;
    const FRAMES: usize = 6;

    struct Repeat<B>(B, usize);

    impl<B: Clone> BatchStream<B> for Repeat<B> {
        fn next_batch(&mut self) -> anyhow::Result<B> {
            self.1 += 1;
            Ok(self.0.clone())
        }
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            n_mels: N_MELS,
            hidden_size: 8,
            num_classes: 3,
            kernel_size: 3,
            dropout: 0.0,
        }
    }

    fn sup_batch() -> SupervisedBatch {
        let melspec: Vec<f32> = (0..FRAMES * N_MELS).map(|i| (i % 7) as f32 * 0.1).collect();
        let sample = LabeledSample::new(
            melspec,
            N_MELS,
            vec![0, 0, 1, 1, 2, 2],
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 0.0],
        )
        .unwrap();
        LabeledSample::collate(&[&sample]).unwrap()
    }

    fn usp_batch() -> UnsupervisedBatch {
        let f = |k: f32| (0..FRAMES * N_MELS).map(|i| (i % 5) as f32 * k).collect::<Vec<_>>();
        let sample = UnlabeledSample::new(f(0.1), f(0.12), f(0.2), N_MELS).unwrap();
        UnlabeledSample::collate(&[&sample]).unwrap()
    }

    fn trainer(config: &TrainConfig) -> Trainer<FrameSegmenter> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = FrameSegmenter::new(vb, &model_config()).unwrap();
        Trainer::new(model, varmap, config, Device::Cpu).unwrap()
    }

    fn linear_ramp(max_steps: usize) -> TrainConfig {
        TrainConfig {
            max_steps,
            ramp_start: Some(0),
            ramp_end: Some(max_steps),
            ramp_shape: RampShape::Linear,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn skips_unlabeled_stream_while_ramp_is_zero() {
        let mut t = trainer(&linear_ramp(10));
        let mut sup = Repeat(sup_batch(), 0);
        let mut usp = Repeat(usp_batch(), 0);

        let m = t.step(&mut sup, &mut usp).unwrap();
        assert_eq!(m.step, 0);
        assert_eq!(m.ramp_weight, 0.0);
        assert_eq!(m.consistency_loss, None);
        assert_eq!(usp.1, 0);

        let m = t.step(&mut sup, &mut usp).unwrap();
        assert!((m.ramp_weight - 0.1).abs() < 1e-12);
        assert!(m.consistency_loss.is_some());
        assert_eq!(usp.1, 1);
        assert_eq!(sup.1, 2);
    }

    #[test]
    fn total_is_supervised_plus_weighted_consistency() {
        let mut t = trainer(&linear_ramp(2));
        let mut sup = Repeat(sup_batch(), 0);
        let mut usp = Repeat(usp_batch(), 0);
        t.step(&mut sup, &mut usp).unwrap();
        let m = t.step(&mut sup, &mut usp).unwrap();
        let expected = m.seg_loss + m.edge_loss + 0.5 * m.consistency_loss.unwrap();
        assert!((m.total_loss - expected).abs() < 1e-4);
    }

    #[test]
    fn loss_decreases_on_a_repeated_batch() {
        let config = TrainConfig {
            learning_rate: 1e-2,
            lr_decay: phoneseg_common::LrDecay::None,
            ..linear_ramp(30)
        };
        let mut t = trainer(&TrainConfig {
            ramp_start: Some(1000),
            ramp_end: Some(1000),
            ..config
        });
        let mut sup = Repeat(sup_batch(), 0);
        let mut usp = Repeat(usp_batch(), 0);
        let first = t.step(&mut sup, &mut usp).unwrap().total_loss;
        let mut last = first;
        for _ in 0..29 {
            last = t.step(&mut sup, &mut usp).unwrap().total_loss;
        }
        assert!(last < first, "{last} !< {first}");
        assert_eq!(t.global_step, 30);
    }

    #[test]
    fn clipping_reports_grad_norm() {
        let mut t = trainer(&TrainConfig {
            grad_clip_max_norm: 1e-3,
            ..linear_ramp(5)
        });
        let m = t
            .step(&mut Repeat(sup_batch(), 0), &mut Repeat(usp_batch(), 0))
            .unwrap();
        assert!(m.grad_norm.unwrap() > 0.0);
    }

    #[test]
    fn non_finite_loss_names_step_and_component() {
        let mut batch = sup_batch();
        batch.melspec[0] = f32::NAN;
        let mut t = trainer(&linear_ramp(5));
        let err = t
            .step(&mut Repeat(batch, 0), &mut Repeat(usp_batch(), 0))
            .unwrap_err();
        match err.downcast_ref::<TrainError>() {
            Some(TrainError::NonFiniteLoss { step, component, .. }) => {
                assert_eq!(*step, 0);
                assert_eq!(*component, "seg");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scalars_omit_consistency_when_skipped() {
        let m = StepMetrics {
            step: 0,
            seg_loss: 1.0,
            edge_loss: 2.0,
            consistency_loss: None,
            total_loss: 3.0,
            accuracy: 0.5,
            lr: 1e-3,
            ramp_weight: 0.0,
            grad_norm: None,
        };
        let emitted: Vec<&str> = m.scalars().into_iter().map(|(t, _)| t).collect();
        assert!(!emitted.contains(&tags::TRAIN_CONSISTENCY));
        assert!(emitted.contains(&tags::RAMP));
    }
}
