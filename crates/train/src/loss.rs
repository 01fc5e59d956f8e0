//! Composite loss: supervised segmentation + boundary terms, and the
//! unsupervised consistency term across augmented views.
//!
//! Conventions: `seg` logits are `[B, T, C]`, `edge` logits `[B, T]`,
//! targets `[B, T]` (`u32` classes, `f32` boundary indicators). Boundary
//! probabilities are `sigmoid(edge)`.

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::{loss, ops};

use phoneseg_core::ModelOutput;

use crate::error::TrainError;

/// Scalar supervised loss tensors (still attached to the graph).
#[derive(Debug, Clone)]
pub struct SupervisedLoss {
    pub seg: Tensor,
    pub edge: Tensor,
}

impl SupervisedLoss {
    /// `seg + edge`, unweighted.
    pub fn total(&self) -> CandleResult<Tensor> {
        &self.seg + &self.edge
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompositeLoss {
    label_smoothing: f64,
}

impl CompositeLoss {
    pub fn new(label_smoothing: f64) -> Self {
        Self { label_smoothing }
    }

    /// Label-smoothed cross entropy plus BCE + EMD on boundaries.
    pub fn supervised(
        &self,
        seg_logits: &Tensor,
        edge_logits: &Tensor,
        target: &Tensor,
        edge_target: &Tensor,
    ) -> anyhow::Result<SupervisedLoss> {
        let (b, t, c) = seg_logits.dims3()?;
        expect_shape("target", &[b, t], target)?;
        expect_shape("edge logits", &[b, t], edge_logits)?;
        expect_shape("edge target", &[b, t], edge_target)?;

        let seg = label_smoothed_cross_entropy(
            &seg_logits.reshape((b * t, c))?,
            &target.reshape(b * t)?.to_dtype(DType::U32)?,
            self.label_smoothing,
        )?;

        let edge_target = edge_target.to_dtype(edge_logits.dtype())?;
        let edge_prob = ops::sigmoid(edge_logits)?;
        let edge = (bce_with_logits(edge_logits, &edge_target)?
            + binary_emd(&edge_prob, &edge_target)?)?;

        Ok(SupervisedLoss { seg, edge })
    }

    /// Same as [`supervised`](Self::supervised) on a model output.
    pub fn supervised_output(
        &self,
        output: &ModelOutput,
        target: &Tensor,
        edge_target: &Tensor,
    ) -> anyhow::Result<SupervisedLoss> {
        self.supervised(&output.seg, &output.edge, target, edge_target)
    }

    /// Sum of the six pairwise MSE terms: three view pairs × {seg logits, edge probabilities}.
    pub fn consistency(
        &self,
        clean: &ModelOutput,
        weak: &ModelOutput,
        strong: &ModelOutput,
    ) -> anyhow::Result<Tensor> {
        for (what, view) in [("weak view", weak), ("strong view", strong)] {
            expect_shape(what, clean.seg.dims(), &view.seg)?;
            expect_shape(what, clean.edge.dims(), &view.edge)?;
        }
        let e = ops::sigmoid(&clean.edge)?;
        let e_weak = ops::sigmoid(&weak.edge)?;
        let e_strong = ops::sigmoid(&strong.edge)?;
        let terms = [
            mse(&weak.seg, &clean.seg)?,
            mse(&strong.seg, &clean.seg)?,
            mse(&strong.seg, &weak.seg)?,
            mse(&e_weak, &e)?,
            mse(&e_strong, &e)?,
            mse(&e_strong, &e_weak)?,
        ];
        let mut total = terms[0].clone();
        for term in &terms[1..] {
            total = (total + term)?;
        }
        Ok(total)
    }
}

/// Fraction of frames whose arg-max class equals the target.
pub fn accuracy(seg_logits: &Tensor, target: &Tensor) -> CandleResult<f32> {
    seg_logits
        .argmax(D::Minus1)?
        .eq(&target.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}

/// [`accuracy`] over the frames where `mask` (`[B, T]`, 1 = real frame) is set.
pub fn masked_accuracy(seg_logits: &Tensor, target: &Tensor, mask: &Tensor) -> CandleResult<f32> {
    let mask = mask.to_dtype(DType::F32)?;
    let frames = mask.sum_all()?.to_scalar::<f32>()?;
    if frames == 0.0 {
        return Ok(0.0);
    }
    let hits = seg_logits
        .argmax(D::Minus1)?
        .eq(&target.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .mul(&mask)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits / frames)
}

fn expect_shape(what: &'static str, expected: &[usize], t: &Tensor) -> Result<(), TrainError> {
    if t.dims() == expected {
        Ok(())
    } else {
        Err(TrainError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: t.dims().to_vec(),
        })
    }
}

// ── Loss terms ──────────────────────────────────────────────────────────────

/// Cross entropy with label smoothing over `[N, C]` logits and `[N]` labels.
fn label_smoothed_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
) -> CandleResult<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let nll = loss::nll(&log_probs, labels)?;
    if smoothing <= 0.0 {
        return Ok(nll);
    }
    let classes = logits.dim(1)? as f64;
    let uniform = log_probs.sum(1)?.neg()?.mean_all()?;
    nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing / classes, 0.0)?
}

/// Numerically stable BCE on logits: `max(x, 0) - x·y + log(1 + e^-|x|)`.
fn bce_with_logits(logits: &Tensor, target: &Tensor) -> CandleResult<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((logits.relu()? - (logits * target)?)? + softplus)?.mean_all()
}

/// Earth mover's distance between per-frame boundary distributions.
///
/// Mean absolute difference of prefix sums plus that of suffix sums, halved,
/// so mass displaced across frames costs in proportion to the distance moved.
fn binary_emd(pred: &Tensor, target: &Tensor) -> CandleResult<Tensor> {
    let diff = (pred - target)?;
    let prefix = diff.cumsum(1)?;
    let suffix = (diff.sum_keepdim(1)?.broadcast_sub(&prefix)? + &diff)?;
    (prefix.abs()?.mean_all()? + suffix.abs()?.mean_all()?)?.affine(0.5, 0.0)
}

fn mse(a: &Tensor, b: &Tensor) -> CandleResult<Tensor> {
    (a - b)?.sqr()?.mean_all()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn output(seg: Tensor, edge: Tensor) -> ModelOutput {
        ModelOutput {
            hidden: seg.clone(),
            ctc: seg.clone(),
            seg,
            edge,
        }
    }

    /// Deterministic non-trivial batch: B=3, T=4, C=3.
    fn batch() -> (Tensor, Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let seg: Vec<f32> = (0..36).map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.3).collect();
        let edge: Vec<f32> = (0..12).map(|i| ((i * 5 % 7) as f32 - 3.0) * 0.5).collect();
        let target: Vec<u32> = (0..12).map(|i| (i * 2 % 3) as u32).collect();
        let edge_t: Vec<f32> = (0..12).map(|i| if i % 4 == 1 { 1.0 } else { 0.0 }).collect();
        (
            Tensor::from_vec(seg, (3, 4, 3), &dev).unwrap(),
            Tensor::from_vec(edge, (3, 4), &dev).unwrap(),
            Tensor::from_vec(target, (3, 4), &dev).unwrap(),
            Tensor::from_vec(edge_t, (3, 4), &dev).unwrap(),
        )
    }

    #[test]
    fn perfect_prediction_has_near_zero_seg_loss() {
        let dev = Device::Cpu;
        // Class 0 scored far above the rest on every frame.
        let seg = Tensor::from_vec(
            (0..12).map(|i| if i % 3 == 0 { 30.0f32 } else { 0.0 }).collect(),
            (1, 4, 3),
            &dev,
        )
        .unwrap();
        let edge = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let target = Tensor::zeros((1, 4), DType::U32, &dev).unwrap();
        let edge_t = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();

        let l = CompositeLoss::new(0.0)
            .supervised(&seg, &edge, &target, &edge_t)
            .unwrap();
        assert!(scalar(&l.seg) < 1e-6);
        assert_eq!(accuracy(&seg, &target).unwrap(), 1.0);
    }

    #[test]
    fn label_smoothing_raises_loss_floor() {
        let (seg, edge, target, edge_t) = batch();
        let plain = CompositeLoss::new(0.0).supervised(&seg, &edge, &target, &edge_t).unwrap();
        let smooth = CompositeLoss::new(0.1).supervised(&seg, &edge, &target, &edge_t).unwrap();
        assert!((scalar(&plain.seg) - scalar(&smooth.seg)).abs() > 1e-4);
        assert_eq!(scalar(&plain.edge), scalar(&smooth.edge));
    }

    #[test]
    fn supervised_loss_ignores_batch_order() {
        let (seg, edge, target, edge_t) = batch();
        let loss = CompositeLoss::new(0.1);
        let base = loss.supervised(&seg, &edge, &target, &edge_t).unwrap();

        let perm = Tensor::new(&[2u32, 0, 1], &Device::Cpu).unwrap();
        let p = |t: &Tensor| t.index_select(&perm, 0).unwrap();
        let permuted = loss
            .supervised(&p(&seg), &p(&edge), &p(&target), &p(&edge_t))
            .unwrap();

        assert!((scalar(&base.seg) - scalar(&permuted.seg)).abs() < 1e-5);
        assert!((scalar(&base.edge) - scalar(&permuted.edge)).abs() < 1e-5);
        assert!(
            (scalar(&base.total().unwrap()) - scalar(&permuted.total().unwrap())).abs() < 1e-5
        );
    }

    #[test]
    fn emd_penalises_displacement_distance() {
        let dev = Device::Cpu;
        let target = Tensor::new(&[[0f32, 1.0, 0.0, 0.0, 0.0, 0.0]], &dev).unwrap();
        let near = Tensor::new(&[[0f32, 0.0, 1.0, 0.0, 0.0, 0.0]], &dev).unwrap();
        let far = Tensor::new(&[[0f32, 0.0, 0.0, 0.0, 0.0, 1.0]], &dev).unwrap();
        let d_near = scalar(&binary_emd(&near, &target).unwrap());
        let d_far = scalar(&binary_emd(&far, &target).unwrap());
        assert!(d_near > 0.0);
        assert!(d_far > d_near);
        assert_eq!(scalar(&binary_emd(&target, &target).unwrap()), 0.0);
    }

    #[test]
    fn supervised_rejects_length_mismatch() {
        let (seg, edge, _, edge_t) = batch();
        let short_target = Tensor::zeros((3, 3), DType::U32, &Device::Cpu).unwrap();
        let err = CompositeLoss::new(0.0)
            .supervised(&seg, &edge, &short_target, &edge_t)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::ShapeMismatch { what: "target", .. })
        ));
    }

    #[test]
    fn consistency_zero_for_identical_views() {
        let (seg, edge, _, _) = batch();
        let out = output(seg, edge);
        let c = CompositeLoss::new(0.0).consistency(&out, &out, &out).unwrap();
        assert_eq!(scalar(&c), 0.0);
    }

    #[test]
    fn consistency_positive_when_views_disagree() {
        let (seg, edge, _, _) = batch();
        let clean = output(seg.clone(), edge.clone());
        let weak = output(seg.clone(), edge.affine(1.0, 0.5).unwrap());
        let c = CompositeLoss::new(0.0).consistency(&clean, &weak, &clean).unwrap();
        assert!(scalar(&c) > 0.0);

        let strong = output(seg.affine(2.0, 0.0).unwrap(), edge);
        let c = CompositeLoss::new(0.0).consistency(&clean, &clean, &strong).unwrap();
        assert!(scalar(&c) > 0.0);
    }

    #[test]
    fn consistency_sums_all_pairs() {
        let dev = Device::Cpu;
        let zeros = Tensor::zeros((1, 2, 2), DType::F32, &dev).unwrap();
        let ones = Tensor::ones((1, 2, 2), DType::F32, &dev).unwrap();
        let edge = Tensor::zeros((1, 2), DType::F32, &dev).unwrap();
        // seg: clean = weak = 0, strong = 1 → pairs (s,c) and (s,w) each MSE 1.
        let c = CompositeLoss::new(0.0)
            .consistency(
                &output(zeros.clone(), edge.clone()),
                &output(zeros, edge.clone()),
                &output(ones, edge),
            )
            .unwrap();
        assert!((scalar(&c) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn accuracy_counts_matching_frames() {
        let dev = Device::Cpu;
        let seg = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 0.0]]], &dev).unwrap();
        let target = Tensor::new(&[[0u32, 1, 1, 0]], &dev).unwrap();
        assert!((accuracy(&seg, &target).unwrap() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn masked_accuracy_ignores_padding() {
        let dev = Device::Cpu;
        // Frames 3 and 4 are padding: target 0, predicted 1.
        let seg = Tensor::new(&[[[0f32, 1.0], [0.0, 1.0], [0.0, 1.0], [0.0, 1.0]]], &dev).unwrap();
        let target = Tensor::new(&[[1u32, 1, 0, 0]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0, 0.0]], &dev).unwrap();
        assert!((accuracy(&seg, &target).unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(masked_accuracy(&seg, &target, &mask).unwrap(), 1.0);
    }
}
