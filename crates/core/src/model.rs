//! Model collaborator contract.
//!
//! The training engine never looks inside the network: it feeds a feature
//! batch `[B, T, n_mels]` and gets back four tensors. Parameters live in the
//! `VarMap` the model was built from, which is what checkpoints persist.

use candle_core::{Result, Tensor};

/// Training/evaluation switch. Dropout and similar layers read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Everything the network returns for one feature batch.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Encoder features `[B, T, H]`.
    pub hidden: Tensor,
    /// Per-frame class scores `[B, T, C]`.
    pub seg: Tensor,
    /// Per-frame CTC scores `[B, T, C + 1]` (blank last).
    pub ctc: Tensor,
    /// Per-frame boundary logits `[B, T]`.
    pub edge: Tensor,
}

pub trait SegmentationModel {
    fn forward(&self, features: &Tensor) -> Result<ModelOutput>;
    fn set_mode(&mut self, mode: Mode);
    fn mode(&self) -> Mode;
}

/// Run `f` with `model` switched to `mode`, then put the previous mode back.
pub fn with_mode<M, T>(model: &mut M, mode: Mode, f: impl FnOnce(&M) -> T) -> T
where
    M: SegmentationModel + ?Sized,
{
    let previous = model.mode();
    model.set_mode(mode);
    let out = f(model);
    model.set_mode(previous);
    out
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    fn forward(&self, features: &Tensor) -> Result<ModelOutput> {
        (**self).forward(features)
    }

    fn set_mode(&mut self, mode: Mode) {
        (**self).set_mode(mode)
    }

    fn mode(&self) -> Mode {
        (**self).mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(Mode);

    impl SegmentationModel for Stub {
        fn forward(&self, _features: &Tensor) -> Result<ModelOutput> {
            candle_core::bail!("stub")
        }
        fn set_mode(&mut self, mode: Mode) {
            self.0 = mode;
        }
        fn mode(&self) -> Mode {
            self.0
        }
    }

    #[test]
    fn with_mode_restores_previous_mode() {
        let mut model = Stub(Mode::Train);
        let seen = with_mode(&mut model, Mode::Eval, |m| m.mode());
        assert_eq!(seen, Mode::Eval);
        assert_eq!(model.mode(), Mode::Train);

        let xs = Tensor::new(0f32, &candle_core::Device::Cpu).unwrap();
        let failed = with_mode(&mut model, Mode::Eval, |m| m.forward(&xs));
        assert!(failed.is_err());
        assert_eq!(model.mode(), Mode::Train);
    }
}
