//! Reference frame segmenter.
//!
//! Linear projection → temporal conv (residual) → dropout → three linear
//! heads. Small enough to train on CPU; the engine only depends on the
//! [`SegmentationModel`] contract.

use candle_core::{Result, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, Module, VarBuilder};

use phoneseg_common::ModelConfig;

use crate::model::{Mode, ModelOutput, SegmentationModel};

pub struct FrameSegmenter {
    proj: Linear,
    conv: Conv1d,
    seg_head: Linear,
    ctc_head: Linear,
    edge_head: Linear,
    dropout: f32,
    mode: Mode,
}

impl FrameSegmenter {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let h = config.hidden_size;
        let proj = linear(config.n_mels, h, vb.pp("proj"))?;
        let conv_cfg = Conv1dConfig {
            padding: config.kernel_size / 2,
            ..Default::default()
        };
        let conv = conv1d(h, h, config.kernel_size, conv_cfg, vb.pp("conv"))?;
        let seg_head = linear(h, config.num_classes, vb.pp("seg_head"))?;
        let ctc_head = linear(h, config.num_classes + 1, vb.pp("ctc_head"))?;
        let edge_head = linear(h, 1, vb.pp("edge_head"))?;
        Ok(Self {
            proj,
            conv,
            seg_head,
            ctc_head,
            edge_head,
            dropout: config.dropout,
            mode: Mode::Train,
        })
    }
}

impl SegmentationModel for FrameSegmenter {
    fn forward(&self, features: &Tensor) -> Result<ModelOutput> {
        let h = self.proj.forward(features)?.gelu()?;
        // Conv1d wants [B, H, T].
        let c = self
            .conv
            .forward(&h.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .gelu()?;
        let mut hidden = (h + c)?;
        if self.mode == Mode::Train && self.dropout > 0.0 {
            hidden = candle_nn::ops::dropout(&hidden, self.dropout)?;
        }
        let seg = self.seg_head.forward(&hidden)?;
        let ctc = self.ctc_head.forward(&hidden)?;
        let edge = self.edge_head.forward(&hidden)?.squeeze(2)?;
        Ok(ModelOutput {
            hidden,
            seg,
            ctc,
            edge,
        })
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}
