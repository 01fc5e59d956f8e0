//! Load a trained segmenter from a checkpoint.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use phoneseg_common::ModelConfig;
use phoneseg_core::{FrameSegmenter, Mode, SegmentationModel};

/// A segmenter with weights restored, in eval mode.
pub struct LoadedModel {
    pub model: FrameSegmenter,
    pub varmap: VarMap,
}

impl LoadedModel {
    pub fn load(config: &ModelConfig, checkpoint: &Path, device: &Device) -> anyhow::Result<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut model = FrameSegmenter::new(vb, config)?;
        varmap.load(checkpoint)?;
        model.set_mode(Mode::Eval);
        tracing::info!(checkpoint = %checkpoint.display(), "Loaded model");
        Ok(Self { model, varmap })
    }
}
