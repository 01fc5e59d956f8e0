//! Periodic full-inference test pass over a held-out corpus.
//!
//! Each utterance is decoded through a [`FullInference`] implementation;
//! the report carries the mean confidence and, when asked for, two figures
//! per utterance tagged `"{id}/melseg"` and `"{id}/probvec"` (ids from 1).

use std::path::PathBuf;

use phoneseg_common::Figure;
use phoneseg_core::{with_mode, Alignment, Detector, FullInference, Mode, Prediction, SegmentationModel};

use crate::error::TrainError;

/// One utterance of the test corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSample {
    pub audio: PathBuf,
    pub ph_seq: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub mean_confidence: f32,
    pub alignments: Vec<Alignment>,
    /// `("{id}/{name}", figure)` in corpus order.
    pub figures: Vec<(String, Figure)>,
    /// Detector output; empty when no detector is installed.
    pub predictions: Vec<Prediction>,
}

pub struct TestRunner {
    samples: Vec<TestSample>,
    detector: Option<Box<dyn Detector>>,
    silence: String,
}

impl TestRunner {
    pub fn new(samples: Vec<TestSample>) -> anyhow::Result<Self> {
        if samples.is_empty() {
            return Err(TrainError::EmptyTestCorpus.into());
        }
        Ok(Self {
            samples,
            detector: None,
            silence: phoneseg_common::vocab::SILENCE.to_string(),
        })
    }

    /// Post-process every alignment into interval predictions.
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn samples(&self) -> &[TestSample] {
        &self.samples
    }

    /// Decode the whole corpus in eval mode; the previous mode is restored
    /// on every path.
    pub fn run<M>(
        &self,
        model: &mut M,
        inference: &dyn FullInference,
        with_figures: bool,
    ) -> anyhow::Result<TestReport>
    where
        M: SegmentationModel,
    {
        with_mode(model, Mode::Eval, |model| {
            self.decode_all(model, inference, with_figures)
        })
    }

    fn decode_all(
        &self,
        model: &dyn SegmentationModel,
        inference: &dyn FullInference,
        with_figures: bool,
    ) -> anyhow::Result<TestReport> {
        let mut alignments = Vec::with_capacity(self.samples.len());
        let mut figures = Vec::new();

        for (i, sample) in self.samples.iter().enumerate() {
            let id = i + 1;
            let mut alignment =
                inference.infer_once(model, &sample.audio, &sample.ph_seq, with_figures)?;
            for (name, figure) in alignment.figures.drain(..) {
                figures.push((format!("{id}/{name}"), figure));
            }
            alignments.push(alignment);
        }

        let mean_confidence =
            alignments.iter().map(|a| a.confidence).sum::<f32>() / alignments.len() as f32;

        let predictions = match &self.detector {
            Some(detector) => {
                let raw = self
                    .samples
                    .iter()
                    .zip(&alignments)
                    .map(|(s, a)| a.to_prediction(&s.audio, &self.silence))
                    .collect();
                detector.process(raw)?
            }
            None => Vec::new(),
        };

        tracing::debug!(utterances = alignments.len(), mean_confidence, "Test pass done");
        Ok(TestReport {
            mean_confidence,
            alignments,
            figures,
            predictions,
        })
    }
}
