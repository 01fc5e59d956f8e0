//! Post-processing contract applied to decoded alignments.

use std::path::PathBuf;

use crate::align::Alignment;

/// Interval-level result for one utterance, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub wav_path: PathBuf,
    pub wav_length: f32,
    pub ph_seq: Vec<String>,
    pub ph_intervals: Vec<[f32; 2]>,
    pub word_seq: Vec<String>,
    pub word_intervals: Vec<[f32; 2]>,
}

/// Rewrites predictions, e.g. to insert breaths or merge silences.
pub trait Detector {
    fn process_one(&self, prediction: Prediction) -> anyhow::Result<Prediction>;

    fn process(&self, predictions: Vec<Prediction>) -> anyhow::Result<Vec<Prediction>> {
        predictions
            .into_iter()
            .map(|p| self.process_one(p))
            .collect()
    }
}

impl Alignment {
    /// Interval form of this alignment. Without a lexicon every non-silence
    /// phoneme stands for its own word.
    pub fn to_prediction(&self, wav_path: impl Into<PathBuf>, silence: &str) -> Prediction {
        let ph_intervals = self.intervals();
        let (word_seq, word_intervals): (Vec<String>, Vec<[f32; 2]>) = self
            .ph_seq
            .iter()
            .zip(&ph_intervals)
            .filter(|(ph, _)| ph.as_str() != silence)
            .map(|(ph, iv)| (ph.clone(), *iv))
            .unzip();
        Prediction {
            wav_path: wav_path.into(),
            wav_length: self.ph_durations.iter().sum(),
            ph_seq: self.ph_seq.clone(),
            ph_intervals,
            word_seq,
            word_intervals,
        }
    }
}
