//! Full-inference contract used by the periodic test pass.
//!
//! One call decodes a whole utterance: audio path + reference phoneme
//! sequence in, aligned phonemes with durations and a confidence out.

use std::path::Path;

use phoneseg_common::Figure;

use crate::model::SegmentationModel;

/// Decoded result for one utterance.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub ph_seq: Vec<String>,
    /// Seconds per phoneme, same length as `ph_seq`.
    pub ph_durations: Vec<f32>,
    /// In `[0, 1]`.
    pub confidence: f32,
    /// `(name, figure)`, e.g. `("melseg", ..)`, `("probvec", ..)`.
    pub figures: Vec<(String, Figure)>,
}

impl Alignment {
    /// `[start, end]` in seconds for every phoneme.
    pub fn intervals(&self) -> Vec<[f32; 2]> {
        let mut t = 0.0f32;
        self.ph_durations
            .iter()
            .map(|&d| {
                let iv = [t, t + d];
                t += d;
                iv
            })
            .collect()
    }
}

pub trait FullInference {
    fn infer_once(
        &self,
        model: &dyn SegmentationModel,
        audio: &Path,
        ph_seq: &[String],
        return_plot: bool,
    ) -> anyhow::Result<Alignment>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_accumulate_durations() {
        let a = Alignment {
            ph_seq: vec!["SP".into(), "a".into(), "SP".into()],
            ph_durations: vec![0.5, 0.25, 0.25],
            confidence: 0.9,
            figures: Vec::new(),
        };
        assert_eq!(a.intervals(), vec![[0.0, 0.5], [0.5, 0.75], [0.75, 1.0]]);
    }
}
