//! Detector strategies applied after decoding.

use phoneseg_core::{Detector, Prediction};

/// Leaves every prediction untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneDetector;

impl Detector for NoneDetector {
    fn process_one(&self, prediction: Prediction) -> anyhow::Result<Prediction> {
        Ok(prediction)
    }
}

/// Look a detector up by its configuration name.
pub fn detector_by_name(name: &str) -> anyhow::Result<Box<dyn Detector>> {
    match name {
        "none" | "NoneDetector" => Ok(Box::new(NoneDetector)),
        other => anyhow::bail!("unknown detector `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoneseg_core::Alignment;

    #[test]
    fn none_detector_is_identity() {
        let a = Alignment {
            ph_seq: vec!["SP".into(), "a".into()],
            ph_durations: vec![0.2, 0.3],
            confidence: 1.0,
            figures: Vec::new(),
        };
        let p = a.to_prediction("x.wav", "SP");
        let out = detector_by_name("none").unwrap().process(vec![p.clone()]).unwrap();
        assert_eq!(out, vec![p]);
        assert!(detector_by_name("breath").is_err());
    }
}
