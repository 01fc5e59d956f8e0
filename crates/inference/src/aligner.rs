//! Forced alignment of a known phoneme sequence against frame posteriors.
//!
//! Features are read from `<stem>.safetensors` beside the audio file (key
//! `melspec`, `[T, F]` or `[1, T, F]`). The model's segmentation head gives
//! per-frame class log-probabilities; a monotonic Viterbi pass assigns every
//! frame to exactly one phoneme of the sequence, each phoneme getting at least
//! one frame.

use std::path::Path;

use candle_core::{Device, Tensor, D};
use candle_nn::ops;

use phoneseg_common::{DataError, Figure, Vocab};
use phoneseg_core::{Alignment, FullInference, SegmentationModel};

const FEATURE_KEY: &str = "melspec";

pub struct ForcedAligner {
    vocab: Vocab,
    frame_seconds: f32,
    device: Device,
}

impl ForcedAligner {
    pub fn new(vocab: Vocab, frame_seconds: f32, device: Device) -> Self {
        Self {
            vocab,
            frame_seconds,
            device,
        }
    }

    fn load_features(&self, audio: &Path) -> anyhow::Result<Tensor> {
        let path = audio.with_extension("safetensors");
        let mut tensors = candle_core::safetensors::load(&path, &self.device)?;
        let melspec = tensors
            .remove(FEATURE_KEY)
            .ok_or_else(|| DataError::MissingTensor {
                key: FEATURE_KEY,
                path: path.clone(),
            })?;
        let melspec = match melspec.rank() {
            2 => melspec.unsqueeze(0)?,
            3 => melspec,
            _ => anyhow::bail!("{}: melspec must be [T, F] or [1, T, F], got {:?}", path.display(), melspec.dims()),
        };
        Ok(melspec.to_dtype(candle_core::DType::F32)?)
    }
}

impl FullInference for ForcedAligner {
    fn infer_once(
        &self,
        model: &dyn SegmentationModel,
        audio: &Path,
        ph_seq: &[String],
        return_plot: bool,
    ) -> anyhow::Result<Alignment> {
        let ids = ph_seq
            .iter()
            .map(|ph| self.vocab.id(ph))
            .collect::<Result<Vec<u32>, _>>()?;

        let melspec = self.load_features(audio)?;
        let out = model.forward(&melspec)?;
        let log_probs: Vec<Vec<f32>> = ops::log_softmax(&out.seg, D::Minus1)?
            .squeeze(0)?
            .to_vec2()?;

        let states = viterbi(&log_probs, &ids)?;

        let mut frames_per_ph = vec![0usize; ids.len()];
        let mut prob_sum = 0.0f32;
        for (t, &n) in states.iter().enumerate() {
            frames_per_ph[n] += 1;
            prob_sum += log_probs[t][ids[n] as usize].exp();
        }
        let confidence = prob_sum / states.len() as f32;
        let ph_durations = frames_per_ph
            .iter()
            .map(|&f| f as f32 * self.frame_seconds)
            .collect();

        let figures = if return_plot {
            vec![
                ("melseg".to_string(), melseg(&melspec, &states)?),
                ("probvec".to_string(), probvec(&log_probs, &ids)),
            ]
        } else {
            Vec::new()
        };

        tracing::debug!(audio = %audio.display(), frames = states.len(), confidence, "Aligned");
        Ok(Alignment {
            ph_seq: ph_seq.to_vec(),
            ph_durations,
            confidence,
            figures,
        })
    }
}

/// Most likely monotonic assignment of `T` frames to the `N` phonemes in
/// `ids`. Returns the phoneme index for every frame.
pub fn viterbi(log_probs: &[Vec<f32>], ids: &[u32]) -> anyhow::Result<Vec<usize>> {
    let (t_len, n_len) = (log_probs.len(), ids.len());
    if n_len == 0 {
        anyhow::bail!("empty phoneme sequence");
    }
    if t_len < n_len {
        anyhow::bail!("{t_len} frames cannot hold {n_len} phonemes");
    }
    let classes = log_probs[0].len();
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= classes) {
        anyhow::bail!("phoneme id {bad} outside the model's {classes} classes");
    }

    // score[t][n]: best path ending at frame t in phoneme n.
    // advanced[t][n]: that path entered n at frame t.
    let mut score = vec![f32::NEG_INFINITY; t_len * n_len];
    let mut advanced = vec![false; t_len * n_len];
    let at = |t: usize, n: usize| t * n_len + n;

    score[at(0, 0)] = log_probs[0][ids[0] as usize];
    for t in 1..t_len {
        // Phoneme n needs at least n frames before it and N-1-n after it.
        let lo = n_len.saturating_sub(t_len - t);
        let hi = t.min(n_len - 1);
        for n in lo..=hi {
            let stay = score[at(t - 1, n)];
            let enter = if n > 0 { score[at(t - 1, n - 1)] } else { f32::NEG_INFINITY };
            let (best, adv) = if enter > stay { (enter, true) } else { (stay, false) };
            score[at(t, n)] = best + log_probs[t][ids[n] as usize];
            advanced[at(t, n)] = adv;
        }
    }

    let mut states = vec![0usize; t_len];
    let mut n = n_len - 1;
    for t in (0..t_len).rev() {
        states[t] = n;
        if t > 0 && advanced[at(t, n)] {
            n -= 1;
        }
    }
    Ok(states)
}

/// Mel spectrogram `[F, T]` with the first frame of every phoneme drawn at
/// the spectrogram's maximum.
fn melseg(melspec: &Tensor, states: &[usize]) -> anyhow::Result<Figure> {
    let mut fig = Figure::from_tensor("melseg", &melspec.squeeze(0)?.t()?.contiguous()?)?;
    let peak = fig.values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    for (t, pair) in states.windows(2).enumerate() {
        if pair[0] != pair[1] {
            for row in 0..fig.rows {
                fig.values[row * fig.cols + t + 1] = peak;
            }
        }
    }
    Ok(fig)
}

/// Probability of each sequence phoneme over time, `[N, T]`.
fn probvec(log_probs: &[Vec<f32>], ids: &[u32]) -> Figure {
    let values = ids
        .iter()
        .flat_map(|&id| log_probs.iter().map(move |frame| frame[id as usize].exp()))
        .collect();
    Figure {
        title: "probvec".into(),
        rows: ids.len(),
        cols: log_probs.len(),
        values,
    }
}
