//! Data pipeline: samples, collation, datasets, batch sources.
//!
//! Labeled samples carry a mel spectrogram `[frames, n_mels]`, one class id
//! per frame and a per-frame boundary indicator. Unlabeled samples carry three
//! views of the same utterance (clean, weakly and strongly augmented) that
//! share one time axis.
//!
//! * **[`InMemoryDataset`]**: samples of one named split loaded from safetensors.
//! * **[`BatchSource`]**: infinite, reshuffling batch stream over a dataset.
//! * **[`ordered_batches`]**: finite, ordered pass used for validation.
//! * **[`Prefetcher`]**: runs any [`BatchStream`] on a producer thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::DataError;

// ── Samples ─────────────────────────────────────────────────────────────────

/// One labeled utterance.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    /// Row-major `[frames, n_mels]`.
    pub melspec: Vec<f32>,
    pub frames: usize,
    pub n_mels: usize,
    pub target: Vec<u32>,
    pub edge_target: Vec<f32>,
}

impl LabeledSample {
    pub fn new(
        melspec: Vec<f32>,
        n_mels: usize,
        target: Vec<u32>,
        edge_target: Vec<f32>,
    ) -> Result<Self, DataError> {
        if n_mels == 0 {
            return Err(DataError::InvalidConfig("n_mels must be at least 1".into()));
        }
        let frames = target.len();
        if frames == 0 {
            return Err(DataError::EmptySample("labeled sample"));
        }
        check_len("melspec", frames * n_mels, melspec.len())?;
        check_len("edge_target", frames, edge_target.len())?;
        Ok(Self {
            melspec,
            frames,
            n_mels,
            target,
            edge_target,
        })
    }
}

/// One unlabeled utterance in three augmentation strengths.
#[derive(Debug, Clone)]
pub struct UnlabeledSample {
    pub feature: Vec<f32>,
    pub feature_weak_aug: Vec<f32>,
    pub feature_strong_aug: Vec<f32>,
    pub frames: usize,
    pub n_mels: usize,
}

impl UnlabeledSample {
    pub fn new(
        feature: Vec<f32>,
        feature_weak_aug: Vec<f32>,
        feature_strong_aug: Vec<f32>,
        n_mels: usize,
    ) -> Result<Self, DataError> {
        if n_mels == 0 {
            return Err(DataError::InvalidConfig("n_mels must be at least 1".into()));
        }
        let frames = feature.len() / n_mels;
        if frames == 0 {
            return Err(DataError::EmptySample("unlabeled sample"));
        }
        check_len("feature", frames * n_mels, feature.len())?;
        check_len("feature_weak_aug", feature.len(), feature_weak_aug.len())?;
        check_len("feature_strong_aug", feature.len(), feature_strong_aug.len())?;
        Ok(Self {
            feature,
            feature_weak_aug,
            feature_strong_aug,
            frames,
            n_mels,
        })
    }
}

fn check_len(context: &str, expected: usize, actual: usize) -> Result<(), DataError> {
    if expected == actual {
        Ok(())
    } else {
        Err(DataError::ShapeMismatch {
            context: context.to_string(),
            expected,
            actual,
        })
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Collated labeled batch, padded to the longest sample.
#[derive(Debug, Clone)]
pub struct SupervisedBatch {
    pub melspec: Vec<f32>,
    pub target: Vec<u32>,
    pub edge_target: Vec<f32>,
    /// Unpadded frame count of each sample.
    pub lengths: Vec<usize>,
    pub batch_size: usize,
    pub frames: usize,
    pub n_mels: usize,
}

impl SupervisedBatch {
    /// `(melspec [B,T,F] f32, target [B,T] u32, edge_target [B,T] f32)`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let (b, t, f) = (self.batch_size, self.frames, self.n_mels);
        let melspec = Tensor::from_slice(&self.melspec, (b, t, f), device)?;
        let target = Tensor::from_slice(&self.target, (b, t), device)?;
        let edge_target = Tensor::from_slice(&self.edge_target, (b, t), device)?;
        Ok((melspec, target, edge_target))
    }

    /// `[B,T]` f32, 1 on real frames and 0 on padding.
    pub fn frame_mask(&self, device: &Device) -> candle_core::Result<Tensor> {
        let mask: Vec<f32> = self
            .lengths
            .iter()
            .flat_map(|&len| (0..self.frames).map(move |t| if t < len { 1.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (self.batch_size, self.frames), device)
    }
}

/// Collated unlabeled batch: three views, identical shapes.
#[derive(Debug, Clone)]
pub struct UnsupervisedBatch {
    pub feature: Vec<f32>,
    pub feature_weak_aug: Vec<f32>,
    pub feature_strong_aug: Vec<f32>,
    pub batch_size: usize,
    pub frames: usize,
    pub n_mels: usize,
}

impl UnsupervisedBatch {
    /// `[clean, weak, strong]`, each `[B,T,F]`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<[Tensor; 3]> {
        let shape = (self.batch_size, self.frames, self.n_mels);
        Ok([
            Tensor::from_slice(&self.feature, shape, device)?,
            Tensor::from_slice(&self.feature_weak_aug, shape, device)?,
            Tensor::from_slice(&self.feature_strong_aug, shape, device)?,
        ])
    }
}

/// Turns a slice of samples into one padded batch.
pub trait Collate: Sized {
    type Batch: Send + 'static;

    fn collate(items: &[&Self]) -> Result<Self::Batch, DataError>;
}

fn common_n_mels(n_mels: impl Iterator<Item = usize>) -> Result<usize, DataError> {
    let mut found = None;
    for n in n_mels {
        match found {
            None => found = Some(n),
            Some(expected) => check_len("n_mels", expected, n)?,
        }
    }
    found.ok_or_else(|| DataError::EmptyDataset("cannot collate zero samples".into()))
}

/// Copy `src` (`frames × width` values) into a zero-padded `max_frames × width` row.
fn pad_into<T: Copy + Default>(dst: &mut Vec<T>, src: &[T], max_frames: usize, width: usize) {
    dst.extend_from_slice(src);
    dst.resize(dst.len() + max_frames * width - src.len(), T::default());
}

impl Collate for LabeledSample {
    type Batch = SupervisedBatch;

    fn collate(items: &[&Self]) -> Result<SupervisedBatch, DataError> {
        let n_mels = common_n_mels(items.iter().map(|s| s.n_mels))?;
        let frames = items.iter().map(|s| s.frames).max().unwrap_or(0);
        let b = items.len();
        let mut melspec = Vec::with_capacity(b * frames * n_mels);
        let mut target = Vec::with_capacity(b * frames);
        let mut edge_target = Vec::with_capacity(b * frames);
        for s in items {
            pad_into(&mut melspec, &s.melspec, frames, n_mels);
            pad_into(&mut target, &s.target, frames, 1);
            pad_into(&mut edge_target, &s.edge_target, frames, 1);
        }
        Ok(SupervisedBatch {
            melspec,
            target,
            edge_target,
            lengths: items.iter().map(|s| s.frames).collect(),
            batch_size: b,
            frames,
            n_mels,
        })
    }
}

impl Collate for UnlabeledSample {
    type Batch = UnsupervisedBatch;

    fn collate(items: &[&Self]) -> Result<UnsupervisedBatch, DataError> {
        let n_mels = common_n_mels(items.iter().map(|s| s.n_mels))?;
        let frames = items.iter().map(|s| s.frames).max().unwrap_or(0);
        let b = items.len();
        let mut views: [Vec<f32>; 3] =
            std::array::from_fn(|_| Vec::with_capacity(b * frames * n_mels));
        for s in items {
            pad_into(&mut views[0], &s.feature, frames, n_mels);
            pad_into(&mut views[1], &s.feature_weak_aug, frames, n_mels);
            pad_into(&mut views[2], &s.feature_strong_aug, frames, n_mels);
        }
        let [feature, feature_weak_aug, feature_strong_aug] = views;
        Ok(UnsupervisedBatch {
            feature,
            feature_weak_aug,
            feature_strong_aug,
            batch_size: b,
            frames,
            n_mels,
        })
    }
}

// ── Datasets ────────────────────────────────────────────────────────────────

/// Random-access collection of samples.
pub trait Dataset: Send + 'static {
    type Sample: Collate;

    fn len(&self) -> usize;
    fn get(&self, index: usize) -> &Self::Sample;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sample type that can be read from one safetensors file.
pub trait SampleFile: Sized {
    /// Directory under `<data_dir>/<split>/` holding the files.
    const SUBDIR: &'static str;

    fn read(path: &Path) -> anyhow::Result<Self>;
}

/// All samples of one split, held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset<S> {
    name: String,
    samples: Vec<S>,
}

pub type LabeledDataset = InMemoryDataset<LabeledSample>;
pub type UnlabeledDataset = InMemoryDataset<UnlabeledSample>;

impl<S> InMemoryDataset<S> {
    pub fn from_samples(name: impl Into<String>, samples: Vec<S>) -> Result<Self, DataError> {
        let name = name.into();
        if samples.is_empty() {
            return Err(DataError::EmptyDataset(name));
        }
        Ok(Self { name, samples })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[S] {
        &self.samples
    }
}

impl<S: SampleFile + Send> InMemoryDataset<S> {
    /// Load `<data_dir>/<split>/<S::SUBDIR>/*.safetensors`, files read in parallel.
    pub fn load_split(data_dir: &Path, split: &str) -> anyhow::Result<Self> {
        let dir = data_dir.join(split).join(S::SUBDIR);
        let files = collect_files(&dir, "safetensors")?;
        let samples = files
            .par_iter()
            .map(|p| S::read(p).with_context(|| format!("read sample {}", p.display())))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let name = format!("{split}/{}", S::SUBDIR);
        tracing::info!(dataset = %name, samples = samples.len(), "Loaded dataset");
        Ok(Self::from_samples(name, samples)?)
    }
}

impl<S: Collate + Send + 'static> Dataset for InMemoryDataset<S> {
    type Sample = S;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> &S {
        &self.samples[index]
    }
}

fn take_tensor(
    tensors: &mut std::collections::HashMap<String, Tensor>,
    key: &'static str,
    path: &Path,
) -> Result<Tensor, DataError> {
    tensors.remove(key).ok_or_else(|| DataError::MissingTensor {
        key,
        path: path.to_path_buf(),
    })
}

fn f32_matrix(t: &Tensor) -> candle_core::Result<(Vec<f32>, usize)> {
    let (_, n_mels) = t.dims2()?;
    Ok((t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?, n_mels))
}

impl SampleFile for LabeledSample {
    const SUBDIR: &'static str = "labeled";

    fn read(path: &Path) -> anyhow::Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let (melspec, n_mels) = f32_matrix(&take_tensor(&mut tensors, "melspec", path)?)?;
        let target = take_tensor(&mut tensors, "target", path)?
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        let edge_target = take_tensor(&mut tensors, "edge_target", path)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self::new(melspec, n_mels, target, edge_target)?)
    }
}

impl SampleFile for UnlabeledSample {
    const SUBDIR: &'static str = "unlabeled";

    fn read(path: &Path) -> anyhow::Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let (feature, n_mels) = f32_matrix(&take_tensor(&mut tensors, "feature", path)?)?;
        let (weak, _) = f32_matrix(&take_tensor(&mut tensors, "feature_weak_aug", path)?)?;
        let (strong, _) = f32_matrix(&take_tensor(&mut tensors, "feature_strong_aug", path)?)?;
        Ok(Self::new(feature, weak, strong, n_mels)?)
    }
}

// ── Batch streams ───────────────────────────────────────────────────────────

/// Blocking "give me the next batch" interface consumed by the training loop.
pub trait BatchStream<B> {
    fn next_batch(&mut self) -> anyhow::Result<B>;
}

/// Infinite batch stream over a finite dataset.
///
/// Walks a shuffled permutation; the last batch of a pass may be short. When
/// the permutation is used up it is reshuffled and the walk restarts, so the
/// consumer never observes exhaustion.
pub struct BatchSource<D: Dataset> {
    dataset: D,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl<D: Dataset> BatchSource<D> {
    pub fn shuffled(dataset: D, batch_size: usize, seed: u64) -> Result<Self, DataError> {
        if dataset.is_empty() {
            return Err(DataError::EmptyDataset("batch source".into()));
        }
        if batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be at least 1".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            dataset,
            batch_size,
            order,
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    /// Completed passes over the dataset.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    fn next_indices(&mut self) -> &[usize] {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
            tracing::debug!(epoch = self.epoch, "Batch source reshuffled");
        }
        let start = self.cursor;
        let end = (start + self.batch_size).min(self.order.len());
        self.cursor = end;
        &self.order[start..end]
    }
}

impl<D: Dataset> BatchStream<<D::Sample as Collate>::Batch> for BatchSource<D> {
    fn next_batch(&mut self) -> anyhow::Result<<D::Sample as Collate>::Batch> {
        let indices = self.next_indices().to_vec();
        let items: Vec<&D::Sample> = indices.iter().map(|&i| self.dataset.get(i)).collect();
        Ok(D::Sample::collate(&items)?)
    }
}

/// One ordered pass over `dataset`: no shuffling, no cycling.
pub fn ordered_batches<D: Dataset>(
    dataset: &D,
    batch_size: usize,
) -> impl Iterator<Item = Result<<D::Sample as Collate>::Batch, DataError>> + '_ {
    let batch_size = batch_size.max(1);
    (0..dataset.len()).step_by(batch_size).map(move |start| {
        let end = (start + batch_size).min(dataset.len());
        let items: Vec<&D::Sample> = (start..end).map(|i| dataset.get(i)).collect();
        D::Sample::collate(&items)
    })
}

// ── Prefetcher ──────────────────────────────────────────────────────────────

/// Runs a batch stream on a producer thread with a bounded buffer.
///
/// The consumer side is still a blocking [`BatchStream`]. A producer error is
/// delivered once and then the thread stops.
pub struct Prefetcher<B> {
    rx: Option<Receiver<anyhow::Result<B>>>,
    handle: Option<JoinHandle<()>>,
}

impl<B: Send + 'static> Prefetcher<B> {
    pub fn spawn<S>(mut source: S, capacity: usize) -> Self
    where
        S: BatchStream<B> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let handle = thread::spawn(move || loop {
            let item = source.next_batch();
            let failed = item.is_err();
            if tx.send(item).is_err() || failed {
                return;
            }
        });
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

impl<B> BatchStream<B> for Prefetcher<B> {
    fn next_batch(&mut self) -> anyhow::Result<B> {
        let rx = self.rx.as_ref().ok_or(DataError::SourceClosed)?;
        rx.recv().map_err(|_| DataError::SourceClosed)?
    }
}

impl<B> Drop for Prefetcher<B> {
    fn drop(&mut self) {
        // Closing the channel unblocks a producer waiting on a full buffer.
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Collect files with `extension` directly under `dir`, sorted.
pub fn collect_files(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == extension).unwrap_or(false))
        .collect();
    out.sort();
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
