//! Run configuration for the segmentation trainer.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a runnable (if small) configuration. The value is built once
//! at startup and handed to every component by reference.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DataError;

// ── Top level ───────────────────────────────────────────────────────────────

/// Complete configuration: model shape, training schedule, data locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
}

impl Config {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file and validate it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the run meaningless.
    pub fn validate(&self) -> Result<(), DataError> {
        let t = &self.train;
        let invalid = |msg: String| Err(DataError::InvalidConfig(msg));
        if t.batch_size_sup == 0 || t.batch_size_usp == 0 {
            return invalid("batch sizes must be at least 1".into());
        }
        if t.learning_rate <= 0.0 {
            return invalid(format!("learning_rate must be positive, got {}", t.learning_rate));
        }
        if !(0.0..1.0).contains(&t.label_smoothing) {
            return invalid(format!(
                "label_smoothing must lie in [0, 1), got {}",
                t.label_smoothing
            ));
        }
        if t.ramp_start() > t.ramp_end() {
            return invalid(format!(
                "ramp_start ({}) is after ramp_end ({})",
                t.ramp_start(),
                t.ramp_end()
            ));
        }
        if let Some(decay) = t.ema_decay {
            if !(0.0..1.0).contains(&decay) {
                return invalid(format!("ema_decay must lie in [0, 1), got {decay}"));
            }
        }
        if self.model.num_classes < 2 {
            return invalid("num_classes must be at least 2 (silence + one phoneme)".into());
        }
        Ok(())
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Shape of the reference frame segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Mel bins per frame (input feature dimension).
    pub n_mels: usize,
    pub hidden_size: usize,
    /// Segmentation classes, silence (`SP`) included as class 0.
    pub num_classes: usize,
    /// Temporal convolution width; odd so the time axis is preserved.
    pub kernel_size: usize,
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_mels: 128,
            hidden_size: 256,
            num_classes: 64,
            kernel_size: 5,
            dropout: 0.1,
        }
    }
}

// ── Training ────────────────────────────────────────────────────────────────

/// Shape of the unsupervised-weight ramp between `ramp_start` and `ramp_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampShape {
    Linear,
    Sinusoidal,
    Gaussian,
}

/// Learning-rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrDecay {
    /// Cosine warm-up to `learning_rate`, then cosine anneal to a tiny floor.
    OneCycle,
    Cosine,
    Linear,
    None,
}

/// Training schedule and optimiser knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub max_steps: usize,
    pub batch_size_sup: usize,
    pub batch_size_usp: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub label_smoothing: f64,
    /// Validation cadence in steps (0 = never).
    pub val_interval: usize,
    /// Full-inference test cadence in steps (0 = never).
    pub test_interval: usize,
    /// Checkpoint cadence in steps (0 = never). Step 0 is never saved.
    pub save_ckpt_interval: usize,
    pub random_seed: u64,
    /// `cpu`, `cuda`, `cuda:N`, `metal` or `auto`.
    pub device: String,

    /// First step with a non-zero unsupervised weight boundary (default 0).
    pub ramp_start: Option<usize>,
    /// Step at which the unsupervised weight reaches 1 (default `max_steps`).
    pub ramp_end: Option<usize>,
    pub ramp_shape: RampShape,

    pub lr_decay: LrDecay,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    /// Global gradient-norm clip (0 = off).
    pub grad_clip_max_norm: f64,
    /// Exponential moving average of weights used for evaluation (None = off).
    pub ema_decay: Option<f64>,

    /// Batches buffered by each prefetch thread.
    pub prefetch_batches: usize,
    pub model_name: String,
    pub ckpt_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            batch_size_sup: 16,
            batch_size_usp: 16,
            learning_rate: 1e-3,
            weight_decay: 0.1,
            label_smoothing: 0.1,
            val_interval: 500,
            test_interval: 5_000,
            save_ckpt_interval: 5_000,
            random_seed: 114_514,
            device: "auto".to_string(),
            ramp_start: None,
            ramp_end: None,
            ramp_shape: RampShape::Gaussian,
            lr_decay: LrDecay::OneCycle,
            lr_min: 1e-6,
            lr_warmup_steps: 0,
            grad_clip_max_norm: 0.0,
            ema_decay: None,
            prefetch_batches: 8,
            model_name: "model".to_string(),
            ckpt_dir: PathBuf::from("ckpt"),
            log_dir: PathBuf::from("runs"),
        }
    }
}

impl TrainConfig {
    pub fn ramp_start(&self) -> usize {
        self.ramp_start.unwrap_or(0)
    }

    pub fn ramp_end(&self) -> usize {
        self.ramp_end.unwrap_or(self.max_steps)
    }
}

// ── Data ────────────────────────────────────────────────────────────────────

/// Where datasets live and how frames map to seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root holding `<split>/labeled`, `<split>/unlabeled` and the test corpus.
    pub data_dir: PathBuf,
    /// Phoneme → class-id JSON map.
    pub vocab: PathBuf,
    /// Duration of one feature frame (hop size / sample rate).
    pub frame_seconds: f32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            vocab: PathBuf::from("vocab.json"),
            frame_seconds: 512.0 / 44_100.0,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.train.max_steps, 100_000);
        assert_eq!(config.train.ramp_shape, RampShape::Gaussian);
        assert_eq!(config.train.lr_decay, LrDecay::OneCycle);
        assert_eq!(config.model.num_classes, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ramp_bounds_default_to_whole_run() {
        let config: Config =
            serde_json::from_str(r#"{"train": {"max_steps": 250}}"#).unwrap();
        assert_eq!(config.train.ramp_start(), 0);
        assert_eq!(config.train.ramp_end(), 250);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let json = r#"{
            "train": {"batch_size_sup": 4, "ramp_shape": "linear", "lr_decay": "cosine"},
            "data": {"frame_seconds": 0.01}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.train.batch_size_sup, 4);
        assert_eq!(config.train.batch_size_usp, 16);
        assert_eq!(config.train.ramp_shape, RampShape::Linear);
        assert_eq!(config.train.lr_decay, LrDecay::Cosine);
        assert_eq!(config.data.frame_seconds, 0.01);
        assert_eq!(config.data.vocab, PathBuf::from("vocab.json"));
    }

    #[test]
    fn validate_rejects_inverted_ramp() {
        let mut config = Config::default();
        config.train.ramp_start = Some(10);
        config.train.ramp_end = Some(5);
        assert!(matches!(config.validate(), Err(DataError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.train.batch_size_usp = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.train.max_steps = 42;
        config.train.ema_decay = Some(0.99);
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.train.max_steps, 42);
        assert_eq!(loaded.train.ema_decay, Some(0.99));
    }
}
