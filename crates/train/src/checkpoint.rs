//! Checkpoints: one safetensors file per step, never overwritten, never pruned.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;

use phoneseg_common::Config;

use crate::error::TrainError;

pub struct CheckpointManager {
    dir: PathBuf,
    model_name: String,
}

impl CheckpointManager {
    /// Creates `dir` and writes `config.json` there if it is not present yet.
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>, config: &Config) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            config.save(&config_path)?;
        }
        Ok(Self {
            dir,
            model_name: model_name.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/{model_name}_{step}.safetensors`.
    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir
            .join(format!("{}_{step}.safetensors", self.model_name))
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}_final.safetensors", self.model_name))
    }

    /// Persist all parameters tagged with `step`. Refuses to overwrite.
    pub fn save(&self, step: usize, varmap: &VarMap) -> anyhow::Result<PathBuf> {
        let path = write_new(&self.path_for(step), varmap)?;
        tracing::info!(step, path = %path.display(), "Saved checkpoint");
        Ok(path)
    }

    /// Weights at the end of the run, `{model_name}_final.safetensors`.
    /// Refuses to overwrite, like [`save`](Self::save).
    pub fn save_final(&self, varmap: &VarMap) -> anyhow::Result<PathBuf> {
        let path = write_new(&self.final_path(), varmap)?;
        tracing::info!(path = %path.display(), "Saved final weights");
        Ok(path)
    }

    /// Existing step checkpoints for this model, sorted by step.
    pub fn list(&self) -> anyhow::Result<Vec<(usize, PathBuf)>> {
        let prefix = format!("{}_", self.model_name);
        let mut out: Vec<(usize, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?;
                if p.extension()? != "safetensors" {
                    return None;
                }
                let step = stem.strip_prefix(&prefix)?.parse().ok()?;
                Some((step, p))
            })
            .collect();
        out.sort_by_key(|(step, _)| *step);
        Ok(out)
    }
}

/// Write to `<path>.tmp` and rename, so `path` only ever holds a complete file.
fn write_new(path: &Path, varmap: &VarMap) -> anyhow::Result<PathBuf> {
    if path.exists() {
        return Err(TrainError::CheckpointExists(path.to_path_buf()).into());
    }
    let tmp = path.with_extension("safetensors.tmp");
    if let Err(e) = varmap.save(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    std::fs::rename(&tmp, path)?;
    Ok(path.to_path_buf())
}
