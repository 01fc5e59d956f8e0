//! Phoneme vocabulary: phoneme symbol ↔ segmentation class id.
//!
//! Stored as a JSON object `{"SP": 0, "a": 1, ...}`. Silence (`SP`) is class 0.

use std::collections::HashMap;
use std::path::Path;

use crate::error::DataError;

pub const SILENCE: &str = "SP";

#[derive(Debug, Clone)]
pub struct Vocab {
    ids: HashMap<String, u32>,
    symbols: Vec<String>,
}

impl Vocab {
    /// Build from symbols in class order; `SP` is inserted at 0 if missing.
    pub fn from_phonemes<I, S>(phonemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut symbols = vec![SILENCE.to_string()];
        for p in phonemes {
            let p = p.into();
            if !symbols.contains(&p) {
                symbols.push(p);
            }
        }
        let ids = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Self { ids, symbols }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let ids: HashMap<String, u32> = serde_json::from_str(&json)?;
        let mut symbols = vec![String::new(); ids.len()];
        for (symbol, &id) in &ids {
            let slot = symbols.get_mut(id as usize).ok_or_else(|| {
                DataError::InvalidConfig(format!("vocab ids must be dense, `{symbol}` has {id}"))
            })?;
            if !slot.is_empty() {
                return Err(DataError::InvalidConfig(format!(
                    "vocab id {id} used by both `{slot}` and `{symbol}`"
                ))
                .into());
            }
            *slot = symbol.clone();
        }
        if ids.get(SILENCE) != Some(&0) {
            return Err(DataError::InvalidConfig(format!("`{SILENCE}` must be class 0")).into());
        }
        Ok(Self { ids, symbols })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.ids)?)?;
        Ok(())
    }

    pub fn id(&self, phoneme: &str) -> Result<u32, DataError> {
        self.ids
            .get(phoneme)
            .copied()
            .ok_or_else(|| DataError::UnknownPhoneme(phoneme.to_string()))
    }

    pub fn symbol(&self, id: u32) -> Option<&str> {
        self.symbols.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
