//! Test-corpus discovery.
//!
//! Every `transcriptions.csv` under the root describes one folder of
//! utterances: a `name` column (audio file stem under `wavs/`) and a
//! `ph_seq` column of space-separated phonemes.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use walkdir::WalkDir;

use phoneseg_train::TestSample;

const TRANSCRIPTIONS: &str = "transcriptions.csv";

#[derive(Debug, Deserialize)]
struct Row {
    name: String,
    ph_seq: String,
}

/// All utterances listed under `root`, in path order.
pub fn discover_test_corpus(root: &Path) -> anyhow::Result<Vec<TestSample>> {
    let mut samples = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() == TRANSCRIPTIONS {
            let found = read_transcriptions(entry.path())?;
            tracing::debug!(path = %entry.path().display(), utterances = found.len(), "Test transcriptions");
            samples.extend(found);
        }
    }
    Ok(samples)
}

fn read_transcriptions(path: &Path) -> anyhow::Result<Vec<TestSample>> {
    let wavs = path.parent().unwrap_or(Path::new(".")).join("wavs");
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    reader
        .deserialize::<Row>()
        .map(|row| {
            let row = row.with_context(|| format!("parse {}", path.display()))?;
            Ok(TestSample {
                audio: wavs.join(format!("{}.wav", row.name)),
                ph_seq: row.ph_seq.split_whitespace().map(str::to_string).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_transcriptions() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b").join("deep");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(
            a.join(TRANSCRIPTIONS),
            "name,ph_seq,ph_dur\nx,SP a SP,0.1 0.2 0.1\ny,SP b SP,0.1 0.2 0.1\n",
        )
        .unwrap();
        std::fs::write(b.join(TRANSCRIPTIONS), "name,ph_seq\nz,SP c d SP\n").unwrap();
        std::fs::write(dir.path().join("notes.csv"), "name,ph_seq\nq,SP\n").unwrap();

        let samples = discover_test_corpus(dir.path()).unwrap();
        let audio: Vec<_> = samples.iter().map(|s| s.audio.clone()).collect();
        assert_eq!(
            audio,
            vec![
                a.join("wavs").join("x.wav"),
                a.join("wavs").join("y.wav"),
                b.join("wavs").join("z.wav"),
            ]
        );
        assert_eq!(samples[2].ph_seq, vec!["SP", "c", "d", "SP"]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TRANSCRIPTIONS), "name\nx\n").unwrap();
        assert!(discover_test_corpus(dir.path()).is_err());
    }
}
