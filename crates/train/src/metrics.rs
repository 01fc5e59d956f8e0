//! Metric sinks.
//!
//! The engine computes metrics as plain values and hands them to a
//! [`MetricsSink`]. Sinks may fail; callers report the error and carry on.

use std::fs::File;
use std::path::{Path, PathBuf};

use phoneseg_common::Figure;

/// Scalar and figure tags emitted by the engine.
pub mod tags {
    pub const TRAIN_ACCURACY: &str = "Accuracy/train";
    pub const TRAIN_SEG: &str = "Loss/train/sup/seg";
    pub const TRAIN_EDGE: &str = "Loss/train/sup/edge";
    pub const TRAIN_CONSISTENCY: &str = "Loss/train/consistency";
    pub const TRAIN_TOTAL: &str = "Loss/train/total";
    pub const LR: &str = "learning_rate/total";
    pub const RAMP: &str = "learning_rate/usp";
    pub const VALID_ACCURACY: &str = "Accuracy/valid";
    pub const VALID_SEG: &str = "Loss/valid/seg";
    pub const VALID_EDGE: &str = "Loss/valid/edge";
    pub const TEST_CONFIDENCE: &str = "Accuracy/test_confidence";
}

pub trait MetricsSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()>;
    fn figure(&mut self, tag: &str, figure: &Figure, step: usize) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Tracing ─────────────────────────────────────────────────────────────────

/// Logs every metric at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        tracing::debug!(step, tag, value, "metric");
        Ok(())
    }

    fn figure(&mut self, tag: &str, figure: &Figure, step: usize) -> anyhow::Result<()> {
        tracing::debug!(step, tag, rows = figure.rows, cols = figure.cols, "figure");
        Ok(())
    }
}

// ── CSV ─────────────────────────────────────────────────────────────────────

/// `metrics.csv` (`step,tag,value`) plus one JSON file per figure.
pub struct CsvSink {
    writer: csv::Writer<File>,
    figure_dir: PathBuf,
}

impl CsvSink {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let figure_dir = dir.join("figures");
        std::fs::create_dir_all(&figure_dir)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(dir.join("metrics.csv"))?;
        writer.write_record(["step", "tag", "value"])?;
        Ok(Self { writer, figure_dir })
    }
}

impl MetricsSink for CsvSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.writer
            .write_record([step.to_string(), tag.to_string(), value.to_string()])?;
        Ok(())
    }

    fn figure(&mut self, tag: &str, figure: &Figure, step: usize) -> anyhow::Result<()> {
        let name = format!("{}_{step}.json", tag.replace('/', "_"));
        std::fs::write(self.figure_dir.join(name), figure.to_json()?)?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub scalars: Vec<(String, f64, usize)>,
    pub figures: Vec<(String, usize)>,
}

impl MemorySink {
    /// Steps at which `tag` was recorded, in emission order.
    pub fn steps_for(&self, tag: &str) -> Vec<usize> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|&(_, _, step)| step)
            .collect()
    }

    pub fn value_at(&self, tag: &str, step: usize) -> Option<f64> {
        self.scalars
            .iter()
            .find(|(t, _, s)| t == tag && *s == step)
            .map(|&(_, v, _)| v)
    }
}

impl MetricsSink for MemorySink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.scalars.push((tag.to_string(), value, step));
        Ok(())
    }

    fn figure(&mut self, tag: &str, _figure: &Figure, step: usize) -> anyhow::Result<()> {
        self.figures.push((tag.to_string(), step));
        Ok(())
    }
}

// ── Fan-out ─────────────────────────────────────────────────────────────────

/// Forwards to every inner sink; reports the first error after trying all.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    fn each(
        &mut self,
        mut f: impl FnMut(&mut dyn MetricsSink) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = f(sink.as_mut()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl MetricsSink for FanoutSink {
    fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.each(|s| s.scalar(tag, value, step))
    }

    fn figure(&mut self, tag: &str, figure: &Figure, step: usize) -> anyhow::Result<()> {
        self.each(|s| s.figure(tag, figure, step))
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.each(|s| s.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl MetricsSink for Broken {
        fn scalar(&mut self, _: &str, _: f64, _: usize) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn figure(&mut self, _: &str, _: &Figure, _: usize) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn csv_sink_writes_rows_and_figures() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path()).unwrap();
        sink.scalar(tags::TRAIN_TOTAL, 1.5, 3).unwrap();
        let fig = Figure {
            title: "probvec".into(),
            rows: 1,
            cols: 2,
            values: vec![0.25, 0.75],
        };
        sink.figure("1/probvec", &fig, 3).unwrap();
        sink.flush().unwrap();

        let csv = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(csv, "step,tag,value\n3,Loss/train/total,1.5\n");
        assert!(dir.path().join("figures").join("1_probvec_3.json").exists());
    }

    #[test]
    fn fanout_keeps_going_after_a_failure() {
        use std::cell::Cell;
        use std::rc::Rc;

        struct Counting(Rc<Cell<usize>>);
        impl MetricsSink for Counting {
            fn scalar(&mut self, _: &str, _: f64, _: usize) -> anyhow::Result<()> {
                self.0.set(self.0.get() + 1);
                Ok(())
            }
            fn figure(&mut self, _: &str, _: &Figure, _: usize) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let seen = Rc::new(Cell::new(0));
        let sinks: Vec<Box<dyn MetricsSink>> =
            vec![Box::new(Broken), Box::new(Counting(seen.clone()))];
        let mut fanout = FanoutSink::new(sinks);
        assert!(fanout.scalar("x", 1.0, 0).is_err());
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn memory_sink_lookup() {
        let mut memory = MemorySink::default();
        memory.scalar("x", 2.0, 4).unwrap();
        memory.scalar("y", 3.0, 4).unwrap();
        assert_eq!(memory.steps_for("x"), vec![4]);
        assert_eq!(memory.value_at("y", 4), Some(3.0));
        assert_eq!(memory.value_at("y", 5), None);
    }
}
