//! Experiment tracking: one JSON object per logged step.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// What gets recorded at every logging interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub epoch: usize,
    pub step: usize,
    pub global_step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Estimated minutes left in the current epoch.
    pub epoch_time_min: f64,
}

/// Sink for [`MetricRecord`]s.
pub trait MetricsTracker {
    fn log(&mut self, record: &MetricRecord) -> anyhow::Result<()>;
}

/// Run name derived from the headline hyper-parameters.
pub fn run_name(epochs: usize, batch_size: usize, learning_rate: f64) -> String {
    format!("Kokomi-Pretrain-Epoch-{epochs}-BatchSize-{batch_size}-LearningRate-{learning_rate}")
}

/// Appends records to `<save_dir>/<project>/<run_name>.jsonl`.
pub struct JsonlTracker {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlTracker {
    pub fn create(save_dir: &Path, project: &str, run_name: &str) -> anyhow::Result<Self> {
        let dir = save_dir.join(project);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create tracker dir {}", dir.display()))?;
        let path = dir.join(format!("{run_name}.jsonl"));
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open tracker file {}", path.display()))?;
        tracing::info!(path = %path.display(), "metric tracking enabled");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsTracker for JsonlTracker {
    fn log(&mut self, record: &MetricRecord) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory tracker, handy for inspecting what a run logged.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    pub records: Vec<MetricRecord>,
}

impl MetricsTracker for MemoryTracker {
    fn log(&mut self, record: &MetricRecord) -> anyhow::Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}
