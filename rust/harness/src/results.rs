//! Aggregate result file.
//!
//! One header row, then one row per attempt appended in matrix order. Rows
//! are never rewritten.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::Serialize;

use crate::{
    extract::{Metric, UtilizationSeries},
    matrix::TestConfigEntry,
};

/// Column order of the result file.
pub const RESULT_FIELDS: [&str; 16] = [
    "framework",
    "network_type",
    "network_name",
    "device_id",
    "device_count",
    "cpu_count",
    "batch_size",
    "number_of_epochs",
    "epoch_size",
    "learning_rate",
    "synthetic",
    "training_speed",
    "accuracy",
    "gpu_utilization",
    "mem_utilization",
    "max_memory_usage",
];

/// One result row: the configuration echoed back plus its metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResultEntry {
    pub framework: String,
    pub network_type: String,
    pub network_name: String,
    /// Device ids joined by `;`.
    pub device_id: String,
    pub device_count: usize,
    /// Cores actually granted to the run.
    pub cpu_count: usize,
    pub batch_size: usize,
    pub number_of_epochs: usize,
    pub epoch_size: usize,
    pub learning_rate: f64,
    pub synthetic: bool,
    /// Average time per batch, per device.
    pub training_speed: Metric,
    pub accuracy: Metric,
    pub gpu_utilization: String,
    pub mem_utilization: String,
    pub max_memory_usage: String,
}

impl TestResultEntry {
    /// Row with failure sentinels: no throughput, no accuracy, no samples.
    #[must_use]
    pub fn failed(entry: &TestConfigEntry, epoch_size: usize, cores: usize) -> Self {
        Self {
            framework: entry.framework.clone(),
            network_type: entry.network_type.clone(),
            network_name: entry.network_name.clone(),
            device_id: entry.result_selector(),
            device_count: entry.device_count,
            cpu_count: cores,
            batch_size: entry.batch_size,
            number_of_epochs: entry.number_of_epochs,
            epoch_size,
            learning_rate: entry.learning_rate,
            synthetic: entry.synthetic,
            training_speed: Metric::NotMeasured,
            accuracy: Metric::Error,
            gpu_utilization: String::new(),
            mem_utilization: String::new(),
            max_memory_usage: String::new(),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, training_speed: Metric, accuracy: Metric) -> Self {
        self.training_speed = training_speed;
        self.accuracy = accuracy;
        self
    }

    #[must_use]
    pub fn with_utilization(mut self, series: UtilizationSeries) -> Self {
        self.gpu_utilization = series.gpu_util;
        self.mem_utilization = series.mem_util;
        self.max_memory_usage = series.max_memory_usage;
        self
    }
}

/// Appends result rows to a CSV file.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    path: PathBuf,
}

impl ResultWriter {
    /// Create (or truncate) the result file and write its header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ResultsError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ResultsError::Io(parent.to_path_buf(), e))?;
        }

        let file = File::create(&path).map_err(|e| ResultsError::Io(path.clone(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(RESULT_FIELDS)
            .map_err(|e| ResultsError::Csv(path.clone(), e))?;
        writer
            .flush()
            .map_err(|e| ResultsError::Io(path.clone(), e))?;

        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row under an exclusive lock.
    pub fn append(&self, row: &TestResultEntry) -> Result<(), ResultsError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| ResultsError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| ResultsError::Lock(self.path.clone(), e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&file);
        let written = writer
            .serialize(row)
            .map_err(|e| ResultsError::Csv(self.path.clone(), e))
            .and_then(|()| {
                writer
                    .flush()
                    .map_err(|e| ResultsError::Io(self.path.clone(), e))
            });
        drop(writer);

        file.unlock()
            .map_err(|e| ResultsError::Lock(self.path.clone(), e))?;
        written
    }
}

/// Errors that can occur when writing the result file.
#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    #[error("result file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock result file {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to write result row to {0}: {1}")]
    Csv(PathBuf, csv::Error),
}
