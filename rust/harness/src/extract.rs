//! Metric extraction from training logs, evaluation logs, and accounting files.
//!
//! Extraction never fails a run: a missing or unreadable metric becomes a
//! [`Metric`] sentinel and the other metrics of the row are still recorded.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::{
    device::AccountingEntry,
    resolver::{DataMode, ScriptResolver},
    runner::{Invocation, ProcessRunner},
};

/// Network family tag taken from the matrix `network_type` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkFamily {
    /// Fully connected networks.
    Fcn,
    /// Convolutional classifiers.
    Cnn,
    /// Recurrent language models.
    Rnn,
    Other(String),
}

impl NetworkFamily {
    #[must_use]
    pub fn parse(network_type: &str) -> Self {
        match network_type.trim().to_lowercase().as_str() {
            "fc" | "fcn" => Self::Fcn,
            "cnn" => Self::Cnn,
            "rnn" => Self::Rnn,
            _ => Self::Other(network_type.trim().to_string()),
        }
    }

    /// How accuracy is obtained for this family.
    #[must_use]
    pub fn strategy(&self) -> AccuracyStrategy {
        match self {
            Self::Fcn => AccuracyStrategy::TrainLog(AccuracyPattern::FinalTestAccuracy),
            Self::Rnn => AccuracyStrategy::TrainLog(AccuracyPattern::Perplexity),
            Self::Cnn => AccuracyStrategy::Evaluation,
            Self::Other(_) => AccuracyStrategy::Unsupported,
        }
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fcn => write!(f, "fc"),
            Self::Cnn => write!(f, "cnn"),
            Self::Rnn => write!(f, "rnn"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyPattern {
    FinalTestAccuracy,
    Perplexity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyStrategy {
    /// Scan the training log.
    TrainLog(AccuracyPattern),
    /// Run the evaluation script against the checkpoint, then scan its log.
    Evaluation,
    Unsupported,
}

/// A recorded metric or the sentinel standing in for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    Value(f64),
    /// Not applicable or not reached, rendered `-`.
    NotMeasured,
    /// Expected but could not be extracted, rendered `err`.
    Error,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::NotMeasured => write!(f, "-"),
            Self::Error => write!(f, "err"),
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Compiled single-capture patterns; see [`crate::config::PatternSettings`].
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub throughput: Regex,
    pub synthetic_throughput: Regex,
    pub fcn_accuracy: Regex,
    pub rnn_perplexity: Regex,
    pub cnn_precision: Regex,
}

impl CompiledPatterns {
    fn accuracy(&self, pattern: AccuracyPattern) -> &Regex {
        match pattern {
            AccuracyPattern::FinalTestAccuracy => &self.fcn_accuracy,
            AccuracyPattern::Perplexity => &self.rnn_perplexity,
        }
    }
}

/// First capture of `pattern` in `content`, parsed as a number.
#[must_use]
pub fn extract_value(pattern: &Regex, content: &str) -> Option<f64> {
    pattern
        .captures(content)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// [`extract_value`] over a file.
pub fn extract_from_file(pattern: &Regex, path: &Path) -> Result<f64, ExtractError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ExtractError::Unreadable(path.to_path_buf(), e))?;
    extract_value(pattern, &content).ok_or_else(|| ExtractError::NotFound {
        pattern: pattern.as_str().to_string(),
        path: path.to_path_buf(),
    })
}

/// Per-device throughput: a multi-device run reports the time of one device.
#[must_use]
pub fn normalize_throughput(raw: f64, device_count: usize) -> f64 {
    raw / device_count.max(1) as f64
}

/// Utilization series folded from an accounting file, `;`-joined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UtilizationSeries {
    pub gpu_util: String,
    pub mem_util: String,
    pub max_memory_usage: String,
}

impl UtilizationSeries {
    fn from_entries<'a>(entries: impl Iterator<Item = &'a AccountingEntry> + Clone) -> Self {
        let join = |f: fn(&AccountingEntry) -> f64| {
            entries
                .clone()
                .map(|e| f(e).to_string())
                .collect::<Vec<_>>()
                .join(";")
        };
        Self {
            gpu_util: join(|e| e.gpu_util),
            mem_util: join(|e| e.mem_util),
            max_memory_usage: join(|e| e.max_memory_usage),
        }
    }
}

/// Read an accounting file, keeping the 1st, 3rd, 5th... sample rows.
///
/// The sampler writes an instantaneous row and a delta row per tick; only
/// the instantaneous rows are kept.
pub fn parse_accounting_log(path: &Path) -> Result<UtilizationSeries, ExtractError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ExtractError::Accounting(path.to_path_buf(), e))?;
    let entries = reader
        .deserialize::<AccountingEntry>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ExtractError::Accounting(path.to_path_buf(), e))?;
    Ok(UtilizationSeries::from_entries(entries.iter().step_by(2)))
}

/// Inputs for obtaining a run's accuracy.
#[derive(Debug, Clone, Copy)]
pub struct AccuracyInputs<'a> {
    pub network: &'a str,
    pub family: &'a NetworkFamily,
    pub data_mode: DataMode,
    pub batch_size: usize,
    pub tool_dir: &'a Path,
    /// Training checkpoint directory.
    pub train_dir: &'a Path,
    pub train_log: &'a Path,
    pub eval_log: &'a Path,
    /// Scratch directory of the evaluation sub-run; removed afterwards.
    pub eval_dir: &'a Path,
}

/// Pulls throughput and accuracy out of a finished run.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    patterns: CompiledPatterns,
    shell: String,
}

impl MetricExtractor {
    #[must_use]
    pub fn new(patterns: CompiledPatterns, shell: impl Into<String>) -> Self {
        Self {
            patterns,
            shell: shell.into(),
        }
    }

    /// Average time per batch, normalized per device.
    #[must_use]
    pub fn throughput(&self, train_log: &Path, data_mode: DataMode, device_count: usize) -> Metric {
        let pattern = match data_mode {
            DataMode::Real => &self.patterns.throughput,
            DataMode::Synthetic => &self.patterns.synthetic_throughput,
        };
        match extract_from_file(pattern, train_log) {
            Ok(raw) => Metric::Value(normalize_throughput(raw, device_count)),
            Err(e) => {
                tracing::error!("Could not find throughput: {e}");
                Metric::Error
            }
        }
    }

    /// Accuracy per the family's strategy. Synthetic runs are not evaluated.
    pub async fn accuracy<P: ProcessRunner + ?Sized>(
        &self,
        runner: &P,
        inputs: &AccuracyInputs<'_>,
    ) -> Metric {
        if inputs.data_mode == DataMode::Synthetic {
            return Metric::NotMeasured;
        }

        match inputs.family.strategy() {
            AccuracyStrategy::TrainLog(pattern) => {
                self.scan(self.patterns.accuracy(pattern), inputs.train_log)
            }
            AccuracyStrategy::Evaluation => self.evaluate(runner, inputs).await,
            AccuracyStrategy::Unsupported => {
                tracing::warn!("No accuracy evaluation for network type {}", inputs.family);
                Metric::Error
            }
        }
    }

    fn scan(&self, pattern: &Regex, path: &Path) -> Metric {
        match extract_from_file(pattern, path) {
            Ok(v) => Metric::Value(v),
            Err(e) => {
                tracing::error!("Could not find accuracy: {e}");
                Metric::Error
            }
        }
    }

    /// Run the evaluation script and scan its log. The scratch directory is
    /// removed before returning whatever the script did.
    async fn evaluate<P: ProcessRunner + ?Sized>(
        &self,
        runner: &P,
        inputs: &AccuracyInputs<'_>,
    ) -> Metric {
        let Some(script) = ScriptResolver::eval_script(inputs.tool_dir, inputs.network) else {
            tracing::warn!(
                "Script for evaluation not found: {}",
                inputs.tool_dir.join("eval.sh").display()
            );
            return Metric::Error;
        };

        remove_scratch(inputs.eval_dir).await;

        let invocation = Invocation::new(&self.shell)
            .arg(script.wrapper.display().to_string())
            .env("batch_size", inputs.batch_size)
            .env("checkpoint_dir", inputs.train_dir.display())
            .env("train_log", inputs.train_log.display())
            .env("eval_log", inputs.eval_log.display())
            .env("eval_dir", inputs.eval_dir.display())
            .env("script_path", script.target.display())
            .env("logFile", inputs.eval_log.display());

        tracing::debug!("Begin evaluation: {invocation}");
        match runner.run(&invocation, inputs.eval_log).await {
            Ok(outcome) if outcome.success() => tracing::debug!("Evaluation success"),
            Ok(outcome) => tracing::error!("Evaluation failed: exit {:?}", outcome.code),
            Err(e) => tracing::error!("Evaluation failed: {e}"),
        }

        remove_scratch(inputs.eval_dir).await;
        self.scan(&self.patterns.cnn_precision, inputs.eval_log)
    }
}

async fn remove_scratch(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", dir.display()),
    }
}

/// Reasons a metric could not be extracted.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("cannot read {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("pattern {pattern:?} not found in {path}")]
    NotFound { pattern: String, path: PathBuf },
    #[error("cannot read accounting file {0}: {1}")]
    Accounting(PathBuf, csv::Error),
}
