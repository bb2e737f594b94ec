//! Harness settings.
//!
//! Settings live in an optional TOML file. Every field has a default so the
//! harness runs without one.

use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::extract::CompiledPatterns;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    /// Default epoch size per network name, used when a matrix row leaves it empty.
    #[serde(default = "default_epoch_sizes")]
    pub epoch_sizes: BTreeMap<String, usize>,
    #[serde(default)]
    pub patterns: PatternSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            harness: HarnessSettings::default(),
            epoch_sizes: default_epoch_sizes(),
            patterns: PatternSettings::default(),
        }
    }
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Root directory holding `<framework>/<network_type>/<network>/` adapters.
    #[serde(default = "default_frameworks_dir")]
    pub frameworks_dir: PathBuf,
    /// Interpreter used for wrapper scripts.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Accounting sampler cadence in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    /// Kill a run that is still going after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    /// Script run once before the batch to dump host details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info_script: Option<PathBuf>,
    /// Keep training directories after successful runs.
    #[serde(default)]
    pub keep_train_dir: bool,
    /// Epoch size used when neither the row nor `epoch_sizes` provide one.
    #[serde(default = "default_epoch_size")]
    pub default_epoch_size: usize,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            frameworks_dir: default_frameworks_dir(),
            shell: default_shell(),
            sample_interval_ms: default_sample_interval(),
            run_timeout_secs: None,
            system_info_script: None,
            keep_train_dir: false,
            default_epoch_size: default_epoch_size(),
        }
    }
}

impl HarnessSettings {
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Regexes used to pull metrics out of training and evaluation logs.
///
/// Each pattern must contain exactly one capture group holding the number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSettings {
    #[serde(default = "default_throughput_pattern")]
    pub throughput: String,
    #[serde(default = "default_synthetic_throughput_pattern")]
    pub synthetic_throughput: String,
    #[serde(default = "default_fcn_accuracy_pattern")]
    pub fcn_accuracy: String,
    #[serde(default = "default_rnn_perplexity_pattern")]
    pub rnn_perplexity: String,
    #[serde(default = "default_cnn_precision_pattern")]
    pub cnn_precision: String,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            throughput: default_throughput_pattern(),
            synthetic_throughput: default_synthetic_throughput_pattern(),
            fcn_accuracy: default_fcn_accuracy_pattern(),
            rnn_perplexity: default_rnn_perplexity_pattern(),
            cnn_precision: default_cnn_precision_pattern(),
        }
    }
}

fn default_frameworks_dir() -> PathBuf {
    PathBuf::from("./frameworks")
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_sample_interval() -> u64 {
    500
}

fn default_epoch_size() -> usize {
    50000
}

fn default_epoch_sizes() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("alexnet".to_string(), 50000),
        ("resnet".to_string(), 50000),
        ("fcn5".to_string(), 60000),
    ])
}

fn default_throughput_pattern() -> String {
    r"Average Batch Time: (\d+(?:\.\d+)?)".to_string()
}

fn default_synthetic_throughput_pattern() -> String {
    r"Average Synthetic Batch Time: (\d+(?:\.\d+)?)".to_string()
}

fn default_fcn_accuracy_pattern() -> String {
    r"Final test accuracy (\d+\.\d+)".to_string()
}

fn default_rnn_perplexity_pattern() -> String {
    r"Test Perplexity: (\d+\.\d+)".to_string()
}

fn default_cnn_precision_pattern() -> String {
    r"precision @ 1 = (\d+\.\d+)".to_string()
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.patterns.compile()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Epoch size for a network when the matrix row leaves it empty.
    #[must_use]
    pub fn epoch_size_for(&self, network: &str) -> usize {
        if let Some(size) = self.epoch_sizes.get(network) {
            return *size;
        }
        tracing::warn!(
            "No epoch size configured for {network}, using default {}",
            self.harness.default_epoch_size
        );
        self.harness.default_epoch_size
    }
}

impl PatternSettings {
    /// Compile every pattern, checking that each has exactly one capture group.
    pub fn compile(&self) -> Result<CompiledPatterns, ConfigError> {
        let compile = |name: &str, pattern: &str| -> Result<regex::Regex, ConfigError> {
            let regex = regex::Regex::new(pattern)
                .map_err(|e| ConfigError::Pattern(name.to_string(), e.to_string()))?;
            if regex.captures_len() != 2 {
                return Err(ConfigError::Pattern(
                    name.to_string(),
                    "expected exactly one capture group".to_string(),
                ));
            }
            Ok(regex)
        };

        Ok(CompiledPatterns {
            throughput: compile("throughput", &self.throughput)?,
            synthetic_throughput: compile("synthetic_throughput", &self.synthetic_throughput)?,
            fcn_accuracy: compile("fcn_accuracy", &self.fcn_accuracy)?,
            rnn_perplexity: compile("rnn_perplexity", &self.rnn_perplexity)?,
            cnn_precision: compile("cnn_precision", &self.cnn_precision)?,
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid pattern {0}: {1}")]
    Pattern(String, String),
}
