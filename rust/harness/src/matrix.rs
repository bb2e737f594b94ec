//! Test matrix parsing.
//!
//! The matrix is a CSV file with one benchmark configuration per row. Rows
//! are parsed eagerly so a malformed row aborts the batch before any run
//! touches the devices.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    extract::NetworkFamily,
    resolver::{DataMode, Topology},
};

/// Column order of the matrix header.
pub const MATRIX_FIELDS: [&str; 12] = [
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
    "enabled",
];

/// One row of the test matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfigEntry {
    pub framework: String,
    pub network_type: String,
    pub network_name: String,
    /// `-1` for CPU-only, otherwise device ids joined by `,` or `;`.
    pub device_id: String,
    pub device_count: usize,
    /// Logical cores for the run; 0 means every core on the host.
    pub cpu_count: usize,
    pub batch_size: usize,
    pub number_of_epochs: usize,
    /// Empty falls back to the per-network default.
    pub epoch_size: Option<usize>,
    pub learning_rate: f64,
    #[serde(deserialize_with = "flexible_bool")]
    pub synthetic: bool,
    #[serde(deserialize_with = "flexible_bool")]
    pub enabled: bool,
}

impl TestConfigEntry {
    /// Whether the run targets the CPU only.
    #[must_use]
    pub fn is_cpu_only(&self) -> bool {
        self.device_id.contains("-1")
    }

    /// Ordered device ids, accepting `;` and `,` as separators.
    #[must_use]
    pub fn device_ids(&self) -> Vec<&str> {
        self.device_id
            .split([';', ','])
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Device selector as passed to child processes (`0,1,2`).
    #[must_use]
    pub fn device_selector(&self) -> String {
        self.device_ids().join(",")
    }

    /// Device selector as stored in the result file (`0;1;2`).
    #[must_use]
    pub fn result_selector(&self) -> String {
        self.device_ids().join(";")
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        if self.device_count > 1 {
            Topology::Multi
        } else {
            Topology::Single
        }
    }

    #[must_use]
    pub fn data_mode(&self) -> DataMode {
        if self.synthetic {
            DataMode::Synthetic
        } else {
            DataMode::Real
        }
    }

    #[must_use]
    pub fn family(&self) -> NetworkFamily {
        NetworkFamily::parse(&self.network_type)
    }

    /// Device count used for normalization; never zero.
    #[must_use]
    pub fn effective_device_count(&self) -> usize {
        self.device_count.max(1)
    }

    /// Directory name that groups every attempt of the same configuration.
    #[must_use]
    pub fn config_dir_name(&self, epoch_size: usize) -> String {
        [
            self.device_id.clone(),
            self.device_count.to_string(),
            self.batch_size.to_string(),
            self.number_of_epochs.to_string(),
            epoch_size.to_string(),
            self.learning_rate.to_string(),
            self.synthetic.to_string(),
        ]
        .join("--")
        .replace([' ', '/'], "_")
    }

    /// Short label for logs and progress output.
    #[must_use]
    pub fn label(&self) -> String {
        let target = if self.is_cpu_only() { "cpu" } else { "gpu" };
        format!(
            "{}/{}/{} {}x{} b{}",
            self.framework,
            self.network_type,
            self.network_name,
            target,
            self.device_count,
            self.batch_size
        )
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected a boolean, got {other:?}"
        ))),
    }
}

/// Load every row of a test matrix, enabled or not, in file order.
pub fn load_matrix(path: impl AsRef<Path>) -> Result<Vec<TestConfigEntry>, MatrixError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| MatrixError::Io(path.display().to_string(), e))?;
    parse_matrix(&content)
}

/// Parse matrix content; the first line must be the header.
pub fn parse_matrix(content: &str) -> Result<Vec<TestConfigEntry>, MatrixError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| MatrixError::Malformed {
            line: 1,
            message: e.to_string(),
        })?
        .clone();
    if let Some(missing) = MATRIX_FIELDS
        .iter()
        .find(|field| !headers.iter().any(|h| h == **field))
    {
        return Err(MatrixError::Malformed {
            line: 1,
            message: format!("missing column {missing}"),
        });
    }

    reader
        .deserialize()
        .map(|row| {
            row.map_err(|e| MatrixError::Malformed {
                line: e.position().map_or(0, csv::Position::line),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Write a small example matrix.
pub fn write_sample_matrix(path: impl AsRef<Path>) -> Result<(), MatrixError> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| MatrixError::Write(path.display().to_string(), e))?;
    for entry in sample_entries() {
        writer
            .serialize(entry)
            .map_err(|e| MatrixError::Write(path.display().to_string(), e))?;
    }
    writer
        .flush()
        .map_err(|e| MatrixError::Io(path.display().to_string(), e))?;
    Ok(())
}

fn sample_entries() -> [TestConfigEntry; 2] {
    [
        TestConfigEntry {
            framework: "tensorflow".into(),
            network_type: "fc".into(),
            network_name: "fcn5".into(),
            device_id: "0".into(),
            device_count: 1,
            cpu_count: 0,
            batch_size: 4096,
            number_of_epochs: 2,
            epoch_size: Some(60000),
            learning_rate: 0.05,
            synthetic: true,
            enabled: true,
        },
        TestConfigEntry {
            framework: "tensorflow".into(),
            network_type: "cnn".into(),
            network_name: "alexnet".into(),
            device_id: "0".into(),
            device_count: 1,
            cpu_count: 0,
            batch_size: 1024,
            number_of_epochs: 2,
            epoch_size: Some(50000),
            learning_rate: 0.01,
            synthetic: false,
            enabled: true,
        },
    ]
}

/// Errors that can occur when reading or writing a test matrix.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("failed to read test matrix {0}: {1}")]
    Io(String, std::io::Error),
    #[error("malformed test matrix at line {line}: {message}")]
    Malformed { line: u64, message: String },
    #[error("failed to write test matrix {0}: {1}")]
    Write(String, csv::Error),
}
