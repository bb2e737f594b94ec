//! `nvidia-smi` backed device adapter.
//!
//! Every call shells out to the CLI, so this adapter works wherever the
//! driver tools are installed and fails cleanly (as [`DeviceError`]) where
//! they are not.

use std::process::Command;

use crate::device::{AccountingEntry, DeviceAdapter, DeviceError, DeviceHandle, DeviceMode, ModeStatus};

/// Device adapter driving the `nvidia-smi` CLI.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl NvidiaSmi {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn query(&self, args: &[&str]) -> Result<String, DeviceError> {
        tracing::trace!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| DeviceError::Unavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            // nvidia-smi reports most failures on stdout
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout)
            } else {
                stderr
            };
            return Err(DeviceError::Command(format!(
                "{} {}: {}",
                self.binary,
                args.join(" "),
                message.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DeviceAdapter for NvidiaSmi {
    fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        let out = self.query(&["--query-gpu=index,name", "--format=csv,noheader"])?;
        parse_device_list(&out)
    }

    fn mode(&self, device: &DeviceHandle, mode: DeviceMode) -> Result<ModeStatus, DeviceError> {
        let index = device.index.to_string();
        match mode {
            DeviceMode::Ecc | DeviceMode::Persistence => {
                let field = if mode == DeviceMode::Ecc {
                    "--query-gpu=ecc.mode.current"
                } else {
                    "--query-gpu=persistence_mode"
                };
                let out = self.query(&["-i", &index, field, "--format=csv,noheader"])?;
                Ok(ModeStatus::parse(out.lines().next().unwrap_or_default()))
            }
            DeviceMode::AutoBoost => {
                let out = self.query(&["-i", &index, "-q", "-d", "CLOCK"])?;
                Ok(find_report_value(&out, "Auto Boost").map_or(ModeStatus::Unsupported, ModeStatus::parse))
            }
        }
    }

    fn set_mode(
        &self,
        device: &DeviceHandle,
        mode: DeviceMode,
        enabled: bool,
    ) -> Result<(), DeviceError> {
        let index = device.index.to_string();
        let value = if enabled { "1" } else { "0" };
        match mode {
            DeviceMode::Ecc => self.query(&["-i", &index, "-e", value])?,
            DeviceMode::Persistence => self.query(&["-i", &index, "-pm", value])?,
            DeviceMode::AutoBoost => {
                let flag = format!("--auto-boost-default={value}");
                self.query(&["-i", &index, &flag])?
            }
        };
        Ok(())
    }

    fn sample(&self) -> Result<AccountingEntry, DeviceError> {
        let out = self.query(&[
            "--query-gpu=utilization.gpu,utilization.memory,memory.used",
            "--format=csv,noheader,nounits",
        ])?;
        parse_sample(&out, chrono::Utc::now().timestamp_millis())
    }
}

/// Parse `index, name` lines.
fn parse_device_list(out: &str) -> Result<Vec<DeviceHandle>, DeviceError> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (index, name) = line
                .split_once(',')
                .ok_or_else(|| DeviceError::Parse(line.to_string()))?;
            Ok(DeviceHandle {
                index: index
                    .trim()
                    .parse()
                    .map_err(|_| DeviceError::Parse(line.to_string()))?,
                name: name.trim().to_string(),
            })
        })
        .collect()
}

/// Find `key : value` in the indented `nvidia-smi -q` report.
fn find_report_value<'a>(report: &'a str, key: &str) -> Option<&'a str> {
    report.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then_some(v.trim())
    })
}

/// Fold per-device utilization lines into one host-wide sample: mean
/// utilization, peak memory.
fn parse_sample(out: &str, timestamp_ms: i64) -> Result<AccountingEntry, DeviceError> {
    let mut rows = Vec::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let values: Vec<f64> = line
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| DeviceError::Parse(line.to_string()))?;
        let [gpu, mem, used] = values[..] else {
            return Err(DeviceError::Parse(line.to_string()));
        };
        rows.push((gpu, mem, used));
    }

    if rows.is_empty() {
        return Err(DeviceError::Parse("no devices in sample".to_string()));
    }

    let count = rows.len() as f64;
    Ok(AccountingEntry {
        timestamp_ms,
        gpu_util: rows.iter().map(|r| r.0).sum::<f64>() / count,
        mem_util: rows.iter().map(|r| r.1).sum::<f64>() / count,
        max_memory_usage: rows.iter().map(|r| r.2).fold(0.0, f64::max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let devices = parse_device_list("0, Tesla P100-PCIE-16GB\n1, Tesla P100-PCIE-16GB\n").unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
        assert_eq!(devices[1].name, "Tesla P100-PCIE-16GB");
    }

    #[test]
    fn test_parse_device_list_rejects_garbage() {
        assert!(parse_device_list("no devices found").is_err());
    }

    #[test]
    fn test_find_report_value() {
        let report = "==============NVSMI LOG==============\n\
                      GPU 00000000:04:00.0\n    Clocks\n        Graphics : 405 MHz\n\
                      \x20       Auto Boost : Off\n";
        assert_eq!(find_report_value(report, "Auto Boost"), Some("Off"));
        assert_eq!(find_report_value(report, "Missing"), None);
    }

    #[test]
    fn test_parse_sample_aggregates_devices() {
        let entry = parse_sample("80, 30, 4000\n60, 10, 9000\n", 42).unwrap();
        assert_eq!(entry.timestamp_ms, 42);
        assert_eq!(entry.gpu_util, 70.0);
        assert_eq!(entry.mem_util, 20.0);
        assert_eq!(entry.max_memory_usage, 9000.0);
    }

    #[test]
    fn test_parse_sample_not_supported() {
        assert!(parse_sample("[N/A], [N/A], 100\n", 0).is_err());
        assert!(parse_sample("", 0).is_err());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let smi = NvidiaSmi::new("/nonexistent/nvidia-smi");
        assert!(matches!(smi.list_devices(), Err(DeviceError::Unavailable(_))));
    }
}
