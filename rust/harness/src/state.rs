//! Per-attempt state.
//!
//! Every attempt gets its own [`RunContext`] and run directory. When the
//! attempt is recorded, a [`RunManifest`] describing it is written next to
//! its logs as `run.json`.

use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    matrix::TestConfigEntry,
    resolver::ResolvedScript,
    results::TestResultEntry,
    runner::{ExitOutcome, Invocation},
};

/// Lifecycle of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Pending,
    /// Script resolved and device guards held.
    DevicePrepared,
    Executing,
    Extracting,
    /// Row appended to the result file. Terminal.
    Recorded,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::DevicePrepared => "device-prepared",
            Self::Executing => "executing",
            Self::Extracting => "extracting",
            Self::Recorded => "recorded",
        };
        f.write_str(name)
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Framework, network, or script not found.
    ScriptMissing,
    /// Child failed to start, exited non-zero, or timed out.
    ExecutionFailed,
}

impl AttemptOutcome {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

/// A phase change with its wall-clock time.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseChange {
    pub phase: AttemptPhase,
    pub at: String,
}

/// Paths and bookkeeping owned by one attempt.
#[derive(Debug)]
pub struct RunContext {
    /// 1-based position of the attempt in the batch.
    pub attempt: usize,
    pub run_dir: PathBuf,
    /// Training log; child stdout and stderr go here.
    pub log_path: PathBuf,
    pub accounting_path: PathBuf,
    /// Checkpoints of the training run; removed after a successful run.
    pub train_dir: PathBuf,
    pub eval_log: PathBuf,
    pub eval_dir: PathBuf,
    pub epoch_size: usize,
    pub started_at: DateTime<Local>,
    history: Vec<PhaseChange>,
}

impl RunContext {
    /// Create the run directory for an attempt:
    /// `<log_root>/<framework>/<type>/<network>/<config>/<timestamp>-<attempt>`.
    ///
    /// The attempt number keeps repeated entries apart even within the same
    /// second.
    pub fn create(
        log_root: &Path,
        entry: &TestConfigEntry,
        epoch_size: usize,
        attempt: usize,
    ) -> Result<Self, StateError> {
        let started_at = Local::now();
        let run_dir = log_root
            .join(&entry.framework)
            .join(&entry.network_type)
            .join(&entry.network_name)
            .join(entry.config_dir_name(epoch_size))
            .join(format!("{}-{attempt}", started_at.format("%y%m%d-%H%M%S")));
        std::fs::create_dir_all(&run_dir).map_err(|e| StateError::Io(run_dir.clone(), e))?;

        let stamp = started_at.timestamp();
        Ok(Self {
            attempt,
            log_path: run_dir.join("training.log"),
            accounting_path: run_dir.join("gpu-accounting.csv"),
            train_dir: run_dir.join(format!("train-dir-{stamp}")),
            eval_log: run_dir.join("evaluation.log"),
            eval_dir: run_dir.join(format!("eval_dir_{stamp}")),
            run_dir,
            epoch_size,
            started_at,
            history: vec![PhaseChange {
                phase: AttemptPhase::Pending,
                at: format_time(&started_at),
            }],
        })
    }

    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        self.history
            .last()
            .map_or(AttemptPhase::Pending, |change| change.phase)
    }

    /// Move to `next`. Phases only move forward.
    pub fn advance(&mut self, next: AttemptPhase) {
        let current = self.phase();
        if next <= current {
            tracing::warn!("Attempt {}: ignoring phase change {current} -> {next}", self.attempt);
            return;
        }
        tracing::debug!("Attempt {}: {current} -> {next}", self.attempt);
        self.history.push(PhaseChange {
            phase: next,
            at: now_timestamp(),
        });
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("run.json")
    }

    /// Remove the training directory. Missing is fine.
    pub fn remove_train_dir(&self) {
        match std::fs::remove_dir_all(&self.train_dir) {
            Ok(()) => tracing::debug!("Removed {}", self.train_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {e}", self.train_dir.display()),
        }
    }

    /// Snapshot of the attempt for `run.json`.
    #[must_use]
    pub fn manifest(&self, entry: &TestConfigEntry, record: AttemptRecord) -> RunManifest {
        RunManifest {
            attempt: self.attempt,
            entry: entry.clone(),
            run_dir: self.run_dir.clone(),
            started_at: format_time(&self.started_at),
            finished_at: now_timestamp(),
            phases: self.history.clone(),
            outcome: record.outcome,
            wrapper: record.script.map(|s| s.wrapper),
            invocation: record.invocation,
            exit: record.exit,
            result: record.result,
        }
    }
}

/// What happened during an attempt, gathered by the orchestrator.
#[derive(Debug)]
pub struct AttemptRecord {
    pub outcome: AttemptOutcome,
    pub script: Option<ResolvedScript>,
    pub invocation: Option<Invocation>,
    pub exit: Option<ExitOutcome>,
    pub result: TestResultEntry,
}

/// Contents of `run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub attempt: usize,
    pub entry: TestConfigEntry,
    pub run_dir: PathBuf,
    pub started_at: String,
    pub finished_at: String,
    pub phases: Vec<PhaseChange>,
    pub outcome: AttemptOutcome,
    pub wrapper: Option<PathBuf>,
    pub invocation: Option<Invocation>,
    pub exit: Option<ExitOutcome>,
    pub result: TestResultEntry,
}

impl RunManifest {
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let file = File::create(path).map_err(|e| StateError::Io(path.to_path_buf(), e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| StateError::Write(path.to_path_buf(), e.to_string()))?;
        writer
            .flush()
            .map_err(|e| StateError::Io(path.to_path_buf(), e))
    }
}

fn format_time(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Current local time, formatted for logs and manifests.
#[must_use]
pub fn now_timestamp() -> String {
    format_time(&Local::now())
}

/// Errors that can occur with attempt bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to write manifest {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{extract::Metric, matrix::parse_matrix};

    fn entry() -> TestConfigEntry {
        parse_matrix(
            "framework,network_type,network_name,device_id,device_count,cpu_count,batch_size,number_of_epochs,epoch_size,learning_rate,synthetic,enabled\n\
             tensorflow,fc,fcn5,0,1,0,4096,2,60000,0.05,False,True",
        )
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_run_dir_layout() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::create(dir.path(), &entry(), 60000, 3).unwrap();

        let rel = ctx.run_dir.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().to_string()).collect();
        assert_eq!(parts[..3], ["tensorflow", "fc", "fcn5"]);
        assert_eq!(parts[3], "0--1--4096--2--60000--0.05--false");
        assert!(parts[4].ends_with("-3"));
        assert!(ctx.run_dir.is_dir());
        assert_eq!(ctx.log_path, ctx.run_dir.join("training.log"));
        assert!(
            ctx.train_dir
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("train-dir-")
        );
    }

    #[test]
    fn test_repeated_entry_distinct_dirs() {
        let dir = tempdir().unwrap();
        let first = RunContext::create(dir.path(), &entry(), 60000, 1).unwrap();
        let second = RunContext::create(dir.path(), &entry(), 60000, 2).unwrap();
        assert_ne!(first.run_dir, second.run_dir);
        assert_eq!(first.run_dir.parent(), second.run_dir.parent());
    }

    #[test]
    fn test_phases_only_move_forward() {
        let dir = tempdir().unwrap();
        let mut ctx = RunContext::create(dir.path(), &entry(), 60000, 1).unwrap();
        assert_eq!(ctx.phase(), AttemptPhase::Pending);

        ctx.advance(AttemptPhase::DevicePrepared);
        ctx.advance(AttemptPhase::Executing);
        ctx.advance(AttemptPhase::DevicePrepared);
        assert_eq!(ctx.phase(), AttemptPhase::Executing);

        // Failures jump straight to Recorded.
        ctx.advance(AttemptPhase::Recorded);
        assert_eq!(ctx.phase(), AttemptPhase::Recorded);
        assert_eq!(ctx.history.len(), 4);
    }

    #[test]
    fn test_manifest_saved() {
        let dir = tempdir().unwrap();
        let entry = entry();
        let mut ctx = RunContext::create(dir.path(), &entry, 60000, 1).unwrap();
        ctx.advance(AttemptPhase::Recorded);

        let manifest = ctx.manifest(
            &entry,
            AttemptRecord {
                outcome: AttemptOutcome::ScriptMissing,
                script: None,
                invocation: None,
                exit: None,
                result: TestResultEntry::failed(&entry, 60000, 8),
            },
        );
        manifest.save(&ctx.manifest_path()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ctx.manifest_path()).unwrap()).unwrap();
        assert_eq!(json["outcome"], "script_missing");
        assert_eq!(json["phases"][1]["phase"], "recorded");
        assert_eq!(json["result"]["training_speed"], "-");
        assert_eq!(json["result"]["accuracy"], Metric::Error.to_string());
    }

    #[test]
    fn test_remove_train_dir_tolerates_missing() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::create(dir.path(), &entry(), 60000, 1).unwrap();
        ctx.remove_train_dir();
        std::fs::create_dir_all(ctx.train_dir.join("checkpoint")).unwrap();
        ctx.remove_train_dir();
        assert!(!ctx.train_dir.exists());
    }
}
