//! Batch orchestration.
//!
//! Attempts run strictly one after another: devices and the CPU quota are
//! host-wide, so two benchmarks never share them. Within an attempt the
//! training process runs alongside the accounting sampler.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    config::{ConfigError, HarnessConfig},
    device::{DeviceAdapter, prepare_devices},
    extract::{AccuracyInputs, Metric, MetricExtractor, parse_accounting_log},
    guard::{CpuQuota, CpuQuotaGuard, resolve_cores},
    matrix::TestConfigEntry,
    resolver::{ResolveError, ResolvedScript, ScriptResolver},
    results::{ResultWriter, ResultsError, TestResultEntry},
    runner::{Invocation, ProcessRunner, RunExecutor, RunRequest},
    state::{AttemptOutcome, AttemptPhase, AttemptRecord, RunContext},
};

/// Where a batch writes its logs and results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPaths {
    pub log_dir: PathBuf,
    pub result_file: PathBuf,
}

impl BatchPaths {
    /// Fill in defaults: a timestamped log directory, and `all_results.csv`
    /// inside it.
    #[must_use]
    pub fn resolve(log_dir: Option<PathBuf>, result_file: Option<PathBuf>) -> Self {
        let log_dir = log_dir.unwrap_or_else(default_log_dir);
        let result_file = result_file.unwrap_or_else(|| log_dir.join("all_results.csv"));
        Self {
            log_dir,
            result_file,
        }
    }
}

/// `GpuBenchmarkLog_<yymmdd-HHMMSS>` in the working directory.
#[must_use]
pub fn default_log_dir() -> PathBuf {
    PathBuf::from(format!(
        "GpuBenchmarkLog_{}",
        chrono::Local::now().format("%y%m%d-%H%M%S")
    ))
}

/// Counts reported at the end of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Enabled entries, each of which produced a result row.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Disabled entries.
    pub skipped: usize,
}

/// What `plan` found for one enabled entry.
#[derive(Debug)]
pub struct PlannedRun {
    pub label: String,
    pub epoch_size: usize,
    pub cores: usize,
    pub script: Result<ResolvedScript, ResolveError>,
}

/// Drives a test matrix through devices, guards, runner, and extractor.
pub struct Orchestrator<D, P, Q> {
    config: HarnessConfig,
    devices: Arc<D>,
    runner: P,
    quota: Q,
    resolver: ScriptResolver,
    executor: RunExecutor,
    extractor: MetricExtractor,
    progress: ProgressBar,
}

impl<D, P, Q> Orchestrator<D, P, Q>
where
    D: DeviceAdapter + 'static,
    P: ProcessRunner,
    Q: CpuQuota,
{
    pub fn new(config: HarnessConfig, devices: Arc<D>, runner: P, quota: Q) -> Result<Self, SchedulerError> {
        let patterns = config.patterns.compile()?;
        let shell = config.harness.shell.clone();
        Ok(Self {
            resolver: ScriptResolver::new(&config.harness.frameworks_dir),
            executor: RunExecutor::new(shell.clone()),
            extractor: MetricExtractor::new(patterns, shell),
            config,
            devices,
            runner,
            quota,
            progress: ProgressBar::hidden(),
        })
    }

    /// Show batch progress on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    fn epoch_size(&self, entry: &TestConfigEntry) -> usize {
        entry
            .epoch_size
            .unwrap_or_else(|| self.config.epoch_size_for(&entry.network_name))
    }

    /// Resolve every enabled entry without running anything.
    pub fn plan(&self, entries: &[TestConfigEntry]) -> Vec<PlannedRun> {
        let host_cores = self.quota.host_cores();
        entries
            .iter()
            .filter(|e| e.enabled)
            .map(|entry| PlannedRun {
                label: entry.label(),
                epoch_size: self.epoch_size(entry),
                cores: resolve_cores(entry.cpu_count, host_cores),
                script: self.resolver.resolve(
                    &entry.framework,
                    &entry.network_type,
                    &entry.network_name,
                    entry.topology(),
                    entry.data_mode(),
                ),
            })
            .collect()
    }

    /// Run every enabled entry in order, appending one result row per entry.
    ///
    /// Only failing to create the log directory or the result file aborts;
    /// per-entry failures become sentinel rows.
    pub async fn run_batch(
        &self,
        entries: &[TestConfigEntry],
        paths: &BatchPaths,
    ) -> Result<BatchSummary, SchedulerError> {
        prepare_log_dir(&paths.log_dir)?;
        let results = ResultWriter::create(&paths.result_file)?;
        tracing::info!("Writing results to {}", results.path().display());

        tracing::info!("Preparing devices");
        prepare_devices(self.devices.as_ref());
        self.collect_system_info(&paths.log_dir).await;

        let enabled: Vec<_> = entries.iter().filter(|e| e.enabled).collect();
        let mut summary = BatchSummary {
            skipped: entries.len() - enabled.len(),
            ..BatchSummary::default()
        };

        self.progress.set_length(enabled.len() as u64);
        self.progress.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {msg:42} [{wide_bar:.cyan/blue}] {pos:>3}/{len:3}",
            )
            .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("#*-")),
        );

        for (index, entry) in enabled.into_iter().enumerate() {
            let attempt = index + 1;
            self.progress.set_message(entry.label());
            tracing::info!("[{attempt}] Begin {}", entry.label());

            let outcome = self.run_attempt(entry, attempt, &paths.log_dir, &results).await;

            summary.attempted += 1;
            if outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            self.progress.inc(1);
        }

        self.progress.finish_with_message(format!(
            "{} succeeded, {} failed",
            summary.succeeded, summary.failed
        ));
        Ok(summary)
    }

    async fn collect_system_info(&self, log_dir: &Path) {
        let Some(script) = &self.config.harness.system_info_script else {
            return;
        };
        let invocation =
            Invocation::new(&self.config.harness.shell).arg(script.display().to_string());
        let log = log_dir.join("system-info.txt");
        match self.runner.run(&invocation, &log).await {
            Ok(outcome) if outcome.success() => {
                tracing::info!("System info written to {}", log.display());
            }
            Ok(outcome) => tracing::warn!("System info script exited {:?}", outcome.code),
            Err(e) => tracing::warn!("System info script failed: {e}"),
        }
    }

    async fn run_attempt(
        &self,
        entry: &TestConfigEntry,
        attempt: usize,
        log_dir: &Path,
        results: &ResultWriter,
    ) -> AttemptOutcome {
        let epoch_size = self.epoch_size(entry);
        let planned_cores = resolve_cores(entry.cpu_count, self.quota.host_cores());
        let failed_row = TestResultEntry::failed(entry, epoch_size, planned_cores);

        let mut ctx = match RunContext::create(log_dir, entry, epoch_size, attempt) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("[{attempt}] Cannot create run directory: {e}");
                record_row(results, &failed_row);
                return AttemptOutcome::ExecutionFailed;
            }
        };

        let script = match self.resolver.resolve(
            &entry.framework,
            &entry.network_type,
            &entry.network_name,
            entry.topology(),
            entry.data_mode(),
        ) {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!("[{attempt}] {e}");
                return self.finish(
                    &mut ctx,
                    entry,
                    results,
                    AttemptRecord {
                        outcome: AttemptOutcome::ScriptMissing,
                        script: None,
                        invocation: None,
                        exit: None,
                        result: failed_row,
                    },
                );
            }
        };

        ctx.advance(AttemptPhase::DevicePrepared);
        let (invocation, cores, exit) = {
            // Declaration order matters: the quota drops before accounting stops.
            let accounting = match self
                .devices
                .clone()
                .begin_accounting(&ctx.accounting_path, self.config.harness.sample_interval())
            {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!("[{attempt}] Accounting unavailable: {e}");
                    None
                }
            };
            let quota = CpuQuotaGuard::open(&self.quota, entry.cpu_count);

            let request = RunRequest {
                entry,
                script: &script,
                epoch_size,
                cores: quota.cores(),
                train_dir: &ctx.train_dir,
                log_path: &ctx.log_path,
            };
            let invocation = self.executor.build_invocation(&request);

            ctx.advance(AttemptPhase::Executing);
            tracing::info!("[{attempt}] Executing {}", script.wrapper.display());
            let exit = self
                .executor
                .execute(&self.runner, &invocation, &ctx.log_path)
                .await;

            let cores = quota.cores();
            drop(quota);
            if let Some(session) = accounting {
                session.close();
            }
            (invocation, cores, exit)
        };

        let mut row = TestResultEntry { cpu_count: cores, ..failed_row };
        let (outcome, exit) = match exit {
            Ok(exit) if exit.success() => {
                ctx.advance(AttemptPhase::Extracting);
                tracing::info!("[{attempt}] Extracting metrics");
                row = self.extract(entry, &script, &ctx, row).await;
                if !self.config.harness.keep_train_dir {
                    ctx.remove_train_dir();
                }
                (AttemptOutcome::Succeeded, Some(exit))
            }
            Ok(exit) => (AttemptOutcome::ExecutionFailed, Some(exit)),
            Err(_) => (AttemptOutcome::ExecutionFailed, None),
        };

        self.finish(
            &mut ctx,
            entry,
            results,
            AttemptRecord {
                outcome,
                script: Some(script),
                invocation: Some(invocation),
                exit,
                result: row,
            },
        )
    }

    async fn extract(
        &self,
        entry: &TestConfigEntry,
        script: &ResolvedScript,
        ctx: &RunContext,
        row: TestResultEntry,
    ) -> TestResultEntry {
        let series = parse_accounting_log(&ctx.accounting_path).unwrap_or_else(|e| {
            tracing::warn!("{e}");
            Default::default()
        });

        let data_mode = entry.data_mode();
        let throughput =
            self.extractor
                .throughput(&ctx.log_path, data_mode, entry.effective_device_count());
        let family = entry.family();
        let accuracy = self
            .extractor
            .accuracy(
                &self.runner,
                &AccuracyInputs {
                    network: &entry.network_name,
                    family: &family,
                    data_mode,
                    batch_size: entry.batch_size,
                    tool_dir: &script.tool_dir,
                    train_dir: &ctx.train_dir,
                    train_log: &ctx.log_path,
                    eval_log: &ctx.eval_log,
                    eval_dir: &ctx.eval_dir,
                },
            )
            .await;

        if throughput == Metric::Error || accuracy == Metric::Error {
            tracing::warn!("Incomplete metrics for {}", entry.label());
        }
        row.with_metrics(throughput, accuracy).with_utilization(series)
    }

    fn finish(
        &self,
        ctx: &mut RunContext,
        entry: &TestConfigEntry,
        results: &ResultWriter,
        record: AttemptRecord,
    ) -> AttemptOutcome {
        let outcome = record.outcome;
        record_row(results, &record.result);
        ctx.advance(AttemptPhase::Recorded);
        tracing::info!(
            "[{}] Recorded {:?}: speed {}, accuracy {}",
            ctx.attempt,
            outcome,
            record.result.training_speed,
            record.result.accuracy
        );

        let manifest = ctx.manifest(entry, record);
        if let Err(e) = manifest.save(&ctx.manifest_path()) {
            tracing::warn!("{e}");
        }
        outcome
    }
}

fn record_row(results: &ResultWriter, row: &TestResultEntry) {
    if let Err(e) = results.append(row) {
        tracing::error!("Failed to record result: {e}");
    }
}

/// Start from an empty log directory.
fn prepare_log_dir(log_dir: &Path) -> Result<(), SchedulerError> {
    if log_dir.exists() {
        tracing::info!("Removing existing log directory {}", log_dir.display());
        std::fs::remove_dir_all(log_dir).map_err(|e| SchedulerError::LogDir(log_dir.to_path_buf(), e))?;
    }
    std::fs::create_dir_all(log_dir).map_err(|e| SchedulerError::LogDir(log_dir.to_path_buf(), e))
}

/// Errors that stop a batch before it starts.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot prepare log directory {0}: {1}")]
    LogDir(PathBuf, std::io::Error),
    #[error("cannot create result file: {0}")]
    Results(#[from] ResultsError),
}
