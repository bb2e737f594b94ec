//! Subprocess execution for benchmark runs.
//!
//! Commands are built as structured [`Invocation`]s (program, argument list,
//! environment) and never pass through a shell. The rendered command line
//! written to logs quotes every token POSIX-style so it can be pasted back
//! into a shell verbatim.

use std::{
    fmt,
    fs::OpenOptions as StdOpenOptions,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    process::{Child, Command},
};

use crate::{
    matrix::TestConfigEntry,
    resolver::{ResolvedScript, Topology},
};

/// Environment variables bounding library thread pools.
pub const THREAD_KNOBS: [&str; 3] = ["OMP_NUM_THREADS", "OPENBLAS_NUM_THREADS", "MKL_NUM_THREADS"];

/// A fully specified child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the harness environment, in insertion order.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a `--key=value` flag.
    #[must_use]
    pub fn flag(self, key: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{key}={value}"))
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.env.push((key.into(), value.to_string()));
        self
    }

    /// Value of an environment variable set on this invocation.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .chain(std::iter::once(shell_quote(&self.program)))
            .chain(self.args.iter().map(|a| shell_quote(a)));
        if let Some(first) = parts.next() {
            write!(f, "{first}")?;
        }
        for part in parts {
            write!(f, " {part}")?;
        }
        Ok(())
    }
}

/// Quote `token` for a POSIX shell. Tokens made only of safe characters are
/// left bare; everything else is single-quoted.
#[must_use]
pub fn shell_quote(token: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./,:=@%+".contains(c);
    if !token.is_empty() && token.chars().all(safe) {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub elapsed: Duration,
    /// The harness killed the process after the run timeout.
    pub timed_out: bool,
}

impl ExitOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }
}

/// Executes invocations, sending stdout and stderr to a log file.
pub trait ProcessRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an `Ok` outcome; `Err` means
    /// the process could not be started or waited on.
    fn run(
        &self,
        invocation: &Invocation,
        log_path: &Path,
    ) -> impl Future<Output = Result<ExitOutcome, RunError>> + Send;
}

/// Runs invocations as tokio child processes.
///
/// Each child leads its own process group, so a timeout kills the wrapper
/// together with everything it launched.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner {
    timeout: Option<Duration>,
}

impl TokioProcessRunner {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation, log_path: &Path) -> Result<ExitOutcome, RunError> {
        let stdout = StdOpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| RunError::Log(log_path.to_path_buf(), e))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| RunError::Log(log_path.to_path_buf(), e))?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::Spawn(invocation.program.clone(), e))?;

        let (status, timed_out) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (status.map_err(RunError::Wait)?, false),
                Err(_) => {
                    tracing::error!(
                        "Run exceeded {}s, killing (PID {:?})",
                        limit.as_secs(),
                        child.id()
                    );
                    kill_process_group(&mut child)?;
                    (child.wait().await.map_err(RunError::Wait)?, true)
                }
            },
            None => (child.wait().await.map_err(RunError::Wait)?, false),
        };

        Ok(ExitOutcome {
            code: status.code(),
            elapsed: started.elapsed(),
            timed_out,
        })
    }
}

/// SIGKILL the group led by `child`, falling back to the child alone.
fn kill_process_group(child: &mut Child) -> Result<(), RunError> {
    // SAFETY: killpg only signals; the group was created by `process_group(0)`.
    if let Some(pid) = child.id()
        && let Ok(pgid) = libc::pid_t::try_from(pid)
        && unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0
    {
        return Ok(());
    }
    child.start_kill().map_err(RunError::Wait)
}

/// Everything needed to build the invocation of one benchmark run.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub entry: &'a TestConfigEntry,
    pub script: &'a ResolvedScript,
    pub epoch_size: usize,
    /// Cores granted by the CPU quota; also sizes library thread pools.
    pub cores: usize,
    pub train_dir: &'a Path,
    pub log_path: &'a Path,
}

/// Builds benchmark invocations and runs them through a [`ProcessRunner`].
#[derive(Debug, Clone)]
pub struct RunExecutor {
    shell: String,
}

impl RunExecutor {
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Environment for a run: device visibility, thread pools, and the knobs
    /// read by the wrapper scripts.
    #[must_use]
    pub fn build_environment(request: &RunRequest<'_>) -> Vec<(String, String)> {
        let entry = request.entry;
        let selector = entry.device_selector();
        let mut env = vec![("CUDA_VISIBLE_DEVICES".to_string(), selector.clone())];
        env.extend(
            THREAD_KNOBS
                .iter()
                .map(|knob| ((*knob).to_string(), request.cores.to_string())),
        );
        env.extend([
            ("deviceId".to_string(), selector),
            ("batch_size".to_string(), entry.batch_size.to_string()),
            ("epochs".to_string(), entry.number_of_epochs.to_string()),
            ("epoch_size".to_string(), request.epoch_size.to_string()),
            ("learning_rate".to_string(), entry.learning_rate.to_string()),
            ("train_dir".to_string(), request.train_dir.display().to_string()),
            ("logFile".to_string(), request.log_path.display().to_string()),
            (
                "script_path".to_string(),
                request.script.target.display().to_string(),
            ),
        ]);
        if request.script.convention.topology == Topology::Multi {
            env.push(("gpu_count".to_string(), entry.device_count.to_string()));
        }
        env
    }

    /// Append flag arguments in the convention the resolved script expects.
    #[must_use]
    pub fn with_arguments(invocation: Invocation, request: &RunRequest<'_>) -> Invocation {
        let entry = request.entry;
        let convention = request.script.convention;
        let selector = entry.device_selector();

        let invocation = invocation
            .flag("batch_size", entry.batch_size)
            .flag("epochs", entry.number_of_epochs)
            .flag("epoch_size", request.epoch_size)
            .flag("learning_rate", entry.learning_rate);
        match convention.topology {
            Topology::Multi => invocation
                .flag("gpu_count", entry.device_count)
                .flag("device_ids", selector),
            Topology::Single => {
                let invocation = invocation.flag("device_id", selector).flag("xla", "True");
                if convention.takes_dataset_args() {
                    invocation.flag("use_datasets", "True")
                } else {
                    invocation
                }
            }
        }
    }

    #[must_use]
    pub fn build_invocation(&self, request: &RunRequest<'_>) -> Invocation {
        let wrapper = Invocation::new(&self.shell).arg(request.script.wrapper.display().to_string());
        let mut invocation = Self::with_arguments(wrapper, request);
        invocation.env = Self::build_environment(request);
        invocation
    }

    /// Run `invocation`, then append the wall-clock time and the command line
    /// to the log whatever the outcome.
    pub async fn execute<P: ProcessRunner + ?Sized>(
        &self,
        runner: &P,
        invocation: &Invocation,
        log_path: &Path,
    ) -> Result<ExitOutcome, RunError> {
        tracing::debug!("Executing: {invocation}");
        let started = Instant::now();
        let result = runner.run(invocation, log_path).await;
        let elapsed = result
            .as_ref()
            .map_or_else(|_| started.elapsed(), |outcome| outcome.elapsed);

        if let Err(e) = append_run_summary(log_path, elapsed, invocation).await {
            tracing::warn!("Failed to append run summary to {}: {e}", log_path.display());
        }

        match &result {
            Ok(outcome) if outcome.success() => {
                tracing::debug!("Executing success ({:.1}s)", elapsed.as_secs_f64());
            }
            Ok(outcome) => tracing::error!(
                "Executing failed: exit {:?}{}: {invocation}",
                outcome.code,
                if outcome.timed_out { " (timed out)" } else { "" }
            ),
            Err(e) => tracing::error!("Executing failed: {e}"),
        }
        result
    }
}

async fn append_run_summary(
    log_path: &Path,
    elapsed: Duration,
    invocation: &Invocation,
) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    file.write_all(
        format!(
            "\nTotal time: {}\ncmd: {invocation}\n",
            elapsed.as_secs_f64()
        )
        .as_bytes(),
    )
    .await?;
    file.flush().await
}

/// Errors that can occur when running a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to open log {0}: {1}")]
    Log(PathBuf, std::io::Error),
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed waiting on child: {0}")]
    Wait(std::io::Error),
}
