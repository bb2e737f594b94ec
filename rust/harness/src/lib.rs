#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! Deep-learning benchmark harness
//!
//! Runs a CSV test matrix of training benchmarks one at a time, samples
//! device utilization while each runs, and appends one normalized result
//! row per attempt.

pub mod config;
pub mod device;
pub mod extract;
pub mod guard;
pub mod matrix;
pub mod nvidia;
pub mod resolver;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use config::HarnessConfig;
pub use device::{DeviceAdapter, prepare_devices};
pub use extract::{Metric, MetricExtractor, NetworkFamily};
pub use guard::{AccountingSession, AffinityQuota, CpuQuota, CpuQuotaGuard};
pub use matrix::{TestConfigEntry, load_matrix};
pub use nvidia::NvidiaSmi;
pub use resolver::ScriptResolver;
pub use results::{ResultWriter, TestResultEntry};
pub use runner::{Invocation, ProcessRunner, RunExecutor, TokioProcessRunner};
pub use scheduler::{BatchPaths, BatchSummary, Orchestrator};
pub use state::{AttemptOutcome, AttemptPhase, RunContext};
