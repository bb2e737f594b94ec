//! Maps a matrix entry onto the adapter scripts that run it.
//!
//! Layout under the frameworks root:
//!
//! ```text
//! <framework>/<network_type>/<network>/t.sh                      single device
//! <framework>/<network_type>/<network>/<network>_bm.py
//! <framework>/<network_type>/<network>/tm.sh                     multi device
//! <framework>/<network_type>/<network>/<network>_multigpu_bm.py
//! <framework>/<network_type>/<network>/synthetic/t.sh            synthetic data
//! <framework>/<network_type>/<network>/synthetic/<network>_synthetic.py
//! <framework>/<network_type>/<network>/eval.sh                   evaluation
//! <framework>/<network_type>/<network>/<network>_eval.py
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Whether a run targets one device or several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Single,
    Multi,
}

/// Whether a run trains on a real dataset or generated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    Real,
    Synthetic,
}

/// Argument shape a wrapper script expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgConvention {
    pub topology: Topology,
    pub data_mode: DataMode,
}

impl ArgConvention {
    /// Synthetic scripts generate their own inputs and take no dataset flags.
    #[must_use]
    pub fn takes_dataset_args(self) -> bool {
        self.data_mode == DataMode::Real
    }
}

/// A resolved wrapper script and the training script it drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedScript {
    /// Directory holding the network's adapter scripts.
    pub tool_dir: PathBuf,
    /// Shell wrapper that is executed.
    pub wrapper: PathBuf,
    /// Training script the wrapper launches (`script_path`).
    pub target: PathBuf,
    pub convention: ArgConvention,
}

/// Evaluation scripts for a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalScript {
    pub wrapper: PathBuf,
    pub target: PathBuf,
}

/// Resolves adapter scripts beneath a frameworks root directory.
#[derive(Debug, Clone)]
pub struct ScriptResolver {
    root: PathBuf,
}

impl ScriptResolver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the script for a (framework, network, topology, data mode) tuple.
    pub fn resolve(
        &self,
        framework: &str,
        network_type: &str,
        network: &str,
        topology: Topology,
        data_mode: DataMode,
    ) -> Result<ResolvedScript, ResolveError> {
        let framework_dir = self.root.join(framework);
        if !framework_dir.is_dir() {
            return Err(ResolveError::FrameworkMissing(framework_dir));
        }

        let tool_dir = framework_dir.join(network_type).join(network);
        if !tool_dir.is_dir() {
            return Err(ResolveError::NetworkMissing(tool_dir));
        }

        let convention = ArgConvention {
            topology,
            data_mode,
        };

        let (wrapper, target) = match (data_mode, topology) {
            (DataMode::Synthetic, _) => {
                let synthetic_dir = tool_dir.join("synthetic");
                if !synthetic_dir.is_dir() {
                    return Err(ResolveError::SyntheticUnavailable(synthetic_dir));
                }
                let target = synthetic_dir.join(format!("{network}_synthetic.py"));
                if !target.is_file() {
                    return Err(ResolveError::SyntheticUnavailable(target));
                }
                (synthetic_dir.join("t.sh"), target)
            }
            (DataMode::Real, Topology::Single) => {
                (tool_dir.join("t.sh"), tool_dir.join(format!("{network}_bm.py")))
            }
            (DataMode::Real, Topology::Multi) => (
                tool_dir.join("tm.sh"),
                tool_dir.join(format!("{network}_multigpu_bm.py")),
            ),
        };

        if !wrapper.is_file() {
            return Err(ResolveError::ScriptMissing(wrapper));
        }

        Ok(ResolvedScript {
            tool_dir,
            wrapper,
            target,
            convention,
        })
    }

    /// Evaluation scripts for a resolved network, if the wrapper exists.
    #[must_use]
    pub fn eval_script(tool_dir: &Path, network: &str) -> Option<EvalScript> {
        let wrapper = tool_dir.join("eval.sh");
        wrapper.is_file().then(|| EvalScript {
            wrapper,
            target: tool_dir.join(format!("{network}_eval.py")),
        })
    }
}

/// Reasons a script could not be resolved. None of these stop the batch.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("framework not found: {0}")]
    FrameworkMissing(PathBuf),
    #[error("network not found: {0}")]
    NetworkMissing(PathBuf),
    #[error("script not found: {0}")]
    ScriptMissing(PathBuf),
    #[error("no synthetic variant: {0}")]
    SyntheticUnavailable(PathBuf),
}
