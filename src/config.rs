//! Training configuration.
//!
//! Raw settings arrive as [`TrainingOptions`] (strings straight from the CLI
//! plus an optional JSON override file) and are resolved into a validated
//! [`TrainingConfig`] before anything touches the filesystem. Unknown
//! simulation or backend names therefore surface as [`ConfigError`]s before a
//! single directory is created.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env::SimulationCase;
use crate::error::ConfigError;
use crate::execution::SlurmConfig;

/// Default per-trial timeout in seconds; large enough to never trigger.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1_000_000_000_000_000;

// ---------------------------------------------------------------------------
// Execution backend selector
// ---------------------------------------------------------------------------

/// Where simulation trials run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Subprocesses on the current machine.
    Local,
    /// Batch jobs submitted to a Slurm scheduler.
    Slurm,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "slurm" => Ok(Self::Slurm),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Slurm => write!(f, "slurm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent hyperparameters
// ---------------------------------------------------------------------------

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed in terms of the pre-activation `z`.
    pub fn derivative(self, z: f64) -> f64 {
        match self {
            Self::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
        }
    }
}

/// Shape of a fully connected network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Number of hidden layers.
    pub n_layers: usize,
    /// Neurons per hidden layer.
    pub n_neurons: usize,
    /// Hidden-layer activation.
    pub activation: Activation,
}

/// Hyperparameters of the PPO agent.
///
/// Each [`SimulationCase`] has its own defaults, see [`AgentConfig::for_case`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Policy network shape.
    pub policy: NetworkConfig,
    /// Value network shape.
    pub value: NetworkConfig,
    /// Adam learning rate of the policy (default: 1e-3).
    pub policy_lr: f64,
    /// Adam learning rate of the value network (default: 5e-4).
    pub value_lr: f64,
    /// Discount factor (default: 0.99).
    pub gamma: f64,
    /// GAE smoothing parameter (default: 0.97).
    pub lambda: f64,
    /// PPO clipping epsilon (default: 0.1).
    pub clip: f64,
    /// Clip range of value predictions around their pre-update values (default: 0.1).
    pub value_clip: f64,
    /// Entropy bonus weight (default: 0.01).
    pub entropy_weight: f64,
    /// Full-batch policy gradient steps per update (default: 80).
    pub policy_epochs: usize,
    /// Full-batch value regression steps per update (default: 40).
    pub value_epochs: usize,
    /// Initial log standard deviation of the Gaussian policy (default: -0.5).
    pub initial_log_std: f64,
    /// Seed for weight initialisation (default: 0).
    pub seed: u64,
}

impl AgentConfig {
    /// Default hyperparameters for a simulation case.
    pub fn for_case(case: SimulationCase) -> Self {
        let relu = |n_neurons| NetworkConfig {
            n_layers: 2,
            n_neurons,
            activation: Activation::Relu,
        };
        let base = Self {
            policy: relu(64),
            value: relu(64),
            policy_lr: 1e-3,
            value_lr: 5e-4,
            gamma: 0.99,
            lambda: 0.97,
            clip: 0.1,
            value_clip: 0.1,
            entropy_weight: 0.01,
            policy_epochs: 80,
            value_epochs: 40,
            initial_log_std: -0.5,
            seed: 0,
        };
        match case {
            SimulationCase::RotatingCylinder2D => base,
            SimulationCase::RotatingPinball2D => Self {
                policy: relu(512),
                value: relu(512),
                policy_lr: 4e-4,
                value_lr: 4e-4,
                ..base
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Optional JSON override file
// ---------------------------------------------------------------------------

/// Contents of the `--config` JSON file. Every section is optional.
///
/// `agent` is merged field by field over the case defaults; `slurm` replaces
/// the default cluster settings entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub agent: Option<serde_json::Value>,
    #[serde(default)]
    pub slurm: Option<SlurmConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }
}

/// Overlay a partial JSON object onto a full set of defaults.
fn merge_agent_config(defaults: AgentConfig, overrides: &serde_json::Value) -> Result<AgentConfig> {
    let mut merged = serde_json::to_value(&defaults)?;
    merge_json(&mut merged, overrides);
    serde_json::from_value(merged).context("Invalid agent section in config file")
}

fn merge_json(target: &mut serde_json::Value, overrides: &serde_json::Value) {
    match (target, overrides) {
        (serde_json::Value::Object(t), serde_json::Value::Object(o)) => {
            for (key, value) in o {
                match t.get_mut(key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

// ---------------------------------------------------------------------------
// Raw and resolved training settings
// ---------------------------------------------------------------------------

/// Unvalidated settings as typed by the user.
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub output: PathBuf,
    pub backend: String,
    pub episodes: usize,
    pub n_runners: usize,
    pub buffer_size: usize,
    pub end_time: f64,
    pub timeout_secs: u64,
    pub checkpoint: Option<PathBuf>,
    pub simulation: String,
    pub min_successful_trials: usize,
    pub drl_base: PathBuf,
    pub file: FileConfig,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::from("test_training"),
            backend: "local".into(),
            episodes: 20,
            n_runners: 4,
            buffer_size: 8,
            end_time: 8.0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            checkpoint: None,
            simulation: SimulationCase::RotatingCylinder2D.to_string(),
            min_successful_trials: 1,
            drl_base: PathBuf::new(),
            file: FileConfig::default(),
        }
    }
}

/// Validated settings for one training run.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Training directory; holds `base/`, `copy_*/`, checkpoints and policies.
    pub output: PathBuf,
    pub backend: Backend,
    /// Total number of episodes (resumed runs continue up to this count).
    pub episodes: usize,
    pub n_runners: usize,
    pub buffer_size: usize,
    /// Simulation end time of every training trial.
    pub end_time: f64,
    /// Wall-clock limit of a single trial.
    pub timeout: Duration,
    /// Checkpoint to resume from; relative paths resolve inside `output`.
    pub checkpoint: Option<PathBuf>,
    pub simulation: SimulationCase,
    /// Fewer successful trials than this aborts the episode.
    pub min_successful_trials: usize,
    /// Root of the case library and cluster setup scripts (`DRL_BASE`).
    pub drl_base: PathBuf,
    pub agent: AgentConfig,
    /// Cluster settings; `None` for the local backend.
    pub slurm: Option<SlurmConfig>,
}

impl TrainingOptions {
    /// Validate and resolve into a [`TrainingConfig`].
    ///
    /// Performs no I/O, so a failure here leaves the filesystem untouched.
    pub fn resolve(self) -> Result<TrainingConfig> {
        let simulation: SimulationCase = self.simulation.parse()?;
        let backend: Backend = self.backend.parse()?;

        if self.n_runners == 0 || self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(format!(
                "runners ({}) and buffer size ({}) must be positive",
                self.n_runners, self.buffer_size
            ))
            .into());
        }
        if self.min_successful_trials == 0 || self.min_successful_trials > self.buffer_size {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.min_successful_trials,
                buffer_size: self.buffer_size,
            }
            .into());
        }

        let start_time = simulation.initialized_time();
        if self.end_time.is_nan() || self.end_time <= start_time {
            return Err(ConfigError::FinishTimeNotAfterStart {
                start_time,
                end_time: self.end_time,
            }
            .into());
        }

        let agent = match &self.file.agent {
            Some(overrides) => merge_agent_config(AgentConfig::for_case(simulation), overrides)?,
            None => AgentConfig::for_case(simulation),
        };

        let slurm = match backend {
            Backend::Local => None,
            Backend::Slurm => {
                let slurm = self.file.slurm.clone().unwrap_or_else(|| {
                    SlurmConfig::for_training(simulation.mpi_ranks(), &self.drl_base)
                });
                slurm.validate()?;
                Some(slurm)
            }
        };

        Ok(TrainingConfig {
            output: self.output,
            backend,
            episodes: self.episodes,
            n_runners: self.n_runners,
            buffer_size: self.buffer_size,
            end_time: self.end_time,
            timeout: Duration::from_secs(self.timeout_secs),
            checkpoint: self.checkpoint,
            simulation,
            min_successful_trials: self.min_successful_trials,
            drl_base: self.drl_base,
            agent,
            slurm,
        })
    }
}

impl TrainingConfig {
    /// Directory of the simulation template inside the case library.
    pub fn template_dir(&self) -> PathBuf {
        self.drl_base
            .join("openfoam")
            .join("test_cases")
            .join(self.simulation.as_str())
    }

    /// Absolute or output-relative checkpoint path.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint.as_ref().map(|c| self.output.join(c))
    }
}
