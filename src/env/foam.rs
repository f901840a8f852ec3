//! OpenFOAM flow-control cases.
//!
//! A case directory holds the usual OpenFOAM layout plus two run scripts:
//! `Allrun.pre` (mesh, decomposition and the uncontrolled start-up run) and
//! `Allrun` (one controlled trial that writes [`TRAJECTORY_FILE`]). The
//! controller inside the solver reads the frozen policy from [`POLICY_FILE`].
//!
//! [`TRAJECTORY_FILE`]: super::TRAJECTORY_FILE
//! [`POLICY_FILE`]: super::POLICY_FILE

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::case::set_dict_entry;
use super::traits::{Environment, TrialCommand};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Case catalogue
// ---------------------------------------------------------------------------

/// The simulation cases this driver can train on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationCase {
    /// Flow past a single rotating cylinder; one rotation rate is controlled.
    #[serde(rename = "rotatingCylinder2D")]
    RotatingCylinder2D,
    /// Fluidic pinball: three cylinders, each with its own rotation rate.
    #[serde(rename = "rotatingPinball2D")]
    RotatingPinball2D,
}

impl SimulationCase {
    pub const ALL: [SimulationCase; 2] = [Self::RotatingCylinder2D, Self::RotatingPinball2D];

    /// Name of the case, also the template directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RotatingCylinder2D => "rotatingCylinder2D",
            Self::RotatingPinball2D => "rotatingPinball2D",
        }
    }

    /// Number of pressure sensors fed to the policy.
    pub fn n_states(&self) -> usize {
        match self {
            Self::RotatingCylinder2D => 12,
            Self::RotatingPinball2D => 14,
        }
    }

    pub fn n_actions(&self) -> usize {
        match self {
            Self::RotatingCylinder2D => 1,
            Self::RotatingPinball2D => 3,
        }
    }

    /// Maximum absolute angular velocity.
    pub fn action_bounds(&self) -> f64 {
        5.0
    }

    pub fn mpi_ranks(&self) -> usize {
        match self {
            Self::RotatingCylinder2D => 2,
            Self::RotatingPinball2D => 8,
        }
    }

    /// End time of the uncontrolled start-up phase run by `Allrun.pre`.
    pub fn initialized_time(&self) -> f64 {
        match self {
            Self::RotatingCylinder2D => 4.0,
            Self::RotatingPinball2D => 200.0,
        }
    }
}

impl FromStr for SimulationCase {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|case| case.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownSimulation {
                name: s.to_string(),
                available: Self::ALL
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl fmt::Display for SimulationCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// An OpenFOAM case bound to one directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FoamEnvironment {
    case: SimulationCase,
    path: PathBuf,
    start_time: f64,
    end_time: f64,
}

impl FoamEnvironment {
    /// A case whose time window covers the start-up phase (`0 .. initialized_time`).
    pub fn new(case: SimulationCase, path: impl Into<PathBuf>) -> Self {
        Self {
            case,
            path: path.into(),
            start_time: 0.0,
            end_time: case.initialized_time(),
        }
    }

    pub fn case(&self) -> SimulationCase {
        self.case
    }

    fn control_dict(&self) -> PathBuf {
        self.path.join("system").join("controlDict")
    }
}

impl Environment for FoamEnvironment {
    fn name(&self) -> &str {
        self.case.as_str()
    }

    fn n_states(&self) -> usize {
        self.case.n_states()
    }

    fn n_actions(&self) -> usize {
        self.case.n_actions()
    }

    fn action_bounds(&self) -> f64 {
        self.case.action_bounds()
    }

    fn mpi_ranks(&self) -> usize {
        self.case.mpi_ranks()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    fn initialized_time(&self) -> f64 {
        self.case.initialized_time()
    }

    fn start_time(&self) -> f64 {
        self.start_time
    }

    fn end_time(&self) -> f64 {
        self.end_time
    }

    fn set_time_window(&mut self, start_time: f64, end_time: f64) {
        self.start_time = start_time;
        self.end_time = end_time;
    }

    fn apply_time_window(&self) -> Result<()> {
        let dict = self.control_dict();
        set_dict_entry(&dict, "startTime", &self.start_time.to_string())
            .with_context(|| format!("Failed to set start time of {}", self.path.display()))?;
        set_dict_entry(&dict, "endTime", &self.end_time.to_string())
            .with_context(|| format!("Failed to set end time of {}", self.path.display()))?;
        tracing::debug!(
            case = %self.path.display(),
            start = self.start_time,
            end = self.end_time,
            "Applied simulation time window"
        );
        Ok(())
    }

    fn launch_command(&self) -> TrialCommand {
        TrialCommand::new("bash", &["Allrun"])
    }

    fn seed_command(&self) -> TrialCommand {
        TrialCommand::new("bash", &["Allrun.pre"])
    }
}
