//! Core environment trait and shared types.
//!
//! The buffer and trial runner only ever talk to a simulation case through
//! [`Environment`], so any solver that can be started from a run directory and
//! leaves a trajectory file behind can be trained.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TrialError;
use crate::trajectory::{reader, Trajectory};

/// File a finished trial must leave in its run directory.
pub const TRAJECTORY_FILE: &str = "trajectory.csv";

/// File name of the frozen policy inside every case directory.
pub const POLICY_FILE: &str = "policy.json";

/// A program invocation, executed inside a case directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TrialCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Single shell line, as written into batch job scripts.
    pub fn to_shell(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One simulation case definition.
///
/// Implementations are cheap to clone: every trial gets its own copy bound to
/// its own run directory via [`Environment::set_path`].
pub trait Environment: Clone + Send + Sync + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Dimension of the state vector.
    fn n_states(&self) -> usize;

    /// Dimension of the action vector.
    fn n_actions(&self) -> usize;

    /// Symmetric bound: actions live in `[-bound, bound]`.
    fn action_bounds(&self) -> f64;

    /// MPI ranks a single trial occupies (sizes cluster jobs).
    fn mpi_ranks(&self) -> usize;

    /// Case directory this copy is bound to.
    fn path(&self) -> &Path;

    fn set_path(&mut self, path: PathBuf);

    /// End time of the uncontrolled start-up run performed by the base case.
    fn initialized_time(&self) -> f64;

    fn start_time(&self) -> f64;

    fn end_time(&self) -> f64;

    fn set_time_window(&mut self, start_time: f64, end_time: f64);

    /// Write the current start/end time into the case files under [`Environment::path`].
    fn apply_time_window(&self) -> Result<()>;

    /// Command that advances one training trial.
    fn launch_command(&self) -> TrialCommand;

    /// Command that runs the base case once from scratch.
    fn seed_command(&self) -> TrialCommand;

    /// Parse the trajectory a finished trial left in `run_dir`.
    fn read_trajectory(&self, run_dir: &Path, slot: usize) -> Result<Trajectory, TrialError> {
        reader::read_trajectory(
            &run_dir.join(TRAJECTORY_FILE),
            slot,
            self.n_states(),
            self.n_actions(),
        )
    }
}
