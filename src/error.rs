//! Error taxonomy for the training driver.
//!
//! Orchestration code returns `anyhow::Result` and attaches context as it
//! propagates; the variants below are the conditions callers need to tell
//! apart (configuration mistakes, fills without usable data, trial-level
//! faults). Recover them with `err.downcast_ref::<FillError>()` and friends.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid settings. Always raised before any trial is launched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown simulation environment '{name}'; available options are: {available}")]
    UnknownSimulation { name: String, available: String },

    #[error("unknown executer '{0}'; available options are 'local' and 'slurm'")]
    UnknownBackend(String),

    #[error("invalid execution config: {0}")]
    InvalidExecutionConfig(String),

    #[error("invalid buffer settings: {0}")]
    InvalidBufferSize(String),

    #[error("invalid minimum success threshold {threshold} (buffer size {buffer_size})")]
    InvalidThreshold { threshold: usize, buffer_size: usize },

    #[error("finish time {end_time} must be greater than the base case end time {start_time}")]
    FinishTimeNotAfterStart { start_time: f64, end_time: f64 },

    #[error("simulation template not found at {0}")]
    MissingTemplate(PathBuf),
}

/// A fill that cannot feed the update step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FillError {
    #[error("no trial succeeded in fill {fill} ({launched} launched)")]
    NoSuccessfulTrials { fill: usize, launched: usize },

    #[error("only {succeeded} trials succeeded in fill {fill}; at least {required} required")]
    BelowThreshold {
        fill: usize,
        succeeded: usize,
        required: usize,
    },

    #[error("buffer is not idle (state: {0}); call reset() before fill()")]
    NotIdle(String),
}

/// Failure of one simulation trial. Recorded per trial; never aborts a fill.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("failed to start trial in {dir}: {reason}")]
    Spawn { dir: PathBuf, reason: String },

    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("scheduler did not answer for job {job_id} ({failures} queries failed)")]
    QueueUnavailable { job_id: String, failures: u32 },

    #[error("no trajectory written to {0}")]
    MissingTrajectory(PathBuf),

    #[error("malformed trajectory in {path} (line {line}): {reason}")]
    MalformedTrajectory {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}
