//! Slurm batch execution.
//!
//! A trial becomes a job script (`#SBATCH` resources, `module load` lines,
//! environment setup, then the case command) submitted with
//! `sbatch --parsable`. Completion is detected by polling `squeue` until the
//! job disappears; timed-out or cancelled trials are removed with `scancel`.
//! A failing `squeue` says nothing about the job: the poll retries, and only
//! gives up (and cancels the job) after `max_query_failures` failures in a row.
//! The three scheduler commands are configurable so that site wrappers can be
//! substituted.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::env::TrialCommand;
use crate::error::{ConfigError, TrialError};

/// Resource and software requirements of one cluster trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// MPI tasks per node (`--ntasks-per-node`).
    pub n_tasks_per_node: usize,
    /// Node count (`--nodes`).
    pub n_nodes: usize,
    /// Wall-clock limit in Slurm notation, e.g. `03:00:00`.
    pub time: String,
    pub job_name: String,
    pub partition: Option<String>,
    pub constraint: Option<String>,
    /// Environment modules, one `module load` line each.
    pub modules: Vec<String>,
    /// Shell commands run before the case command.
    pub commands_pre: Vec<String>,
    pub submit_command: String,
    pub queue_command: String,
    pub cancel_command: String,
    /// Delay between two `squeue` polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive failed `squeue` calls after which a job is given up.
    pub max_query_failures: u32,
}

/// What the scheduler says about a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Still listed by `squeue`.
    Active,
    /// No longer known to the scheduler.
    Gone,
    /// The query itself failed.
    Unknown,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            n_tasks_per_node: 1,
            n_nodes: 1,
            time: "00:30:00".into(),
            job_name: "drl_trial".into(),
            partition: None,
            constraint: None,
            modules: Vec::new(),
            commands_pre: Vec::new(),
            submit_command: "sbatch".into(),
            queue_command: "squeue".into(),
            cancel_command: "scancel".into(),
            poll_interval_ms: 5_000,
            max_query_failures: 60,
        }
    }
}

impl SlurmConfig {
    /// Settings used for training runs: one node with one task per MPI rank
    /// and an OpenFOAM v2312 software stack.
    pub fn for_training(mpi_ranks: usize, drl_base: &Path) -> Self {
        Self {
            n_tasks_per_node: mpi_ranks,
            n_nodes: 1,
            time: "03:00:00".into(),
            job_name: "drl_train".into(),
            modules: vec![
                "development/24.04 GCC/12.3.0".into(),
                "OpenMPI/4.1.5".into(),
                "OpenFOAM/v2312".into(),
            ],
            commands_pre: vec![
                "source $FOAM_BASH".into(),
                format!("source {}/setup-env", drl_base.display()),
            ],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_tasks_per_node == 0 {
            return Err(ConfigError::InvalidExecutionConfig(
                "n_tasks_per_node must be positive".into(),
            ));
        }
        if self.n_nodes == 0 {
            return Err(ConfigError::InvalidExecutionConfig(
                "n_nodes must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidExecutionConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.max_query_failures == 0 {
            return Err(ConfigError::InvalidExecutionConfig(
                "max_query_failures must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Job script that runs `command` inside `run_dir`.
    pub fn render_job_script(&self, run_dir: &Path, command: &TrialCommand) -> String {
        let mut script = String::from("#!/bin/bash -l\n");
        let _ = writeln!(script, "#SBATCH --job-name={}", self.job_name);
        let _ = writeln!(script, "#SBATCH --nodes={}", self.n_nodes);
        let _ = writeln!(script, "#SBATCH --ntasks-per-node={}", self.n_tasks_per_node);
        let _ = writeln!(script, "#SBATCH --time={}", self.time);
        let _ = writeln!(script, "#SBATCH --output={}/log.slurm", run_dir.display());
        if let Some(partition) = &self.partition {
            let _ = writeln!(script, "#SBATCH --partition={partition}");
        }
        if let Some(constraint) = &self.constraint {
            let _ = writeln!(script, "#SBATCH --constraint={constraint}");
        }
        script.push('\n');
        for module in &self.modules {
            let _ = writeln!(script, "module load {module}");
        }
        for cmd in &self.commands_pre {
            let _ = writeln!(script, "{cmd}");
        }
        let _ = writeln!(script, "\ncd {}", run_dir.display());
        let _ = writeln!(script, "{}", command.to_shell());
        script
    }

    /// Submit a job script and return the scheduler's job id.
    pub async fn submit(&self, script: &Path) -> Result<String, TrialError> {
        let output = Command::new(&self.submit_command)
            .arg("--parsable")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TrialError::Submit(format!("{}: {e}", self.submit_command)))?;

        if !output.status.success() {
            return Err(TrialError::Submit(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            TrialError::Submit(format!(
                "no job id in '{}'",
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        })
    }

    /// Ask the scheduler about a job.
    ///
    /// Empty `squeue` output, or an "Invalid job id" rejection, means the job
    /// has left the queue. Any other failure is [`JobState::Unknown`].
    pub async fn query(&self, job_id: &str) -> JobState {
        match Command::new(&self.queue_command)
            .args(["-h", "-j", job_id])
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                if String::from_utf8_lossy(&out.stdout).trim().is_empty() {
                    JobState::Gone
                } else {
                    JobState::Active
                }
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if stderr.to_lowercase().contains("invalid job id") {
                    return JobState::Gone;
                }
                warn!(job_id, stderr = %stderr.trim(), "Queue query failed");
                JobState::Unknown
            }
            Err(e) => {
                warn!(job_id, error = %e, "Could not run queue command");
                JobState::Unknown
            }
        }
    }

    /// Poll until the job has left the queue.
    ///
    /// Fails after `max_query_failures` unanswered queries in a row; the job
    /// may still be running then.
    pub async fn wait_for(&self, job_id: &str) -> Result<(), TrialError> {
        let interval = Duration::from_millis(self.poll_interval_ms);
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            match self.query(job_id).await {
                JobState::Gone => return Ok(()),
                JobState::Active => failures = 0,
                JobState::Unknown => {
                    failures += 1;
                    if failures >= self.max_query_failures {
                        return Err(TrialError::QueueUnavailable {
                            job_id: job_id.to_string(),
                            failures,
                        });
                    }
                }
            }
        }
    }

    pub async fn cancel(&self, job_id: &str) {
        match Command::new(&self.cancel_command)
            .arg(job_id)
            .stdin(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => debug!(job_id, "Cancelled job"),
            Ok(status) => warn!(job_id, %status, "Cancel command failed"),
            Err(e) => warn!(job_id, error = %e, "Could not run cancel command"),
        }
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}
