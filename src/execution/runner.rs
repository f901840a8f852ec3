//! Running one simulation trial on a chosen backend.
//!
//! [`TrialRunner::run_trial`] starts a case's launch command inside its run
//! directory, waits for it under the per-trial timeout, and turns whatever
//! the trial left behind into a [`TrialReport`]. Failures never propagate:
//! they become a terminal [`TrialStatus`] with a detail message, so one bad
//! trial cannot abort a fill.

use std::fmt;
use std::future::pending;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::slurm::SlurmConfig;
use crate::env::{Environment, TrialCommand, TRAJECTORY_FILE};
use crate::error::TrialError;
use crate::trajectory::Trajectory;

/// Combined stdout/stderr of a local trial, inside its run directory.
pub const TRIAL_LOG_FILE: &str = "drl_trial.log";

/// Combined stdout/stderr of the base case run.
pub const SEED_LOG_FILE: &str = "drl_seed.log";

// ---------------------------------------------------------------------------
// Backend and status
// ---------------------------------------------------------------------------

/// Where trials are executed.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionBackend {
    /// Child processes of this driver.
    Local,
    /// Batch jobs on a Slurm cluster.
    Slurm(SlurmConfig),
}

impl ExecutionBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slurm(_) => "slurm",
        }
    }
}

/// Lifecycle of one trial within a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    /// Stopped because the buffer already had enough successful trials.
    Cancelled,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one trial.
#[derive(Debug, Clone)]
pub struct TrialReport {
    pub slot: usize,
    pub status: TrialStatus,
    /// Present exactly when `status` is [`TrialStatus::Succeeded`].
    pub trajectory: Option<Trajectory>,
    pub elapsed: Duration,
    /// Why the trial did not succeed.
    pub detail: Option<String>,
}

impl TrialReport {
    /// A trial that was stopped before it got to run.
    pub fn cancelled(slot: usize) -> Self {
        Self {
            slot,
            status: TrialStatus::Cancelled,
            trajectory: None,
            elapsed: Duration::ZERO,
            detail: Some("cancelled before launch".into()),
        }
    }

    fn failed(slot: usize, elapsed: Duration, detail: String) -> Self {
        Self {
            slot,
            status: TrialStatus::Failed,
            trajectory: None,
            elapsed,
            detail: Some(detail),
        }
    }
}

/// How a launched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Finished on its own. Slurm jobs carry no exit code.
    Exited(Option<i32>),
    /// Local process killed by a signal.
    Signalled(i32),
    TimedOut,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Launches trials on one backend with a fixed per-trial timeout.
///
/// Cheap to clone; every spawned trial task holds its own copy.
#[derive(Debug, Clone)]
pub struct TrialRunner {
    backend: Arc<ExecutionBackend>,
    timeout: Duration,
}

impl TrialRunner {
    pub fn new(backend: ExecutionBackend, timeout: Duration) -> Self {
        Self {
            backend: Arc::new(backend),
            timeout,
        }
    }

    pub fn backend(&self) -> &ExecutionBackend {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one trial in `env.path()` and collect its trajectory.
    ///
    /// A trial succeeds when its command finishes inside the timeout and
    /// leaves a well-formed trajectory file; the exit code alone does not
    /// decide. Setting `cancel` to `true` stops the trial.
    pub async fn run_trial<E: Environment>(
        &self,
        slot: usize,
        env: &E,
        fill: usize,
        cancel: watch::Receiver<bool>,
    ) -> TrialReport {
        let started = Instant::now();
        let dir = env.path();

        if *cancel.borrow() {
            return TrialReport::cancelled(slot);
        }

        if let Err(e) = std::fs::remove_file(dir.join(TRAJECTORY_FILE)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return TrialReport::failed(
                    slot,
                    started.elapsed(),
                    format!("could not remove stale trajectory: {e}"),
                );
            }
        }

        debug!(slot, fill, dir = %dir.display(), backend = self.backend.name(), "Launching trial");
        let termination = self
            .execute(dir, &env.launch_command(), &format!("fill_{fill}"), TRIAL_LOG_FILE, cancel)
            .await;
        let elapsed = started.elapsed();

        match termination {
            Ok(end @ (Termination::Exited(_) | Termination::Signalled(_))) => match env.read_trajectory(dir, slot) {
                Ok(trajectory) => {
                    debug!(slot, steps = trajectory.len(), ?elapsed, "Trial succeeded");
                    TrialReport {
                        slot,
                        status: TrialStatus::Succeeded,
                        trajectory: Some(trajectory),
                        elapsed,
                        detail: None,
                    }
                }
                Err(e) => {
                    let detail = match end {
                        Termination::Exited(Some(code)) => format!("{e} (exit code {code})"),
                        Termination::Signalled(signal) => format!("{e} (killed by signal {signal})"),
                        _ => e.to_string(),
                    };
                    warn!(slot, %detail, "Trial failed");
                    TrialReport::failed(slot, elapsed, detail)
                }
            },
            Ok(Termination::TimedOut) => {
                warn!(slot, timeout = ?self.timeout, "Trial timed out");
                TrialReport {
                    slot,
                    status: TrialStatus::TimedOut,
                    trajectory: None,
                    elapsed,
                    detail: Some(format!("exceeded timeout of {:?}", self.timeout)),
                }
            }
            Ok(Termination::Cancelled) => {
                debug!(slot, "Trial cancelled");
                TrialReport {
                    slot,
                    status: TrialStatus::Cancelled,
                    trajectory: None,
                    elapsed,
                    detail: Some("stopped after the buffer was full".into()),
                }
            }
            Err(e) => {
                warn!(slot, error = %e, "Trial could not be run");
                TrialReport::failed(slot, elapsed, e.to_string())
            }
        }
    }

    /// Run the base case's seed command to completion.
    ///
    /// Unlike trials, any failure here is an error for the caller.
    pub async fn run_seed<E: Environment>(&self, env: &E) -> Result<()> {
        let (_keep, cancel) = watch::channel(false);
        let started = Instant::now();
        let termination = self
            .execute(env.path(), &env.seed_command(), "seed", SEED_LOG_FILE, cancel)
            .await?;
        let command = env.seed_command().to_shell();
        match termination {
            Termination::Exited(Some(0)) => {}
            // Jobs report no exit code; leaving the queue is all there is.
            Termination::Exited(None) if matches!(*self.backend, ExecutionBackend::Slurm(_)) => {}
            Termination::Exited(None) => bail!(
                "'{command}' ended without an exit code in {}",
                env.path().display()
            ),
            Termination::Signalled(signal) => bail!(
                "'{command}' was killed by signal {signal} in {}",
                env.path().display()
            ),
            Termination::Exited(Some(code)) => bail!(
                "'{command}' exited with code {code} in {}",
                env.path().display()
            ),
            Termination::TimedOut => bail!(
                "'{command}' exceeded the timeout of {:?}",
                self.timeout
            ),
            Termination::Cancelled => bail!("base case run was cancelled"),
        }
        info!(case = %env.path().display(), elapsed = ?started.elapsed(), "Base case finished");
        Ok(())
    }

    async fn execute(
        &self,
        dir: &Path,
        command: &TrialCommand,
        tag: &str,
        log_file: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<Termination, TrialError> {
        match self.backend.as_ref() {
            ExecutionBackend::Local => self.execute_local(dir, command, log_file, cancel).await,
            ExecutionBackend::Slurm(config) => {
                self.execute_slurm(config, dir, command, tag, cancel).await
            }
        }
    }

    async fn execute_local(
        &self,
        dir: &Path,
        command: &TrialCommand,
        log_file: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Termination, TrialError> {
        let spawn_error = |reason: String| TrialError::Spawn {
            dir: dir.to_path_buf(),
            reason,
        };

        let log = std::fs::File::create(dir.join(log_file)).map_err(|e| spawn_error(e.to_string()))?;
        let log_err = log.try_clone().map_err(|e| spawn_error(e.to_string()))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        // Own process group, so mpirun and solver ranks die together.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;

        let waited: Result<Termination, String> = tokio::select! {
            res = timeout(self.timeout, child.wait()) => match res {
                Ok(Ok(status)) => Ok(exit_termination(status)),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Ok(Termination::TimedOut),
            },
            _ = cancelled(&mut cancel) => Ok(Termination::Cancelled),
        };

        match waited {
            Ok(end @ (Termination::Exited(_) | Termination::Signalled(_))) => Ok(end),
            Ok(other) => {
                terminate(&mut child).await;
                Ok(other)
            }
            Err(reason) => {
                terminate(&mut child).await;
                Err(spawn_error(reason))
            }
        }
    }

    async fn execute_slurm(
        &self,
        config: &SlurmConfig,
        dir: &Path,
        command: &TrialCommand,
        tag: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Termination, TrialError> {
        // Job scripts `cd` into the run directory from the scheduler's cwd.
        let run_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let script = run_dir.join(format!("jobscript_{tag}"));
        std::fs::write(&script, config.render_job_script(&run_dir, command)).map_err(|e| {
            TrialError::Spawn {
                dir: dir.to_path_buf(),
                reason: format!("could not write job script: {e}"),
            }
        })?;

        let job_id = config.submit(&script).await?;
        debug!(job_id = %job_id, dir = %run_dir.display(), "Submitted job");

        let waited = tokio::select! {
            res = timeout(self.timeout, config.wait_for(&job_id)) => match res {
                Ok(Ok(())) => Ok(Termination::Exited(None)),
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(Termination::TimedOut),
            },
            _ = cancelled(&mut cancel) => Ok(Termination::Cancelled),
        };

        // Anything but a job that left the queue on its own may still be running.
        if !matches!(waited, Ok(Termination::Exited(None))) {
            config.cancel(&job_id).await;
        }
        waited
    }
}

fn exit_termination(status: std::process::ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(Some(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signalled(signal);
        }
    }
    Termination::Exited(None)
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Trial process already gone");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, error = %e, "Could not kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{FoamEnvironment, SimulationCase};
    use crate::testing::{fake_case, write_script};
    use tempfile::tempdir;

    fn cylinder(dir: &Path) -> FoamEnvironment {
        FoamEnvironment::new(SimulationCase::RotatingCylinder2D, dir)
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn local_trial_collects_trajectory() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("copy_0");
        fake_case(&case, "");
        std::fs::write(case.join(TRAJECTORY_FILE), "stale").unwrap();

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_secs(30));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(0, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::Succeeded, "{:?}", report.detail);
        let trajectory = report.trajectory.unwrap();
        assert_eq!(trajectory.len(), 5);
        assert_eq!(trajectory.states[0].len(), 12);
        assert!(case.join(TRIAL_LOG_FILE).exists());
    }

    #[tokio::test]
    async fn missing_trajectory_is_a_failure_even_with_exit_zero() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("copy_0");
        fake_case(&case, "");
        write_script(&case.join("Allrun"), "exit 0\n");

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_secs(30));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(3, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::Failed);
        assert_eq!(report.slot, 3);
        assert!(report.trajectory.is_none());
        assert!(report.detail.unwrap().contains("trajectory"));
    }

    #[tokio::test]
    async fn hanging_trial_times_out() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("copy_0");
        fake_case(&case, "sleep 30\n");

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_millis(300));
        let (_tx, rx) = no_cancel();
        let started = Instant::now();
        let report = runner.run_trial(0, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_stops_running_trial() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("copy_0");
        fake_case(&case, "sleep 30\n");

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_secs(60));
        let (tx, rx) = no_cancel();
        let env = cylinder(&case);
        let handle = tokio::spawn(async move { runner.run_trial(0, &env, 0, rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, TrialStatus::Cancelled);
    }

    #[tokio::test]
    async fn seed_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("base");
        fake_case(&case, "");
        write_script(&case.join("Allrun.pre"), "exit 3\n");

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_secs(30));
        let err = runner.run_seed(&cylinder(&case)).await.unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn seed_killed_by_signal_is_an_error() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("base");
        fake_case(&case, "");
        write_script(&case.join("Allrun.pre"), "kill -9 $$\n");

        let runner = TrialRunner::new(ExecutionBackend::Local, Duration::from_secs(30));
        let err = runner.run_seed(&cylinder(&case)).await.unwrap_err();
        assert!(err.to_string().contains("signal 9"), "{err}");
    }

    /// Stand-in scheduler in `dir/bin`; `scancel` leaves a `scancelled` marker.
    fn fake_scheduler(dir: &Path, sbatch: &str, squeue: &str) -> SlurmConfig {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        write_script(&bin.join("sbatch"), sbatch);
        write_script(&bin.join("squeue"), squeue);
        write_script(
            &bin.join("scancel"),
            &format!("touch {}\n", dir.join("scancelled").display()),
        );
        SlurmConfig {
            submit_command: bin.join("sbatch").display().to_string(),
            queue_command: bin.join("squeue").display().to_string(),
            cancel_command: bin.join("scancel").display().to_string(),
            poll_interval_ms: 20,
            max_query_failures: 3,
            ..SlurmConfig::default()
        }
    }

    #[tokio::test]
    async fn slurm_trial_goes_through_submit_and_poll() {
        let dir = tempdir().unwrap();
        // Runs the job at submission, queue is always empty.
        let config = fake_scheduler(
            dir.path(),
            "sh \"$2\" > /dev/null 2>&1\necho \"4242;testcluster\"\n",
            "exit 0\n",
        );

        let case = dir.path().join("copy_0");
        fake_case(&case, "");

        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_secs(30));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(0, &cylinder(&case), 7, rx).await;

        assert_eq!(report.status, TrialStatus::Succeeded, "{:?}", report.detail);
        assert!(case.join("jobscript_fill_7").exists());
        assert!(!dir.path().join("scancelled").exists());
    }

    #[tokio::test]
    async fn slurm_trial_times_out_and_is_cancelled() {
        let dir = tempdir().unwrap();
        let config = fake_scheduler(dir.path(), "echo 99\n", "echo \"  99 alpha drl_train R\"\n");
        let case = dir.path().join("copy_0");
        fake_case(&case, "");

        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_millis(300));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(0, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::TimedOut);
        assert!(dir.path().join("scancelled").exists());
    }

    #[tokio::test]
    async fn slurm_trial_cancel_flag_cancels_job() {
        let dir = tempdir().unwrap();
        let config = fake_scheduler(dir.path(), "echo 99\n", "echo \"  99 alpha drl_train R\"\n");
        let case = dir.path().join("copy_0");
        fake_case(&case, "");

        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_secs(60));
        let (tx, rx) = no_cancel();
        let env = cylinder(&case);
        let handle = tokio::spawn(async move { runner.run_trial(0, &env, 0, rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, TrialStatus::Cancelled);
        assert!(dir.path().join("scancelled").exists());
    }

    #[tokio::test]
    async fn unreachable_queue_cancels_job_instead_of_abandoning_it() {
        let dir = tempdir().unwrap();
        let config = fake_scheduler(
            dir.path(),
            "echo 99\n",
            "echo 'slurm_load_jobs error: Socket timed out on send/recv operation' >&2\nexit 1\n",
        );
        let case = dir.path().join("copy_0");
        fake_case(&case, "");

        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_secs(60));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(0, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::Failed);
        assert!(report.detail.unwrap().contains("scheduler did not answer"));
        assert!(dir.path().join("scancelled").exists());
    }

    #[tokio::test]
    async fn slurm_seed_without_exit_code_is_accepted() {
        let dir = tempdir().unwrap();
        let config = fake_scheduler(
            dir.path(),
            "sh \"$2\" > /dev/null 2>&1\necho 5\n",
            "echo 'slurm_load_jobs error: Invalid job id specified' >&2\nexit 1\n",
        );
        let case = dir.path().join("base");
        fake_case(&case, "");

        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_secs(30));
        runner.run_seed(&cylinder(&case)).await.unwrap();
        assert!(case.join("seeded").exists());
        assert!(case.join("jobscript_seed").exists());
    }

    #[tokio::test]
    async fn failed_submission_fails_the_trial() {
        let dir = tempdir().unwrap();
        let case = dir.path().join("copy_0");
        fake_case(&case, "");

        let config = SlurmConfig {
            submit_command: dir.path().join("no-such-sbatch").display().to_string(),
            ..SlurmConfig::default()
        };
        let runner = TrialRunner::new(ExecutionBackend::Slurm(config), Duration::from_secs(30));
        let (_tx, rx) = no_cancel();
        let report = runner.run_trial(0, &cylinder(&case), 0, rx).await;

        assert_eq!(report.status, TrialStatus::Failed);
        assert!(report.detail.unwrap().contains("submission"));
    }
}
