//! The trajectory buffer.
//!
//! The buffer owns the base case and one run directory per slot
//! (`<output>/copy_<i>`). Each [`Buffer::fill`] launches one trial per slot,
//! at most `n_runners` at a time, and stops once `buffer_size` trials have
//! succeeded or every slot has finished. Successful trajectories are
//! aggregated by slot into an [`ObservationBatch`].
//!
//! There are `max(n_runners, buffer_size)` slots, so a buffer larger than the
//! runner count has more `copy_<i>` directories than concurrent trials: every
//! trial of a fill gets a directory of its own instead of reusing one that a
//! previous round of the same fill wrote to.
//!
//! ```text
//! Idle --fill()--> Launching -> Waiting -> Collecting -> Done --reset()--> Idle
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::runner::{ExecutionBackend, TrialReport, TrialRunner, TrialStatus};
use crate::agent::PolicyArtifact;
use crate::env::case::{replace_case, write_atomic};
use crate::env::{Environment, POLICY_FILE};
use crate::error::{ConfigError, FillError};
use crate::trajectory::ObservationBatch;

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Successful trials wanted per fill.
    pub buffer_size: usize,
    /// Trials allowed to run at the same time.
    pub n_runners: usize,
    /// Wall-clock limit of one trial.
    pub timeout: Duration,
    /// A fill with fewer successes than this is an error.
    pub min_successful_trials: usize,
}

impl BufferConfig {
    /// Run directories kept by the buffer; may exceed `n_runners`.
    pub fn n_slots(&self) -> usize {
        self.buffer_size.max(self.n_runners)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 || self.n_runners == 0 {
            return Err(ConfigError::InvalidBufferSize(format!(
                "runners ({}) and buffer size ({}) must be positive",
                self.n_runners, self.buffer_size
            )));
        }
        if self.min_successful_trials == 0 || self.min_successful_trials > self.buffer_size {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.min_successful_trials,
                buffer_size: self.buffer_size,
            });
        }
        Ok(())
    }
}

/// Where the buffer is in its fill cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    Idle,
    Launching,
    Waiting,
    Collecting,
    Done,
}

impl fmt::Display for FillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Waiting => "waiting",
            Self::Collecting => "collecting",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for one slot during the current fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub slot: usize,
    pub dir: PathBuf,
    pub status: TrialStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// `started_at` plus the trial timeout.
    pub deadline: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
    pub detail: Option<String>,
}

impl Trial {
    fn new(slot: usize, dir: PathBuf) -> Self {
        Self {
            slot,
            dir,
            status: TrialStatus::Pending,
            started_at: None,
            deadline: None,
            elapsed: None,
            detail: None,
        }
    }

    fn clear(&mut self) {
        *self = Self::new(self.slot, std::mem::take(&mut self.dir));
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

pub struct Buffer<E: Environment> {
    output: PathBuf,
    base_env: E,
    runner: TrialRunner,
    config: BufferConfig,
    trials: Vec<Trial>,
    state: FillState,
    observations: Option<ObservationBatch>,
    n_fills: usize,
}

impl<E: Environment> Buffer<E> {
    /// Create a buffer rooted at `output`.
    ///
    /// `n_fills` is the number of fills already performed: zero for a fresh
    /// run, the next episode index when resuming. No directories are touched
    /// until [`prepare`](Self::prepare) or [`reset`](Self::reset).
    pub fn new(
        output: impl Into<PathBuf>,
        base_env: E,
        backend: ExecutionBackend,
        config: BufferConfig,
        n_fills: usize,
    ) -> Result<Self> {
        config.validate()?;
        let output = output.into();
        let trials = (0..config.n_slots())
            .map(|slot| Trial::new(slot, output.join(format!("copy_{slot}"))))
            .collect();
        Ok(Self {
            runner: TrialRunner::new(backend, config.timeout),
            output,
            base_env,
            config,
            trials,
            state: FillState::Idle,
            observations: None,
            n_fills,
        })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn base_env(&self) -> &E {
        &self.base_env
    }

    /// Mutable access to the base case, e.g. to move its time window.
    /// Takes effect on disk at the next [`reset`](Self::reset).
    pub fn base_env_mut(&mut self) -> &mut E {
        &mut self.base_env
    }

    pub fn state(&self) -> FillState {
        self.state
    }

    pub fn n_fills(&self) -> usize {
        self.n_fills
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Batch of the last successful fill; `None` after a reset.
    pub fn observations(&self) -> Option<&ObservationBatch> {
        self.observations.as_ref()
    }

    /// Run the base case once and create the slot directories from it.
    ///
    /// A failed base run is fatal: no trial can start from a broken case.
    pub async fn prepare(&mut self) -> Result<()> {
        info!(
            case = %self.base_env.path().display(),
            start = self.base_env.start_time(),
            end = self.base_env.end_time(),
            "Running base case"
        );
        self.base_env.apply_time_window()?;
        self.runner
            .run_seed(&self.base_env)
            .await
            .with_context(|| format!("Base case in {} failed", self.base_env.path().display()))?;
        self.create_slots()
    }

    /// Discard all per-fill data and recreate the slots from the base case.
    ///
    /// Writes the base environment's current time window to disk first, so
    /// every slot starts from the same case files.
    pub fn reset(&mut self) -> Result<()> {
        self.base_env.apply_time_window()?;
        self.create_slots()?;
        for trial in &mut self.trials {
            trial.clear();
        }
        self.observations = None;
        self.state = FillState::Idle;
        debug!(slots = self.trials.len(), "Buffer reset");
        Ok(())
    }

    fn create_slots(&self) -> Result<()> {
        let base = self.base_env.path();
        for trial in &self.trials {
            replace_case(base, &trial.dir).with_context(|| {
                format!("Failed to create slot {} from {}", trial.slot, base.display())
            })?;
        }
        Ok(())
    }

    /// Distribute a policy to the base case and every existing slot.
    pub fn update_policy(&self, policy: &PolicyArtifact) -> Result<()> {
        let bytes = policy.to_json()?;
        let dirs = std::iter::once(self.base_env.path()).chain(
            self.trials
                .iter()
                .map(|t| t.dir.as_path())
                .filter(|dir| dir.is_dir()),
        );
        for dir in dirs {
            write_atomic(&dir.join(POLICY_FILE), &bytes)?;
        }
        debug!(slots = self.trials.len(), "Policy distributed");
        Ok(())
    }

    /// Run one round of trials and collect the successful trajectories.
    ///
    /// Requires the buffer to be idle. The fill counter advances on every
    /// completed attempt, including ones that end in a [`FillError`]. The
    /// batch is also written to `<output>/observations_<fill>.json`.
    pub async fn fill(&mut self) -> Result<&ObservationBatch> {
        if self.state != FillState::Idle {
            return Err(FillError::NotIdle(self.state.to_string()).into());
        }
        let fill = self.n_fills;
        self.state = FillState::Launching;
        info!(
            fill,
            slots = self.trials.len(),
            runners = self.config.n_runners,
            target = self.config.buffer_size,
            "Filling buffer"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.n_runners));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();
        let mut tasks = JoinSet::new();

        for trial in &mut self.trials {
            trial.clear();
            let mut env = self.base_env.clone();
            env.set_path(trial.dir.clone());
            let runner = self.runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel_rx.clone();
            let started = started_tx.clone();
            let slot = trial.slot;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TrialReport::cancelled(slot);
                };
                if *cancel.borrow() {
                    return TrialReport::cancelled(slot);
                }
                let _ = started.send(slot);
                runner.run_trial(slot, &env, fill, cancel).await
            });
        }
        drop(started_tx);
        self.state = FillState::Waiting;

        let mut reports: Vec<TrialReport> = Vec::with_capacity(self.trials.len());
        let mut succeeded = 0usize;
        while !tasks.is_empty() {
            tokio::select! {
                biased;
                Some(slot) = started_rx.recv() => self.mark_started(slot),
                Some(joined) = tasks.join_next() => match joined {
                    Ok(report) => {
                        if report.status == TrialStatus::Succeeded {
                            succeeded += 1;
                            if succeeded == self.config.buffer_size && !*cancel_tx.borrow() {
                                info!(fill, succeeded, "Buffer target reached, stopping remaining trials");
                                let _ = cancel_tx.send(true);
                            }
                        }
                        self.record(&report);
                        reports.push(report);
                    }
                    Err(e) => warn!(fill, error = %e, "Trial task aborted"),
                },
                else => break,
            }
        }

        self.state = FillState::Collecting;
        for trial in self.trials.iter_mut().filter(|t| !t.status.is_terminal()) {
            trial.status = TrialStatus::Failed;
            trial.detail = Some("trial task aborted".into());
        }

        let count = |status: TrialStatus| self.trials.iter().filter(|t| t.status == status).count();
        info!(
            fill,
            succeeded = count(TrialStatus::Succeeded),
            failed = count(TrialStatus::Failed),
            timed_out = count(TrialStatus::TimedOut),
            cancelled = count(TrialStatus::Cancelled),
            "Fill finished"
        );

        let trajectories: Vec<_> = reports
            .into_iter()
            .filter(|r| r.status == TrialStatus::Succeeded)
            .filter_map(|r| r.trajectory)
            .collect();
        let launched = self
            .trials
            .iter()
            .filter(|t| t.started_at.is_some())
            .count();

        self.n_fills += 1;
        self.state = FillState::Done;

        if trajectories.is_empty() {
            return Err(FillError::NoSuccessfulTrials { fill, launched }.into());
        }
        if trajectories.len() < self.config.min_successful_trials {
            return Err(FillError::BelowThreshold {
                fill,
                succeeded: trajectories.len(),
                required: self.config.min_successful_trials,
            }
            .into());
        }

        let batch = ObservationBatch::new(fill, trajectories);
        batch.save(&self.output.join(format!("observations_{fill}.json")))?;
        let batch = self.observations.insert(batch);
        Ok(&*batch)
    }

    fn mark_started(&mut self, slot: usize) {
        let timeout = self.config.timeout;
        if let Some(trial) = self.trials.get_mut(slot) {
            if trial.status != TrialStatus::Pending {
                return;
            }
            let now = Utc::now();
            trial.status = TrialStatus::Running;
            trial.started_at = Some(now);
            trial.deadline = chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|d| now.checked_add_signed(d));
        }
    }

    fn record(&mut self, report: &TrialReport) {
        if let Some(trial) = self.trials.get_mut(report.slot) {
            trial.status = report.status;
            trial.elapsed = Some(report.elapsed);
            trial.detail = report.detail.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{FoamEnvironment, SimulationCase};
    use crate::testing::{fake_case, small_policy, write_script};
    use std::fs;
    use tempfile::tempdir;

    fn config(buffer_size: usize, n_runners: usize) -> BufferConfig {
        BufferConfig {
            buffer_size,
            n_runners,
            timeout: Duration::from_secs(30),
            min_successful_trials: 1,
        }
    }

    /// Buffer over a fake cylinder case in `root/base`.
    fn buffer(root: &Path, prelude: &str, config: BufferConfig) -> Buffer<FoamEnvironment> {
        let base = root.join("base");
        fake_case(&base, prelude);
        let env = FoamEnvironment::new(SimulationCase::RotatingCylinder2D, &base);
        Buffer::new(root, env, ExecutionBackend::Local, config, 0).unwrap()
    }

    fn read_dict(dir: &Path) -> String {
        fs::read_to_string(dir.join("system/controlDict")).unwrap()
    }

    #[tokio::test]
    async fn prepare_runs_base_case_and_creates_slots() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(4, 4));
        buffer.prepare().await.unwrap();

        assert!(dir.path().join("base/seeded").exists());
        for slot in 0..4 {
            let copy = dir.path().join(format!("copy_{slot}"));
            assert!(copy.join("seeded").exists());
            assert!(read_dict(&copy).contains("endTime         4;"));
        }
        assert_eq!(buffer.state(), FillState::Idle);
    }

    #[tokio::test]
    async fn buffer_larger_than_runners_gets_a_slot_per_trial() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(6, 2));
        buffer.prepare().await.unwrap();

        assert_eq!(buffer.trials().len(), 6);
        assert!(dir.path().join("copy_5").join("seeded").exists());
        assert!(!dir.path().join("copy_6").exists());

        let batch = buffer.fill().await.unwrap();
        assert_eq!(batch.len(), 6);
    }

    #[tokio::test]
    async fn failed_base_case_is_fatal() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(2, 2));
        write_script(&dir.path().join("base/Allrun.pre"), "exit 1\n");

        assert!(buffer.prepare().await.is_err());
        assert!(!dir.path().join("copy_0").exists());
    }

    #[tokio::test]
    async fn fill_collects_every_slot() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(4, 4));
        buffer.prepare().await.unwrap();

        let batch = buffer.fill().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.fill, 0);
        let slots: Vec<_> = batch.trajectories.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);

        assert_eq!(buffer.state(), FillState::Done);
        assert_eq!(buffer.n_fills(), 1);
        assert!(dir.path().join("observations_0.json").exists());
        assert!(buffer
            .trials()
            .iter()
            .all(|t| t.status == TrialStatus::Succeeded && t.started_at.is_some()));
    }

    #[tokio::test]
    async fn failing_slot_is_excluded() {
        let dir = tempdir().unwrap();
        let prelude = "case \"$(basename \"$PWD\")\" in copy_2) exit 1;; esac";
        let mut buffer = buffer(dir.path(), prelude, config(4, 4));
        buffer.prepare().await.unwrap();

        let batch = buffer.fill().await.unwrap();
        let slots: Vec<_> = batch.trajectories.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1, 3]);
        assert_eq!(buffer.trials()[2].status, TrialStatus::Failed);
        assert!(buffer.trials()[2].detail.is_some());
    }

    #[tokio::test]
    async fn timed_out_slot_is_excluded() {
        let dir = tempdir().unwrap();
        let prelude = "case \"$(basename \"$PWD\")\" in copy_1) sleep 30;; esac";
        let mut buffer = buffer(
            dir.path(),
            prelude,
            BufferConfig {
                timeout: Duration::from_millis(1500),
                ..config(3, 3)
            },
        );
        buffer.prepare().await.unwrap();

        let batch = buffer.fill().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(buffer.trials()[1].status, TrialStatus::TimedOut);
        assert!(buffer.trials()[1].deadline.is_some());
    }

    #[tokio::test]
    async fn stragglers_are_cancelled_once_target_is_met() {
        let dir = tempdir().unwrap();
        let prelude = "case \"$(basename \"$PWD\")\" in copy_3) sleep 30;; esac";
        let mut buffer = buffer(dir.path(), prelude, config(3, 4));
        buffer.prepare().await.unwrap();

        let batch = buffer.fill().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(buffer.trials()[3].status, TrialStatus::Cancelled);
    }

    #[tokio::test]
    async fn no_success_is_an_error_and_still_counts() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "exit 1", config(2, 2));
        buffer.prepare().await.unwrap();

        let err = buffer.fill().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FillError>(),
            Some(FillError::NoSuccessfulTrials { fill: 0, launched: 2 })
        ));
        assert_eq!(buffer.n_fills(), 1);
        assert!(buffer.observations().is_none());
    }

    #[tokio::test]
    async fn below_threshold_is_an_error() {
        let dir = tempdir().unwrap();
        let prelude = "case \"$(basename \"$PWD\")\" in copy_0) ;; *) exit 1;; esac";
        let mut buffer = buffer(
            dir.path(),
            prelude,
            BufferConfig {
                min_successful_trials: 2,
                ..config(3, 3)
            },
        );
        buffer.prepare().await.unwrap();

        let err = buffer.fill().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FillError>(),
            Some(FillError::BelowThreshold { succeeded: 1, required: 2, .. })
        ));
    }

    #[tokio::test]
    async fn fill_requires_reset() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(2, 2));
        buffer.prepare().await.unwrap();
        buffer.fill().await.unwrap();

        let err = buffer.fill().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<FillError>(), Some(FillError::NotIdle(_))));

        buffer.reset().unwrap();
        assert_eq!(buffer.state(), FillState::Idle);
        assert!(buffer.observations().is_none());
        assert!(buffer.trials().iter().all(|t| t.status == TrialStatus::Pending));
        assert_eq!(buffer.fill().await.unwrap().fill, 1);
        assert!(dir.path().join("observations_1.json").exists());
    }

    #[tokio::test]
    async fn reset_applies_time_window_to_every_slot() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(2, 2));
        buffer.prepare().await.unwrap();

        buffer.base_env_mut().set_time_window(4.0, 8.0);
        buffer.reset().unwrap();
        buffer.reset().unwrap();

        for path in ["base", "copy_0", "copy_1"] {
            let text = read_dict(&dir.path().join(path));
            assert!(text.contains("startTime       4;"), "{path}: {text}");
            assert!(text.contains("endTime         8;"), "{path}: {text}");
        }
    }

    #[tokio::test]
    async fn policy_reaches_base_and_slots() {
        let dir = tempdir().unwrap();
        let mut buffer = buffer(dir.path(), "", config(2, 2));
        buffer.prepare().await.unwrap();

        let policy = small_policy();
        buffer.update_policy(&policy).unwrap();

        for path in ["base", "copy_0", "copy_1"] {
            let loaded = PolicyArtifact::load(&dir.path().join(path).join(POLICY_FILE)).unwrap();
            assert_eq!(loaded, policy);
        }
    }

    #[tokio::test]
    async fn resumed_buffer_continues_fill_counter() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        fake_case(&base, "");
        let env = FoamEnvironment::new(SimulationCase::RotatingCylinder2D, &base);
        let mut buffer =
            Buffer::new(dir.path(), env, ExecutionBackend::Local, config(2, 2), 5).unwrap();
        buffer.reset().unwrap();

        assert_eq!(buffer.fill().await.unwrap().fill, 5);
        assert_eq!(buffer.n_fills(), 6);
        assert!(dir.path().join("observations_5.json").exists());
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        let dir = tempdir().unwrap();
        let env = FoamEnvironment::new(SimulationCase::RotatingCylinder2D, dir.path());
        let zero = Buffer::new(dir.path(), env.clone(), ExecutionBackend::Local, config(0, 2), 0);
        assert!(zero.is_err());
        let threshold = Buffer::new(
            dir.path(),
            env,
            ExecutionBackend::Local,
            BufferConfig {
                min_successful_trials: 3,
                ..config(2, 2)
            },
            0,
        );
        assert!(threshold.is_err());
    }

    #[test]
    fn slots_cover_runners_and_buffer_size() {
        assert_eq!(config(8, 4).n_slots(), 8);
        assert_eq!(config(2, 4).n_slots(), 4);
    }
}
