//! Bootstrap of a training run: fresh start or resume from a checkpoint.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::agent::{Agent, PpoAgent};
use crate::config::{Backend, TrainingConfig};
use crate::env::case::{copy_case, read_dict_entry};
use crate::env::{Environment, FoamEnvironment, POLICY_FILE};
use crate::error::ConfigError;
use crate::execution::{Buffer, BufferConfig, ExecutionBackend, SlurmConfig};

use super::pipeline::TrainingLoop;

/// Turns a validated [`TrainingConfig`] into a ready-to-run [`TrainingLoop`].
pub struct TrainingSetup {
    config: TrainingConfig,
}

impl TrainingSetup {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Execution backend selected by the configuration.
    pub fn backend(&self) -> ExecutionBackend {
        match self.config.backend {
            Backend::Local => ExecutionBackend::Local,
            Backend::Slurm => ExecutionBackend::Slurm(self.config.slurm.clone().unwrap_or_else(
                || {
                    SlurmConfig::for_training(
                        self.config.simulation.mpi_ranks(),
                        &self.config.drl_base,
                    )
                },
            )),
        }
    }

    /// Create the training directory, the agent and the buffer.
    ///
    /// A fresh run writes an initial random policy into the base case and
    /// runs the base case once. A resumed run loads the checkpoint, numbers
    /// the next fill after the last recorded episode and pushes the loaded
    /// policy to the case directories; the base case is reused as found.
    pub async fn start(self) -> Result<TrainingLoop<FoamEnvironment, PpoAgent>> {
        let config = &self.config;
        let case = config.simulation;
        let base = config.output.join("base");

        info!(
            simulation = %case,
            backend = %config.backend,
            output = %config.output.display(),
            episodes = config.episodes,
            runners = config.n_runners,
            buffer = config.buffer_size,
            end_time = config.end_time,
            "Setting up training"
        );

        if !base.exists() {
            let template = config.template_dir();
            if !template.is_dir() {
                return Err(ConfigError::MissingTemplate(template).into());
            }
            check_finish_time(&template, config.end_time)?;
            std::fs::create_dir_all(&config.output).with_context(|| {
                format!("Failed to create output directory {}", config.output.display())
            })?;
            copy_case(&template, &base)
                .with_context(|| format!("Failed to copy template {}", template.display()))?;
            info!(template = %template.display(), base = %base.display(), "Copied base case");
        }

        let mut env = FoamEnvironment::new(case, &base);
        let mut agent = PpoAgent::new(
            env.n_states(),
            env.n_actions(),
            env.action_bounds(),
            config.agent.clone(),
        )?;

        let buffer_config = BufferConfig {
            buffer_size: config.buffer_size,
            n_runners: config.n_runners,
            timeout: config.timeout,
            min_successful_trials: config.min_successful_trials,
        };

        let mut buffer = match config.checkpoint_path() {
            Some(checkpoint) => {
                agent
                    .load_state(&checkpoint)
                    .with_context(|| format!("Failed to resume from {}", checkpoint.display()))?;
                if !env.path().join(POLICY_FILE).exists() {
                    warn!(base = %base.display(), "Resuming without a policy in the base case");
                }
                let starting = agent.history().next_episode();
                env.set_time_window(env.initialized_time(), config.end_time);
                let buffer = Buffer::new(&config.output, env, self.backend(), buffer_config, starting)?;
                buffer.update_policy(&agent.trace_policy())?;
                info!(starting_episode = starting, "Resuming training");
                buffer
            }
            None => {
                agent.trace_policy().save(&base.join(POLICY_FILE))?;
                let mut buffer = Buffer::new(&config.output, env, self.backend(), buffer_config, 0)?;
                buffer.prepare().await?;
                let env = buffer.base_env_mut();
                env.set_time_window(env.initialized_time(), config.end_time);
                buffer
            }
        };
        buffer.reset()?;

        let starting_episode = agent.history().next_episode();
        Ok(TrainingLoop::new(
            buffer,
            agent,
            &config.output,
            config.episodes,
            starting_episode,
        ))
    }
}

/// The training window must start after the start-up run stored in `case`.
///
/// Reads `endTime` from the case's `controlDict`; a case without a readable
/// entry is left to the per-case default checked during config resolution.
fn check_finish_time(case: &Path, end_time: f64) -> Result<()> {
    let dict = case.join("system").join("controlDict");
    let start_time = match read_dict_entry(&dict, "endTime") {
        Ok(Some(value)) => match value.parse::<f64>() {
            Ok(t) => t,
            Err(_) => {
                debug!(
                    dict = %dict.display(),
                    value = %value,
                    "Non-numeric endTime, skipping finish-time check"
                );
                return Ok(());
            }
        },
        Ok(None) | Err(_) => {
            debug!(dict = %dict.display(), "No endTime found, skipping finish-time check");
            return Ok(());
        }
    };
    if end_time <= start_time {
        return Err(ConfigError::FinishTimeNotAfterStart { start_time, end_time }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PolicyArtifact;
    use crate::config::{FileConfig, TrainingOptions};
    use crate::execution::TrialStatus;
    use crate::testing::fake_drl_base;
    use crate::trajectory::ObservationBatch;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn small_agent_file() -> FileConfig {
        FileConfig {
            agent: Some(serde_json::json!({
                "policy": { "n_neurons": 8 },
                "value": { "n_neurons": 8 },
                "policy_epochs": 3,
                "value_epochs": 3
            })),
            slurm: None,
        }
    }

    fn options(root: &Path, episodes: usize) -> TrainingOptions {
        TrainingOptions {
            output: root.join("run"),
            episodes,
            n_runners: 4,
            buffer_size: 4,
            timeout_secs: 60,
            drl_base: root.join("drl"),
            file: small_agent_file(),
            ..Default::default()
        }
    }

    async fn start(options: TrainingOptions) -> Result<TrainingLoop<FoamEnvironment, PpoAgent>> {
        TrainingSetup::new(options.resolve()?).start().await
    }

    #[tokio::test]
    async fn two_episodes_with_four_trials_each() {
        let dir = tempdir().unwrap();
        fake_drl_base(&dir.path().join("drl"), "");
        let out = dir.path().join("run");

        let mut training = start(options(dir.path(), 2)).await.unwrap();
        assert!(out.join("base").join("seeded").exists());
        assert_eq!(training.starting_episode(), 0);

        let summary = training.run().await.unwrap();
        assert_eq!(summary.episodes_run, 2);
        for episode in 0..2 {
            assert!(out.join(format!("checkpoint_{episode}.json")).exists());
            assert!(out.join(format!("policy_trace_{episode}.json")).exists());
            let batch = ObservationBatch::load(&out.join(format!("observations_{episode}.json"))).unwrap();
            assert_eq!(batch.len(), 4);
        }
        let episodes: Vec<_> = training.agent().history().records.iter().map(|r| r.episode).collect();
        assert_eq!(episodes, vec![0, 1]);
    }

    #[tokio::test]
    async fn one_failing_trial_still_completes_the_episode() {
        let dir = tempdir().unwrap();
        fake_drl_base(
            &dir.path().join("drl"),
            "case \"$(pwd)\" in */copy_2) exit 1 ;; esac",
        );
        let out = dir.path().join("run");

        let mut training = start(options(dir.path(), 1)).await.unwrap();
        training.run().await.unwrap();

        let batch = ObservationBatch::load(&out.join("observations_0.json")).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.trajectories.iter().all(|t| t.slot != 2));
        assert!(out.join("checkpoint_0.json").exists());
        assert_eq!(training.buffer().trials()[2].status, TrialStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_simulation_creates_nothing() {
        let dir = tempdir().unwrap();
        fake_drl_base(&dir.path().join("drl"), "");

        let err = start(TrainingOptions {
            simulation: "foo".into(),
            ..options(dir.path(), 1)
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownSimulation { .. })
        ));
        assert!(!dir.path().join("run").exists());
    }

    #[tokio::test]
    async fn missing_template_is_a_config_error() {
        let dir = tempdir().unwrap();

        let err = start(options(dir.path(), 1)).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingTemplate(_))
        ));
        assert!(!dir.path().join("run").exists());
    }

    #[tokio::test]
    async fn finish_time_is_checked_against_template_end_time() {
        let dir = tempdir().unwrap();
        let drl = dir.path().join("drl");
        fake_drl_base(&drl, "");
        let dict = drl.join("openfoam/test_cases/rotatingCylinder2D/system/controlDict");
        let text = fs::read_to_string(&dict).unwrap().replace("endTime         4;", "endTime         10;");
        fs::write(&dict, text).unwrap();

        let err = start(options(dir.path(), 1)).await.err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::FinishTimeNotAfterStart {
                start_time: 10.0,
                end_time: 8.0
            })
        );
        assert!(!dir.path().join("run").exists());
    }

    #[tokio::test]
    async fn slots_start_at_initialised_time() {
        let dir = tempdir().unwrap();
        fake_drl_base(&dir.path().join("drl"), "");
        let out = dir.path().join("run");

        let training = start(options(dir.path(), 1)).await.unwrap();
        assert_eq!(training.buffer().trials().len(), 4);
        for slot in 0..4 {
            let dict = fs::read_to_string(out.join(format!("copy_{slot}/system/controlDict"))).unwrap();
            assert!(dict.contains("startTime       4;"), "{dict}");
            assert!(dict.contains("endTime         8;"), "{dict}");
        }
        let in_slot = PolicyArtifact::load(&out.join("copy_0").join(POLICY_FILE)).unwrap();
        assert_eq!(in_slot, training.agent().trace_policy());
    }

    #[tokio::test]
    async fn resume_continues_after_checkpoint() {
        let dir = tempdir().unwrap();
        fake_drl_base(&dir.path().join("drl"), "");
        let out = dir.path().join("run");

        let mut first = start(options(dir.path(), 1)).await.unwrap();
        first.run().await.unwrap();
        let trained = first.agent().trace_policy();
        drop(first);

        let mut resumed = start(TrainingOptions {
            checkpoint: Some(PathBuf::from("checkpoint_0.json")),
            ..options(dir.path(), 3)
        })
        .await
        .unwrap();
        assert_eq!(resumed.starting_episode(), 1);
        assert_eq!(resumed.buffer().n_fills(), 1);
        assert_eq!(resumed.agent().trace_policy(), trained);
        let in_slot = PolicyArtifact::load(&out.join("copy_3").join(POLICY_FILE)).unwrap();
        assert_eq!(in_slot, trained);

        let summary = resumed.run().await.unwrap();
        assert_eq!(summary.first_episode, 1);
        assert_eq!(summary.episodes_run, 2);
        let episodes: Vec<_> = resumed.agent().history().records.iter().map(|r| r.episode).collect();
        assert_eq!(episodes, vec![0, 1, 2]);
        assert!(out.join("observations_1.json").exists());
        assert!(out.join("observations_2.json").exists());
    }

    #[tokio::test]
    async fn resume_from_missing_checkpoint_fails() {
        let dir = tempdir().unwrap();
        fake_drl_base(&dir.path().join("drl"), "");

        let result = start(TrainingOptions {
            checkpoint: Some(PathBuf::from("checkpoint_9.json")),
            ..options(dir.path(), 3)
        })
        .await;
        assert!(result.is_err());
    }
}
