//! Episode-level training loop.
//!
//! Episodes run strictly one after another; only the fill inside an episode
//! is concurrent.
//!
//! ```text
//! Training loop
//! ─────────────────────────────────────
//! For e = starting_episode .. episodes - 1:
//!   1. Fill the buffer (trials run in parallel)
//!   2. Log reward and action statistics of the fill
//!   3. Update the agent on the observation batch
//!   4. Save checkpoint_<e>.json
//!   5. Push the traced policy to the buffer, save policy_trace_<e>.json
//!   6. Reset the buffer, unless e is the last episode
//! ```
//!
//! Any error ends the run. The checkpoint and policy of the last completed
//! episode stay on disk as the resume point.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use crate::agent::Agent;
use crate::env::Environment;
use crate::execution::Buffer;
use crate::trajectory::ObservationBatch;

/// File name of the agent state saved after `episode`.
pub fn checkpoint_file(episode: usize) -> String {
    format!("checkpoint_{episode}.json")
}

/// File name of the frozen policy saved after `episode`.
pub fn policy_trace_file(episode: usize) -> String {
    format!("policy_trace_{episode}.json")
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// What a call to [`TrainingLoop::run`] did.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub first_episode: usize,
    pub episodes_run: usize,
    pub elapsed: Duration,
    /// Checkpoints written, in episode order.
    pub checkpoints: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Training loop
// ---------------------------------------------------------------------------

/// Sequences fill, update, checkpoint and policy hand-off for each episode.
pub struct TrainingLoop<E: Environment, A: Agent> {
    buffer: Buffer<E>,
    agent: A,
    output: PathBuf,
    episodes: usize,
    starting_episode: usize,
}

impl<E: Environment, A: Agent> TrainingLoop<E, A> {
    /// `buffer` must be idle, with the agent's current policy already in
    /// its case directories.
    pub fn new(
        buffer: Buffer<E>,
        agent: A,
        output: impl Into<PathBuf>,
        episodes: usize,
        starting_episode: usize,
    ) -> Self {
        Self {
            buffer,
            agent,
            output: output.into(),
            episodes,
            starting_episode,
        }
    }

    pub fn buffer(&self) -> &Buffer<E> {
        &self.buffer
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn starting_episode(&self) -> usize {
        self.starting_episode
    }

    /// Total episode count; the loop stops before this index.
    pub fn episodes(&self) -> usize {
        self.episodes
    }

    pub fn into_parts(self) -> (Buffer<E>, A) {
        (self.buffer, self.agent)
    }

    /// Run the remaining episodes.
    pub async fn run(&mut self) -> Result<TrainingSummary> {
        let started = Instant::now();
        let mut checkpoints = Vec::new();

        if self.starting_episode >= self.episodes {
            info!(
                starting_episode = self.starting_episode,
                episodes = self.episodes,
                "All episodes already completed, nothing to do"
            );
        } else {
            info!(
                first = self.starting_episode,
                last = self.episodes - 1,
                environment = self.buffer.base_env().name(),
                "Starting training"
            );
        }

        for episode in self.starting_episode..self.episodes {
            let checkpoint = self
                .run_episode(episode)
                .await
                .with_context(|| format!("Episode {episode} failed"))?;
            checkpoints.push(checkpoint);
        }

        let elapsed = started.elapsed();
        info!(
            episodes_run = checkpoints.len(),
            training_time = format!("{:.2}s", elapsed.as_secs_f64()),
            "Training finished"
        );

        Ok(TrainingSummary {
            first_episode: self.starting_episode,
            episodes_run: checkpoints.len(),
            elapsed,
            checkpoints,
        })
    }

    async fn run_episode(&mut self, episode: usize) -> Result<PathBuf> {
        info!(episode, "Start of episode");

        // 1. fill
        let batch = self.buffer.fill().await?;

        // 2. statistics
        log_statistics(episode, batch);

        // 3. update
        self.agent
            .update(episode, batch)
            .context("Agent update failed")?;

        // 4. checkpoint
        let checkpoint = self.output.join(checkpoint_file(episode));
        self.agent.save_state(&checkpoint)?;

        // 5. policy hand-off
        let policy = self.agent.trace_policy();
        self.buffer.update_policy(&policy)?;
        policy.save(&self.output.join(policy_trace_file(episode)))?;

        // 6. reset
        if episode + 1 < self.episodes {
            self.buffer.reset()?;
        }

        info!(episode, checkpoint = %checkpoint.display(), "End of episode");
        Ok(checkpoint)
    }
}

fn log_statistics(episode: usize, batch: &ObservationBatch) {
    let Some(stats) = batch.statistics() else {
        return;
    };
    info!(
        episode,
        trajectories = batch.len(),
        samples = batch.n_samples(),
        reward_mean = format!("{:.4}", stats.reward.mean),
        reward_min = format!("{:.4}", stats.reward.min),
        reward_max = format!("{:.4}", stats.reward.max),
        "Reward statistics"
    );
    info!(
        episode,
        action_mean = format!("{:.4}", stats.action_mean.mean),
        action_mean_min = format!("{:.4}", stats.action_mean.min),
        action_mean_max = format!("{:.4}", stats.action_mean.max),
        action_std = format!("{:.4}", stats.action_std.mean),
        action_std_min = format!("{:.4}", stats.action_std.min),
        action_std_max = format!("{:.4}", stats.action_std.max),
        "Action statistics"
    );
}
