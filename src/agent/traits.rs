//! The learner interface used by the training loop.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::policy::PolicyArtifact;
use crate::trajectory::ObservationBatch;

// ---------------------------------------------------------------------------
// Episode history
// ---------------------------------------------------------------------------

/// Summary of one update, as stored in the checkpoint history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode: usize,
    /// Mean over trajectories of the per-trajectory mean reward.
    pub reward_mean: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    /// Mean entropy of the action distribution before the update.
    pub entropy: f64,
}

/// Every update performed so far, in episode order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub records: Vec<EpisodeRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpisodeRecord) {
        self.records.push(record);
    }

    pub fn last_episode(&self) -> Option<usize> {
        self.records.last().map(|r| r.episode)
    }

    /// Episode a resumed run starts with.
    pub fn next_episode(&self) -> usize {
        self.last_episode().map_or(0, |e| e + 1)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What one call to [`Agent::update`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub episode: usize,
    pub n_trajectories: usize,
    pub n_samples: usize,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    /// Mean `log pi_old - log pi_new` over the batch after the last policy step.
    pub approx_kl: f64,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A policy-gradient learner.
///
/// The training loop only ever calls these methods, so the optimisation
/// algorithm can be swapped without touching execution or checkpointing.
pub trait Agent: Send {
    fn n_states(&self) -> usize;

    fn n_actions(&self) -> usize;

    /// One optimisation step on the trajectories of a fill.
    ///
    /// Fails on an empty batch and on numerical breakdown; the agent is left
    /// unchanged in the latter case.
    fn update(&mut self, episode: usize, batch: &ObservationBatch) -> Result<UpdateReport>;

    /// Write the full training state (weights, optimiser, history).
    fn save_state(&self, path: &Path) -> Result<()>;

    /// Restore a state written by [`Agent::save_state`].
    fn load_state(&mut self, path: &Path) -> Result<()>;

    fn history(&self) -> &TrainingHistory;

    /// Inference-only snapshot of the current policy.
    fn trace_policy(&self) -> PolicyArtifact;
}
