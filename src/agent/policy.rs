//! Frozen policy artifacts.
//!
//! A [`PolicyArtifact`] is everything the controller inside a simulation
//! needs to act: the policy network, the action scaling and the exploration
//! noise. It is written as JSON into every case directory before a fill and
//! saved per episode as `policy_trace_<e>.json`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::network::Mlp;
use crate::env::case::write_atomic;

/// Gaussian policy `a = bound * (tanh(net(s)) + exp(log_std) * noise)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub n_states: usize,
    pub n_actions: usize,
    /// Actions are scaled to `[-action_bounds, action_bounds]`.
    pub action_bounds: f64,
    pub network: Mlp,
    /// Log standard deviation per action, in normalised action units.
    pub log_std: Vec<f64>,
}

impl PolicyArtifact {
    /// Deterministic action for `state`.
    pub fn mean_action(&self, state: &[f64]) -> Result<Vec<f64>> {
        if state.len() != self.n_states {
            bail!(
                "state has {} entries, policy expects {}",
                state.len(),
                self.n_states
            );
        }
        Ok(self
            .network
            .forward(state)
            .into_iter()
            .map(|z| self.action_bounds * z.tanh())
            .collect())
    }

    /// Standard deviation of each action, in action units.
    pub fn action_std(&self) -> Vec<f64> {
        self.log_std
            .iter()
            .map(|ls| self.action_bounds * ls.exp())
            .collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("Failed to serialize policy")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_json()?)
            .with_context(|| format!("Failed to save policy to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy from {}", path.display()))?;
        let policy: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse policy from {}", path.display()))?;
        if policy.network.n_inputs() != policy.n_states
            || policy.network.n_outputs() != policy.n_actions
            || policy.log_std.len() != policy.n_actions
        {
            bail!("inconsistent policy dimensions in {}", path.display());
        }
        Ok(policy)
    }
}
