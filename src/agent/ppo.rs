//! Proximal policy optimisation for continuous flow control.
//!
//! The policy is a diagonal Gaussian over normalised actions
//! `u = a / action_bounds`: its mean is `tanh` of the policy network output
//! and its log standard deviation is a free, state-independent parameter
//! vector. A separate value network provides the baseline for GAE.
//!
//! Each update runs `policy_epochs` full-batch steps on the clipped surrogate
//! (plus an entropy bonus), then `value_epochs` steps on the clipped value
//! regression, both with Adam.

use std::f64::consts::PI;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::advantage::{clip_ratio, compute_gae, importance_ratio, normalize};
use super::network::{Adam, Mlp};
use super::policy::PolicyArtifact;
use super::traits::{Agent, EpisodeRecord, TrainingHistory, UpdateReport};
use crate::config::AgentConfig;
use crate::env::case::write_atomic;
use crate::trajectory::ObservationBatch;

const LOG_STD_MIN: f64 = -5.0;
const LOG_STD_MAX: f64 = 1.0;

/// Initial scale of the policy output layer, so the first policy acts
/// close to zero.
const POLICY_OUTPUT_SCALE: f64 = 0.01;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Complete optimisation state of a [`PpoAgent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub config: AgentConfig,
    pub n_states: usize,
    pub n_actions: usize,
    pub action_bounds: f64,
    pub policy: Mlp,
    pub log_std: Vec<f64>,
    pub value: Mlp,
    pub policy_optimizer: Adam,
    pub value_optimizer: Adam,
    pub history: TrainingHistory,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse checkpoint from {}", path.display()))
    }

    fn check_consistency(&self) -> Result<()> {
        ensure!(
            self.policy.n_inputs() == self.n_states
                && self.policy.n_outputs() == self.n_actions
                && self.log_std.len() == self.n_actions,
            "policy network does not match {} states / {} actions",
            self.n_states,
            self.n_actions
        );
        ensure!(
            self.value.n_inputs() == self.n_states && self.value.n_outputs() == 1,
            "value network does not match {} states",
            self.n_states
        );
        ensure!(
            self.policy_optimizer.n_params() == self.policy.n_params() + self.n_actions
                && self.value_optimizer.n_params() == self.value.n_params(),
            "optimiser state does not match the networks"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One state/action pair prepared for the update.
struct Sample {
    state: Vec<f64>,
    /// Normalised action.
    action: Vec<f64>,
    advantage: f64,
    value_target: f64,
    old_value: f64,
    old_log_prob: f64,
}

pub struct PpoAgent {
    config: AgentConfig,
    n_states: usize,
    n_actions: usize,
    action_bounds: f64,
    policy: Mlp,
    log_std: Vec<f64>,
    value: Mlp,
    policy_optimizer: Adam,
    value_optimizer: Adam,
    history: TrainingHistory,
}

impl PpoAgent {
    /// A freshly initialised agent; weights are drawn from `config.seed`.
    pub fn new(n_states: usize, n_actions: usize, action_bounds: f64, config: AgentConfig) -> Result<Self> {
        ensure!(
            n_states > 0 && n_actions > 0,
            "agent needs at least one state and one action"
        );
        ensure!(
            action_bounds.is_finite() && action_bounds > 0.0,
            "action bound must be positive, got {action_bounds}"
        );
        ensure!(
            config.clip > 0.0 && config.clip < 1.0,
            "clip must lie in (0, 1), got {}",
            config.clip
        );
        ensure!(
            config.value_clip > 0.0,
            "value_clip must be positive, got {}",
            config.value_clip
        );
        ensure!(
            config.policy_epochs > 0 && config.value_epochs > 0,
            "policy_epochs and value_epochs must be positive"
        );

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut policy = Mlp::from_config(n_states, n_actions, &config.policy, &mut rng);
        policy.scale_output(POLICY_OUTPUT_SCALE);
        let value = Mlp::from_config(n_states, 1, &config.value, &mut rng);

        Ok(Self {
            policy_optimizer: Adam::new(policy.n_params() + n_actions, config.policy_lr),
            value_optimizer: Adam::new(value.n_params(), config.value_lr),
            log_std: vec![config.initial_log_std; n_actions],
            config,
            n_states,
            n_actions,
            action_bounds,
            policy,
            value,
            history: TrainingHistory::default(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        CheckpointState {
            config: self.config.clone(),
            n_states: self.n_states,
            n_actions: self.n_actions,
            action_bounds: self.action_bounds,
            policy: self.policy.clone(),
            log_std: self.log_std.clone(),
            value: self.value.clone(),
            policy_optimizer: self.policy_optimizer.clone(),
            value_optimizer: self.value_optimizer.clone(),
            history: self.history.clone(),
            saved_at: Utc::now(),
        }
    }

    fn restore(&mut self, state: CheckpointState) {
        self.config = state.config;
        self.n_states = state.n_states;
        self.n_actions = state.n_actions;
        self.action_bounds = state.action_bounds;
        self.policy = state.policy;
        self.log_std = state.log_std;
        self.value = state.value;
        self.policy_optimizer = state.policy_optimizer;
        self.value_optimizer = state.value_optimizer;
        self.history = state.history;
    }

    fn log_prob(&self, mean: &[f64], action: &[f64]) -> f64 {
        mean.iter()
            .zip(action)
            .zip(&self.log_std)
            .map(|((mu, u), ls)| {
                let z = (u - mu) / ls.exp();
                -0.5 * z * z - ls - 0.5 * (2.0 * PI).ln()
            })
            .sum()
    }

    /// Entropy of the action distribution (state-independent).
    fn entropy(&self) -> f64 {
        self.log_std
            .iter()
            .map(|ls| 0.5 + 0.5 * (2.0 * PI).ln() + ls)
            .sum()
    }

    fn collect_samples(&self, batch: &ObservationBatch) -> Result<Vec<Sample>> {
        let mut samples = Vec::with_capacity(batch.n_samples());
        let sequences = batch
            .states()
            .into_iter()
            .zip(batch.actions())
            .zip(batch.rewards());

        for ((states, actions), rewards) in sequences {
            for (state, action) in states.iter().zip(actions) {
                ensure!(
                    state.len() == self.n_states && action.len() == self.n_actions,
                    "sample has {} states / {} actions, agent expects {} / {}",
                    state.len(),
                    action.len(),
                    self.n_states,
                    self.n_actions
                );
            }

            let values: Vec<f64> = states.iter().map(|s| self.value.forward(s)[0]).collect();
            let (advantages, targets) =
                compute_gae(rewards, &values, self.config.gamma, self.config.lambda);

            for (t, (state, action)) in states.iter().zip(actions).enumerate() {
                let normalised: Vec<f64> = action.iter().map(|a| a / self.action_bounds).collect();
                let mean: Vec<f64> = self.policy.forward(state).into_iter().map(f64::tanh).collect();
                samples.push(Sample {
                    state: state.clone(),
                    old_log_prob: self.log_prob(&mean, &normalised),
                    action: normalised,
                    advantage: advantages[t],
                    value_target: targets[t],
                    old_value: values[t],
                });
            }
        }

        let mut advantages: Vec<f64> = samples.iter().map(|s| s.advantage).collect();
        normalize(&mut advantages);
        for (sample, advantage) in samples.iter_mut().zip(advantages) {
            sample.advantage = advantage;
        }
        Ok(samples)
    }

    /// One step on the clipped surrogate. Returns the loss and approximate
    /// KL divergence measured before the step.
    fn policy_step(&mut self, samples: &[Sample]) -> (f64, f64) {
        let n = samples.len() as f64;
        let n_net = self.policy.n_params();
        let sigma: Vec<f64> = self.log_std.iter().map(|ls| ls.exp()).collect();
        let mut grad = vec![0.0; n_net + self.n_actions];
        let mut loss = 0.0;
        let mut kl = 0.0;

        for sample in samples {
            let (out, cache) = self.policy.forward_cached(&sample.state);
            let mean: Vec<f64> = out.iter().map(|z| z.tanh()).collect();
            let log_prob = self.log_prob(&mean, &sample.action);
            let ratio = importance_ratio(log_prob, sample.old_log_prob);

            let unclipped = ratio * sample.advantage;
            let clipped = clip_ratio(ratio, self.config.clip) * sample.advantage;
            loss -= unclipped.min(clipped) / n;
            kl += (sample.old_log_prob - log_prob) / n;

            // Where the clipped term binds the objective is flat.
            if unclipped > clipped {
                continue;
            }
            let d_log_prob = -unclipped / n;

            let mut d_out = vec![0.0; self.n_actions];
            for j in 0..self.n_actions {
                let diff = (sample.action[j] - mean[j]) / sigma[j];
                d_out[j] = d_log_prob * diff / sigma[j] * (1.0 - mean[j] * mean[j]);
                grad[n_net + j] += d_log_prob * (diff * diff - 1.0);
            }
            self.policy.backward(&cache, &d_out, &mut grad);
        }

        loss -= self.config.entropy_weight * self.entropy();
        for g in &mut grad[n_net..] {
            *g -= self.config.entropy_weight;
        }

        let update = self.policy_optimizer.step(&grad);
        self.policy.apply_update(&update[..n_net]);
        for (ls, u) in self.log_std.iter_mut().zip(&update[n_net..]) {
            *ls = (*ls - u).clamp(LOG_STD_MIN, LOG_STD_MAX);
        }
        (loss, kl)
    }

    /// One step on the clipped value regression. Returns the loss before the step.
    fn value_step(&mut self, samples: &[Sample]) -> f64 {
        let n = samples.len() as f64;
        let clip = self.config.value_clip;
        let mut grad = vec![0.0; self.value.n_params()];
        let mut loss = 0.0;

        for sample in samples {
            let (out, cache) = self.value.forward_cached(&sample.state);
            let v = out[0];
            let v_clipped = sample.old_value + (v - sample.old_value).clamp(-clip, clip);
            let err = (v - sample.value_target).powi(2);
            let err_clipped = (v_clipped - sample.value_target).powi(2);
            loss += err.max(err_clipped) / n;

            if err >= err_clipped {
                let d_v = 2.0 * (v - sample.value_target) / n;
                self.value.backward(&cache, &[d_v], &mut grad);
            }
        }

        let update = self.value_optimizer.step(&grad);
        self.value.apply_update(&update);
        loss
    }

    fn is_finite(&self) -> bool {
        self.policy.is_finite() && self.value.is_finite() && self.log_std.iter().all(|v| v.is_finite())
    }
}

impl Agent for PpoAgent {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn update(&mut self, episode: usize, batch: &ObservationBatch) -> Result<UpdateReport> {
        if batch.n_samples() == 0 {
            bail!("cannot update from an empty observation batch (episode {episode})");
        }

        let samples = self.collect_samples(batch)?;
        let backup = self.checkpoint_state();
        let entropy = self.entropy();

        let mut policy_loss = f64::NAN;
        let mut approx_kl = f64::NAN;
        for _ in 0..self.config.policy_epochs {
            (policy_loss, approx_kl) = self.policy_step(&samples);
        }
        let mut value_loss = f64::NAN;
        for _ in 0..self.config.value_epochs {
            value_loss = self.value_step(&samples);
        }

        if !(policy_loss.is_finite() && value_loss.is_finite() && self.is_finite()) {
            self.restore(backup);
            bail!(
                "numerical breakdown in episode {episode} update \
                 (policy loss {policy_loss}, value loss {value_loss})"
            );
        }

        let reward_mean = batch.statistics().map_or(0.0, |s| s.reward.mean);
        self.history.push(EpisodeRecord {
            episode,
            reward_mean,
            policy_loss,
            value_loss,
            entropy,
        });

        let report = UpdateReport {
            episode,
            n_trajectories: batch.len(),
            n_samples: samples.len(),
            policy_loss,
            value_loss,
            entropy,
            approx_kl,
        };
        info!(
            episode,
            samples = report.n_samples,
            policy_loss,
            value_loss,
            entropy,
            approx_kl,
            "Agent updated"
        );
        Ok(report)
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(&self.checkpoint_state()).context("Failed to serialize agent state")?;
        write_atomic(path, &json)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;
        debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let state = CheckpointState::load(path)?;
        if state.n_states != self.n_states || state.n_actions != self.n_actions {
            bail!(
                "checkpoint {} is for {} states / {} actions, environment has {} / {}",
                path.display(),
                state.n_states,
                state.n_actions,
                self.n_states,
                self.n_actions
            );
        }
        state
            .check_consistency()
            .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;

        info!(
            path = %path.display(),
            saved_at = %state.saved_at,
            last_episode = ?state.history.last_episode(),
            "Loaded checkpoint"
        );
        self.restore(state);
        Ok(())
    }

    fn history(&self) -> &TrainingHistory {
        &self.history
    }

    fn trace_policy(&self) -> PolicyArtifact {
        PolicyArtifact {
            n_states: self.n_states,
            n_actions: self.n_actions,
            action_bounds: self.action_bounds,
            network: self.policy.clone(),
            log_std: self.log_std.clone(),
        }
    }
}
