//! Core trajectory data types.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env::case::write_atomic;

// ---------------------------------------------------------------------------
// Single trajectory
// ---------------------------------------------------------------------------

/// The samples recorded by one trial, in simulation-time order.
///
/// `states`, `actions` and `rewards` are parallel: entry `t` of each belongs
/// to control step `t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Buffer slot that produced this trajectory.
    pub slot: usize,
    /// Simulation time of each control step.
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub actions: Vec<Vec<f64>>,
    pub rewards: Vec<f64>,
}

impl Trajectory {
    /// Number of control steps.
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn mean_reward(&self) -> f64 {
        mean(&self.rewards)
    }

    /// Mean over every action component of every step.
    pub fn action_mean(&self) -> f64 {
        mean(&self.flat_actions())
    }

    /// Sample standard deviation over every action component of every step.
    pub fn action_std(&self) -> f64 {
        let values = self.flat_actions();
        if values.len() < 2 {
            return 0.0;
        }
        let m = mean(&values);
        let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        var.sqrt()
    }

    fn flat_actions(&self) -> Vec<f64> {
        self.actions.iter().flatten().copied().collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// Observation batch
// ---------------------------------------------------------------------------

/// Successful trajectories of one fill, ordered by slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Fill counter value when this batch was collected.
    pub fill: usize,
    pub trajectories: Vec<Trajectory>,
}

impl ObservationBatch {
    pub fn new(fill: usize, mut trajectories: Vec<Trajectory>) -> Self {
        trajectories.sort_by_key(|t| t.slot);
        Self { fill, trajectories }
    }

    /// Number of trajectories.
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    /// Total number of control steps across all trajectories.
    pub fn n_samples(&self) -> usize {
        self.trajectories.iter().map(Trajectory::len).sum()
    }

    /// Per-trajectory state sequences.
    pub fn states(&self) -> Vec<&[Vec<f64>]> {
        self.trajectories.iter().map(|t| t.states.as_slice()).collect()
    }

    /// Per-trajectory action sequences.
    pub fn actions(&self) -> Vec<&[Vec<f64>]> {
        self.trajectories.iter().map(|t| t.actions.as_slice()).collect()
    }

    /// Per-trajectory reward sequences.
    pub fn rewards(&self) -> Vec<&[f64]> {
        self.trajectories.iter().map(|t| t.rewards.as_slice()).collect()
    }

    /// Summary statistics; `None` for an empty batch.
    pub fn statistics(&self) -> Option<FillStatistics> {
        FillStatistics::from_batch(self)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize observations")?;
        write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read observations from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse observations from {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Mean, minimum and maximum of a set of per-trajectory values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            mean: mean(values),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Observability summary of one fill. Never used for control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillStatistics {
    /// Over per-trajectory mean rewards.
    pub reward: Summary,
    /// Over per-trajectory action means.
    pub action_mean: Summary,
    /// Over per-trajectory action standard deviations.
    pub action_std: Summary,
}

impl FillStatistics {
    pub fn from_batch(batch: &ObservationBatch) -> Option<Self> {
        let collect = |f: fn(&Trajectory) -> f64| -> Vec<f64> {
            batch.trajectories.iter().map(f).collect()
        };
        Some(Self {
            reward: Summary::from_values(&collect(Trajectory::mean_reward))?,
            action_mean: Summary::from_values(&collect(Trajectory::action_mean))?,
            action_std: Summary::from_values(&collect(Trajectory::action_std))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trajectory(slot: usize, rewards: &[f64], actions: &[f64]) -> Trajectory {
        Trajectory {
            slot,
            times: (0..rewards.len()).map(|i| i as f64).collect(),
            states: rewards.iter().map(|_| vec![0.0; 2]).collect(),
            actions: actions.iter().map(|a| vec![*a]).collect(),
            rewards: rewards.to_vec(),
        }
    }

    #[test]
    fn batch_is_ordered_by_slot() {
        let batch = ObservationBatch::new(
            0,
            vec![
                trajectory(3, &[1.0], &[0.0]),
                trajectory(0, &[2.0], &[0.0]),
                trajectory(1, &[3.0], &[0.0]),
            ],
        );
        let slots: Vec<usize> = batch.trajectories.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1, 3]);
        assert_eq!(batch.rewards()[0], &[2.0]);
    }

    #[test]
    fn action_std_is_sample_std() {
        let t = trajectory(0, &[0.0; 4], &[1.0, 2.0, 3.0, 4.0]);
        // var = (2.25 + 0.25 + 0.25 + 2.25) / 3
        assert!((t.action_std() - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((t.action_mean() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn statistics_summarise_per_trajectory_means() {
        let batch = ObservationBatch::new(
            0,
            vec![
                trajectory(0, &[1.0, 3.0], &[0.5, 0.5]),
                trajectory(1, &[-1.0, -1.0], &[1.0, -1.0]),
            ],
        );
        let stats = batch.statistics().unwrap();
        assert!((stats.reward.mean - 0.5).abs() < 1e-12);
        assert!((stats.reward.min + 1.0).abs() < 1e-12);
        assert!((stats.reward.max - 2.0).abs() < 1e-12);
        assert!((stats.action_std.min - 0.0).abs() < 1e-12);
        assert_eq!(batch.n_samples(), 4);
    }

    #[test]
    fn empty_batch_has_no_statistics() {
        assert!(ObservationBatch::new(0, Vec::new()).statistics().is_none());
    }
}
