//! drl-foam: episode-level deep reinforcement learning for flow control.
//!
//! Trains a control policy for OpenFOAM simulations. Each episode fans a
//! batch of simulation trials out to local processes or Slurm jobs, collects
//! the resulting trajectories, runs one PPO update and pushes the new policy
//! back into the case directories.

pub mod agent;
pub mod config;
pub mod env;
pub mod error;
pub mod execution;
pub mod trajectory;
pub mod training;

#[cfg(test)]
pub(crate) mod testing;
