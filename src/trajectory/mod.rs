//! Trajectories produced by simulation trials.
//!
//! This module provides:
//! - [`types::Trajectory`] -- the (state, action, reward) sequence of one
//!   successful trial.
//! - [`types::ObservationBatch`] -- every successful trajectory of one fill,
//!   handed to the agent as a unit.
//! - [`types::FillStatistics`] -- reward/action summaries logged per episode.
//! - [`reader`] -- parsing and validation of the trajectory file a trial
//!   leaves in its run directory.

pub mod reader;
pub mod types;

pub use types::{FillStatistics, ObservationBatch, Summary, Trajectory};
