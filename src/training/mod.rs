//! Training module.
//!
//! [`TrainingSetup`] bootstraps a run (fresh or resumed from a checkpoint)
//! and hands back a [`TrainingLoop`], which sequences fill, update,
//! checkpoint and policy hand-off for every remaining episode.

pub mod pipeline;
pub mod setup;

pub use pipeline::{checkpoint_file, policy_trace_file, TrainingLoop, TrainingSummary};
pub use setup::TrainingSetup;
