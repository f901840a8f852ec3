//! Agent module: the learner that turns observation batches into policies.
//!
//! The training loop talks to any learner through the [`Agent`] trait. The
//! reference learner is [`PpoAgent`], a PPO implementation over small dense
//! networks, whose frozen output is a [`PolicyArtifact`].

pub mod advantage;
pub mod network;
pub mod policy;
pub mod ppo;
pub mod traits;

// Re-export the primary types for convenient access.
pub use policy::PolicyArtifact;
pub use ppo::{CheckpointState, PpoAgent};
pub use traits::{Agent, EpisodeRecord, TrainingHistory, UpdateReport};
