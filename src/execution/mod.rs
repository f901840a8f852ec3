//! Trial execution.
//!
//! - [`runner`] -- launches one trial on the local machine or on Slurm and
//!   reports its outcome.
//! - [`slurm`] -- job scripts and the `sbatch`/`squeue`/`scancel` cycle.
//! - [`buffer`] -- the slot directories and the concurrent fill that turns
//!   trials into an observation batch.

pub mod buffer;
pub mod runner;
pub mod slurm;

pub use buffer::{Buffer, BufferConfig, FillState, Trial};
pub use runner::{ExecutionBackend, TrialReport, TrialRunner, TrialStatus};
pub use slurm::{JobState, SlurmConfig};
