//! Simulation environments.
//!
//! Every case implements the [`Environment`] trait so the buffer and trial
//! runner can drive it uniformly. The available cases form the closed
//! [`SimulationCase`] enum; names are resolved when the configuration is
//! parsed, never at launch time.
//!
//! - [`foam`] -- OpenFOAM flow-control cases ([`FoamEnvironment`]).
//! - [`case`] -- helpers for copying case directories and editing the
//!   `controlDict`.

pub mod case;
pub mod foam;
pub mod traits;

pub use foam::{FoamEnvironment, SimulationCase};
pub use traits::{Environment, TrialCommand, POLICY_FILE, TRAJECTORY_FILE};
