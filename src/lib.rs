//! Core library for the daqmx-tmux acquisition daemon.
//!
//! A single analog front end is time-multiplexed across several channels and
//! chopper references. Each hardware trigger sweeps `nsamples` slots; which
//! input is read at each slot is decided ahead of time by the
//! [`scheduler`]. Every acquisition cycle reads `nshots` sweeps, the
//! [`processing`] module folds them back into one shot vector per channel and
//! chopper, and a [`hook`] reduces those into named outputs.
//!
//! ```text
//! config ──► scheduler ──► OwnershipTable ──► hardware (TaskSpec, read)
//!                                                   │
//!                                            RawSamples (nsamples × nshots)
//!                                                   │
//!                           processing ──► ShotVectorSet ──► hook ──► NamedOutputs
//! ```
//!
//! The [`orchestrator`] owns the cycle: task rebuilds, retried reads and
//! discarding buffers made stale by configuration changes.

pub mod channel;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod hook;
pub mod orchestrator;
pub mod processing;
pub mod scheduler;

pub use channel::{AggregationMethod, Channel, Chopper, SampleWindow, VoltageRange};
pub use config::DaemonConfig;
pub use error::{AppResult, DaqError};
pub use hardware::{AcquisitionBackend, RawSamples, SimulatedBackend};
pub use orchestrator::{Measurement, MeasurementState, Orchestrator};
pub use scheduler::OwnershipTable;
pub use tmux_shots_api as shots_api;
