//! Custom error types for the daemon.
//!
//! `DaqError` is the single error type surfaced by the library. Built with
//! `thiserror`, it consolidates the failure sources of an acquisition daemon:
//!
//! - **`Config`** / **`Configuration`**: file/env parsing errors from `figment`
//!   and semantic validation failures (duplicate physical addresses, windows
//!   outside the acquisition window, bad retry bounds). These are fatal: the
//!   daemon refuses to reach a ready state.
//! - **`InvalidVoltageRange`**: channels whose declared range is not one of
//!   the ranges the hardware advertises. Carries every offending channel name.
//! - **`TaskBuild`** / **`AcquisitionFailed`**: hardware failures. Both are
//!   recoverable; a later measurement may succeed once the task rebuilds.
//! - **`Hook`** / **`HookLoad`**: post-processing failures, surfaced as a
//!   failed measurement.
//!
//! Backend and hook errors convert via `#[from]`, so `?` works across the
//! crate boundaries.

use thiserror::Error;
use tmux_shots_api::ProcessingError;

use crate::hardware::BackendError;

/// Convenience alias for results using the daemon error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Channels declare a voltage range the hardware does not advertise.
    #[error("Invalid voltage range for channel(s): {}", .channels.join(", "))]
    InvalidVoltageRange {
        /// Names of every offending channel.
        channels: Vec<String>,
    },

    /// Aggregation method name not in average|sum|min|max.
    #[error("Unrecognized aggregation method '{0}' (expected average, sum, min or max)")]
    UnknownAggregationMethod(String),

    /// The hardware task could not be built.
    #[error("Hardware task build failed: {0}")]
    TaskBuild(#[source] BackendError),

    /// Any other backend failure outside the retried read path.
    #[error("Acquisition backend error: {0}")]
    Backend(#[from] BackendError),

    /// Every read attempt failed; the task has been cleared.
    #[error("Acquisition failed after {attempts} attempts: {last}")]
    AcquisitionFailed {
        /// Number of read attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: BackendError,
    },

    /// A measurement cycle is already in flight.
    #[error("Measurement already in progress")]
    MeasurementInProgress,

    /// The post-processing hook could not be loaded.
    #[error("Failed to load shots processing hook: {0}")]
    HookLoad(String),

    /// The post-processing hook failed or returned a malformed result.
    #[error("Shots processing hook error: {0}")]
    Hook(#[from] ProcessingError),

    /// Shot demultiplexing failed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A blocking hardware call panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// File I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Whether retrying the same request later may succeed without a
    /// configuration change.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::TaskBuild(_)
                | DaqError::AcquisitionFailed { .. }
                | DaqError::MeasurementInProgress
                | DaqError::Backend(_)
        )
    }
}
