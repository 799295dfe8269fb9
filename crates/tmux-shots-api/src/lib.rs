//! Post-processing hook contract for the time-multiplexed shot pipeline.
//!
//! A hook receives one row per enabled channel followed by one row per enabled
//! chopper (each row holds one value per shot) and reduces them into a list of
//! named outputs. The hook owns the externally visible channel names: it may
//! rename, merge or drop rows freely.
//!
//! The contract is deliberately narrow: a single [`ShotsProcessor::process`]
//! entry point with fixed input and output shapes, tagged with
//! [`CONTRACT_VERSION`] so the host can refuse processors built against a
//! different revision.
//!
//! # Example
//!
//! ```
//! use tmux_shots_api::{HookOutput, ProcessingError, ShotKind, ShotMatrix, ShotsProcessor};
//!
//! struct FirstShot;
//!
//! impl ShotsProcessor for FirstShot {
//!     fn process(
//!         &self,
//!         shots: &ShotMatrix,
//!         names: &[String],
//!         _kinds: &[ShotKind],
//!     ) -> Result<HookOutput, ProcessingError> {
//!         let values = shots
//!             .rows()
//!             .iter()
//!             .map(|row| row.first().copied().unwrap_or(f64::NAN))
//!             .collect();
//!         Ok(HookOutput::Pair { values, names: names.to_vec() })
//!     }
//! }
//!
//! let shots = ShotMatrix::zeros(2, 4);
//! let names = vec!["signal".to_string(), "chopper".to_string()];
//! let kinds = [ShotKind::Channel, ShotKind::Chopper];
//! let out = FirstShot.process(&shots, &names, &kinds).unwrap();
//! assert_eq!(out.names(), names.as_slice());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Revision of the hook contract implemented by this crate.
///
/// Bump whenever the shape of [`ShotMatrix`], [`ShotKind`] or [`HookOutput`]
/// changes in a way existing processors cannot absorb.
pub const CONTRACT_VERSION: u32 = 1;

/// Tag attached to every row of a [`ShotMatrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotKind {
    /// Row produced by an analog channel.
    Channel,
    /// Row produced by a chopper reference (values are +1.0 / -1.0).
    Chopper,
}

impl ShotKind {
    /// Lowercase label handed to script-based processors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShotKind::Channel => "channel",
            ShotKind::Chopper => "chopper",
        }
    }
}

impl fmt::Display for ShotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-major matrix of shot values: one row per enabled channel/chopper,
/// `nshots` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotMatrix {
    rows: Vec<Vec<f64>>,
    nshots: usize,
}

impl ShotMatrix {
    /// Build a matrix from rows, checking that every row has `nshots` values.
    pub fn new(rows: Vec<Vec<f64>>, nshots: usize) -> Result<Self, ProcessingError> {
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != nshots) {
            return Err(ProcessingError::InvalidInput(format!(
                "row {} has {} values, expected {}",
                index,
                row.len(),
                nshots
            )));
        }
        Ok(Self { rows, nshots })
    }

    /// Zero-filled matrix, used to discover a processor's output names.
    pub fn zeros(nrows: usize, nshots: usize) -> Self {
        Self {
            rows: vec![vec![0.0; nshots]; nrows],
            nshots,
        }
    }

    /// All rows in order.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows (enabled channels plus enabled choppers).
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    /// Number of shots per row.
    pub fn nshots(&self) -> usize {
        self.nshots
    }
}

/// Raw result of a processor, mirroring the two accepted output shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HookOutput {
    /// `(values, output_names)`; every output is unsigned.
    Pair {
        /// One value per output.
        values: Vec<f64>,
        /// Output names, parallel to `values`.
        names: Vec<String>,
    },
    /// `(values, output_names, signed_flags)`.
    Triple {
        /// One value per output.
        values: Vec<f64>,
        /// Output names, parallel to `values`.
        names: Vec<String>,
        /// Whether each output is signed, parallel to `values`.
        signed: Vec<bool>,
    },
}

impl HookOutput {
    /// Declared output names.
    pub fn names(&self) -> &[String] {
        match self {
            HookOutput::Pair { names, .. } | HookOutput::Triple { names, .. } => names,
        }
    }

    /// Output values.
    pub fn values(&self) -> &[f64] {
        match self {
            HookOutput::Pair { values, .. } | HookOutput::Triple { values, .. } => values,
        }
    }

    /// Number of elements in the tuple this output corresponds to (2 or 3).
    pub fn arity(&self) -> usize {
        match self {
            HookOutput::Pair { .. } => 2,
            HookOutput::Triple { .. } => 3,
        }
    }
}

/// Errors raised by a processor or while talking to one.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessingError {
    /// The processor rejected its input.
    #[error("invalid hook input: {0}")]
    InvalidInput(String),

    /// The processor failed while running.
    #[error("hook execution failed: {0}")]
    Execution(String),

    /// The processor returned something other than a 2- or 3-element tuple.
    #[error("hook returned a {found}-element result, expected 2 or 3")]
    BadArity {
        /// Number of elements actually returned.
        found: usize,
    },

    /// The processor returned a well-formed tuple with inconsistent content.
    #[error("malformed hook output: {0}")]
    MalformedOutput(String),

    /// The processor targets a different contract revision.
    #[error("hook implements contract v{found}, host requires v{expected}")]
    IncompatibleVersion {
        /// Revision implemented by the host.
        expected: u32,
        /// Revision reported by the processor.
        found: u32,
    },
}

/// The post-processing hook.
///
/// `shots` rows are parallel to `names` and `kinds`: enabled channels first, in
/// configured order, then enabled choppers. Implementations must be callable
/// from any thread; the host invokes them synchronously after each
/// acquisition.
pub trait ShotsProcessor: Send + Sync {
    /// Contract revision this processor was written against.
    fn contract_version(&self) -> u32 {
        CONTRACT_VERSION
    }

    /// Reduce one acquisition's shot vectors into named outputs.
    fn process(
        &self,
        shots: &ShotMatrix,
        names: &[String],
        kinds: &[ShotKind],
    ) -> Result<HookOutput, ProcessingError>;
}

impl<P: ShotsProcessor + ?Sized> ShotsProcessor for Box<P> {
    fn contract_version(&self) -> u32 {
        (**self).contract_version()
    }

    fn process(
        &self,
        shots: &ShotMatrix,
        names: &[String],
        kinds: &[ShotKind],
    ) -> Result<HookOutput, ProcessingError> {
        (**self).process(shots, names, kinds)
    }
}

/// Check that a processor speaks this crate's contract revision.
pub fn check_contract(processor: &dyn ShotsProcessor) -> Result<(), ProcessingError> {
    let found = processor.contract_version();
    if found != CONTRACT_VERSION {
        return Err(ProcessingError::IncompatibleVersion {
            expected: CONTRACT_VERSION,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Legacy;

    impl ShotsProcessor for Legacy {
        fn contract_version(&self) -> u32 {
            0
        }

        fn process(
            &self,
            _shots: &ShotMatrix,
            _names: &[String],
            _kinds: &[ShotKind],
        ) -> Result<HookOutput, ProcessingError> {
            Err(ProcessingError::Execution("unreachable".into()))
        }
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        let err = ShotMatrix::new(vec![vec![1.0, 2.0], vec![3.0]], 2).unwrap_err();
        assert!(err.to_string().contains("row 1 has 1 values"));
    }

    #[test]
    fn test_zeros_shape() {
        let m = ShotMatrix::zeros(3, 5);
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.nshots(), 5);
        assert!(m.rows().iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_contract_version_mismatch() {
        let err = check_contract(&Legacy).unwrap_err();
        assert_eq!(
            err,
            ProcessingError::IncompatibleVersion {
                expected: CONTRACT_VERSION,
                found: 0
            }
        );
    }

    #[test]
    fn test_output_arity() {
        let pair = HookOutput::Pair {
            values: vec![1.0],
            names: vec!["a".into()],
        };
        let triple = HookOutput::Triple {
            values: vec![1.0],
            names: vec!["a".into()],
            signed: vec![true],
        };
        assert_eq!(pair.arity(), 2);
        assert_eq!(triple.arity(), 3);
        assert_eq!(triple.values(), &[1.0]);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ShotKind::Channel.to_string(), "channel");
        assert_eq!(ShotKind::Chopper.as_str(), "chopper");
    }
}
