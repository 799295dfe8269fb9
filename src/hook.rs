//! Post-processing hooks.
//!
//! Two [`ShotsProcessor`] implementations ship with the daemon:
//!
//! - [`MeanProcessor`]: one unsigned output per row, the mean over shots.
//! - [`RhaiShotsProcessor`]: a user script defining
//!   `fn process(shots, names, kinds)`, returning `[values, names]` or
//!   `[values, names, signed]`. `signed` is either one bool for every output
//!   or one bool per output. A script may also define `fn contract_version()`
//!   to declare the hook revision it targets.
//!
//! Whatever a processor returns goes through [`NamedOutputs::from_hook`]
//! before the daemon publishes it.
//!
//! ```text
//! fn process(shots, names, kinds) {
//!     let values = [];
//!     for row in shots { values.push(row[0]); }
//!     [values, names]
//! }
//! ```

use rhai::{Array, Dynamic, Engine, Scope, AST};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use tmux_shots_api::{
    check_contract, HookOutput, ProcessingError, ShotKind, ShotMatrix, ShotsProcessor,
    CONTRACT_VERSION,
};

use crate::error::{AppResult, DaqError};

/// Default per-call operation budget for scripts.
pub const DEFAULT_MAX_OPERATIONS: u64 = 5_000_000;

// Nesting limits for top-level code and function bodies. Rhai's defaults
// differ between debug and release builds.
const MAX_EXPR_DEPTH: usize = 128;
const MAX_FUNCTION_EXPR_DEPTH: usize = 64;

const PROCESS_FN: &str = "process";
const VERSION_FN: &str = "contract_version";

/// One published output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedOutput {
    /// Name declared by the hook.
    pub name: String,
    /// Value for the latest measurement.
    pub value: f64,
    /// Whether the value is signed.
    pub signed: bool,
}

/// Validated hook result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NamedOutputs {
    entries: Vec<NamedOutput>,
}

impl NamedOutputs {
    /// Validate a raw hook result: `values`, `names` and (for triples)
    /// `signed` must all have the same length.
    pub fn from_hook(output: HookOutput) -> Result<Self, ProcessingError> {
        let (values, names, signed) = match output {
            HookOutput::Pair { values, names } => {
                let signed = vec![false; values.len()];
                (values, names, signed)
            }
            HookOutput::Triple {
                values,
                names,
                signed,
            } => (values, names, signed),
        };
        if values.len() != names.len() {
            return Err(ProcessingError::MalformedOutput(format!(
                "{} values for {} names",
                values.len(),
                names.len()
            )));
        }
        if signed.len() != names.len() {
            return Err(ProcessingError::MalformedOutput(format!(
                "{} signed flags for {} names",
                signed.len(),
                names.len()
            )));
        }
        let entries = names
            .into_iter()
            .zip(values)
            .zip(signed)
            .map(|((name, value), signed)| NamedOutput {
                name,
                value,
                signed,
            })
            .collect();
        Ok(Self { entries })
    }

    /// Output names in hook order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Value of the output called `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// All outputs in hook order.
    pub fn iter(&self) -> impl Iterator<Item = &NamedOutput> {
        self.entries.iter()
    }

    /// Number of outputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the hook declared no outputs.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Built-in processor: mean over shots per row, names unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanProcessor;

impl ShotsProcessor for MeanProcessor {
    fn process(
        &self,
        shots: &ShotMatrix,
        names: &[String],
        _kinds: &[ShotKind],
    ) -> Result<HookOutput, ProcessingError> {
        if names.len() != shots.nrows() {
            return Err(ProcessingError::InvalidInput(format!(
                "{} names for {} rows",
                names.len(),
                shots.nrows()
            )));
        }
        let values = shots
            .rows()
            .iter()
            .map(|row| {
                if row.is_empty() {
                    f64::NAN
                } else {
                    row.iter().sum::<f64>() / row.len() as f64
                }
            })
            .collect();
        Ok(HookOutput::Pair {
            values,
            names: names.to_vec(),
        })
    }
}

/// Processor backed by a Rhai script.
pub struct RhaiShotsProcessor {
    engine: Engine,
    ast: AST,
    origin: PathBuf,
    contract_version: u32,
}

impl RhaiShotsProcessor {
    /// Compile the script at `path`.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            DaqError::HookLoad(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_script(&source, path, DEFAULT_MAX_OPERATIONS)
    }

    /// Compile `source`; `origin` is only used in messages.
    pub fn from_script(
        source: &str,
        origin: impl Into<PathBuf>,
        max_operations: u64,
    ) -> AppResult<Self> {
        let origin = origin.into();
        let mut engine = Engine::new();
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FUNCTION_EXPR_DEPTH);
        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {max_operations} operations").into())
            } else {
                None
            }
        });

        let ast = engine.compile(source).map_err(|e| {
            DaqError::HookLoad(format!("'{}' does not compile: {e}", origin.display()))
        })?;

        let has_process = ast
            .iter_functions()
            .any(|f| f.name == PROCESS_FN && f.params.len() == 3);
        if !has_process {
            return Err(DaqError::HookLoad(format!(
                "'{}' must define fn {PROCESS_FN}(shots, names, kinds)",
                origin.display()
            )));
        }

        let declares_version = ast
            .iter_functions()
            .any(|f| f.name == VERSION_FN && f.params.is_empty());
        let contract_version = if declares_version {
            let declared: i64 = engine
                .call_fn(&mut Scope::new(), &ast, VERSION_FN, ())
                .map_err(|e| {
                    DaqError::HookLoad(format!(
                        "'{}': {VERSION_FN}() failed: {e}",
                        origin.display()
                    ))
                })?;
            u32::try_from(declared).map_err(|_| {
                DaqError::HookLoad(format!(
                    "'{}': invalid contract version {declared}",
                    origin.display()
                ))
            })?
        } else {
            CONTRACT_VERSION
        };

        debug!(script = %origin.display(), contract_version, "Compiled shots processing script");
        Ok(Self {
            engine,
            ast,
            origin,
            contract_version,
        })
    }

    /// Script location.
    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

impl std::fmt::Debug for RhaiShotsProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiShotsProcessor")
            .field("origin", &self.origin)
            .field("contract_version", &self.contract_version)
            .finish_non_exhaustive()
    }
}

impl ShotsProcessor for RhaiShotsProcessor {
    fn contract_version(&self) -> u32 {
        self.contract_version
    }

    fn process(
        &self,
        shots: &ShotMatrix,
        names: &[String],
        kinds: &[ShotKind],
    ) -> Result<HookOutput, ProcessingError> {
        let shots: Array = shots
            .rows()
            .iter()
            .map(|row| Dynamic::from_array(row.iter().map(|&v| Dynamic::from_float(v)).collect()))
            .collect();
        let names: Array = names.iter().map(|n| Dynamic::from(n.clone())).collect();
        let kinds: Array = kinds.iter().map(|k| Dynamic::from(k.as_str().to_string())).collect();

        let result: Dynamic = self
            .engine
            .call_fn(&mut Scope::new(), &self.ast, PROCESS_FN, (shots, names, kinds))
            .map_err(|e| ProcessingError::Execution(e.to_string()))?;
        parse_output(result)
    }
}

fn parse_output(result: Dynamic) -> Result<HookOutput, ProcessingError> {
    let type_name = result.type_name();
    let parts = result.try_cast::<Array>().ok_or_else(|| {
        ProcessingError::MalformedOutput(format!("expected an array result, got {type_name}"))
    })?;
    let arity = parts.len();
    if !(2..=3).contains(&arity) {
        return Err(ProcessingError::BadArity { found: arity });
    }

    let mut parts = parts.into_iter();
    let values = float_list(parts.next().unwrap_or(Dynamic::UNIT))?;
    let names = string_list(parts.next().unwrap_or(Dynamic::UNIT))?;
    match parts.next() {
        None => Ok(HookOutput::Pair { values, names }),
        Some(flags) => {
            let signed = match flags.as_bool() {
                Ok(all) => vec![all; values.len()],
                Err(_) => bool_list(flags)?,
            };
            Ok(HookOutput::Triple {
                values,
                names,
                signed,
            })
        }
    }
}

fn array_of(value: Dynamic, what: &str) -> Result<Array, ProcessingError> {
    let type_name = value.type_name();
    value.try_cast::<Array>().ok_or_else(|| {
        ProcessingError::MalformedOutput(format!("{what} must be an array, got {type_name}"))
    })
}

fn float_list(value: Dynamic) -> Result<Vec<f64>, ProcessingError> {
    array_of(value, "values")?
        .into_iter()
        .map(|v| {
            v.as_float()
                .or_else(|_| v.as_int().map(|i| i as f64))
                .map_err(|found| {
                    ProcessingError::MalformedOutput(format!("values must be numbers, got {found}"))
                })
        })
        .collect()
}

fn string_list(value: Dynamic) -> Result<Vec<String>, ProcessingError> {
    array_of(value, "names")?
        .into_iter()
        .map(|v| {
            v.into_string().map_err(|found| {
                ProcessingError::MalformedOutput(format!("names must be strings, got {found}"))
            })
        })
        .collect()
}

fn bool_list(value: Dynamic) -> Result<Vec<bool>, ProcessingError> {
    array_of(value, "signed")?
        .into_iter()
        .map(|v| {
            v.as_bool().map_err(|found| {
                ProcessingError::MalformedOutput(format!("signed flags must be bools, got {found}"))
            })
        })
        .collect()
}

/// Load the configured processor, or [`MeanProcessor`] when no script is set.
pub fn load_processor(path: Option<&Path>) -> AppResult<Arc<dyn ShotsProcessor>> {
    let processor: Arc<dyn ShotsProcessor> = match path {
        Some(path) => {
            info!(script = %path.display(), "Loading shots processing script");
            Arc::new(RhaiShotsProcessor::load(path)?)
        }
        None => Arc::new(MeanProcessor),
    };
    check_contract(processor.as_ref()).map_err(|e| DaqError::HookLoad(e.to_string()))?;
    Ok(processor)
}

/// Run `processor` on a zero-filled matrix to learn the names it publishes.
pub fn discover_output_names(
    processor: &dyn ShotsProcessor,
    names: &[String],
    kinds: &[ShotKind],
    nshots: usize,
) -> Result<Vec<String>, ProcessingError> {
    let zeros = ShotMatrix::zeros(names.len(), nshots);
    let output = processor.process(&zeros, names, kinds)?;
    Ok(NamedOutputs::from_hook(output)?.names())
}
