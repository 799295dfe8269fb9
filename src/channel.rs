//! Channel and chopper records.
//!
//! These are immutable for the duration of an acquisition cycle. A channel owns
//! a signal window and, optionally, a baseline window inside the acquisition
//! window; a chopper owns exactly one slot carrying a square-wave reference.

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, DaqError};

/// Tolerance used when comparing declared ranges to advertised ones.
const RANGE_EPSILON: f64 = 1e-9;

/// Input voltage range of an analog input, in volts.
///
/// Serialized as a two-element `[min, max]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct VoltageRange {
    /// Lower bound in volts.
    pub min: f64,
    /// Upper bound in volts.
    pub max: f64,
}

impl VoltageRange {
    /// Range used for rest slots and chopper slots.
    pub const BIPOLAR_10V: VoltageRange = VoltageRange::new(-10.0, 10.0);

    /// Create a range from explicit bounds.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Symmetric range `±volts`.
    pub const fn symmetric(volts: f64) -> Self {
        Self::new(-volts, volts)
    }

    /// True when both bounds agree within float representation error.
    pub fn matches(&self, other: &VoltageRange) -> bool {
        (self.min - other.min).abs() < RANGE_EPSILON && (self.max - other.max).abs() < RANGE_EPSILON
    }
}

impl From<[f64; 2]> for VoltageRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self::new(min, max)
    }
}

impl From<VoltageRange> for [f64; 2] {
    fn from(range: VoltageRange) -> Self {
        [range.min, range.max]
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}] V", self.min, self.max)
    }
}

/// How the samples of a window are reduced to one value per shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregationMethod {
    /// Arithmetic mean of the selected samples.
    #[default]
    Average,
    /// Sum of the selected samples.
    Sum,
    /// Smallest selected sample.
    Min,
    /// Largest selected sample.
    Max,
}

impl AggregationMethod {
    /// Lowercase name as written in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Average => "average",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
        }
    }

    /// Reduce a block of samples (rows = selected slots, columns = shots)
    /// into one value per shot.
    ///
    /// An empty block sums to zero; the other methods yield NaN.
    pub fn aggregate(&self, block: ArrayView2<'_, f64>) -> Array1<f64> {
        let nshots = block.ncols();
        if block.nrows() == 0 {
            return match self {
                AggregationMethod::Sum => Array1::zeros(nshots),
                _ => Array1::from_elem(nshots, f64::NAN),
            };
        }
        match self {
            AggregationMethod::Average => block
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::from_elem(nshots, f64::NAN)),
            AggregationMethod::Sum => block.sum_axis(Axis(0)),
            AggregationMethod::Min => {
                block.fold_axis(Axis(0), f64::INFINITY, |&acc, &v| acc.min(v))
            }
            AggregationMethod::Max => {
                block.fold_axis(Axis(0), f64::NEG_INFINITY, |&acc, &v| acc.max(v))
            }
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "average" => Ok(AggregationMethod::Average),
            "sum" => Ok(AggregationMethod::Sum),
            "min" => Ok(AggregationMethod::Min),
            "max" => Ok(AggregationMethod::Max),
            _ => Err(DaqError::UnknownAggregationMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for AggregationMethod {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AggregationMethod> for String {
    fn from(method: AggregationMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A span of slot indices within the acquisition window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleWindow {
    /// First slot of the window.
    pub start: usize,
    /// Last slot of the window.
    pub stop: usize,
    /// Number of slots ahead of `start` the window also claims.
    pub presample: usize,
}

impl SampleWindow {
    /// Create a window.
    pub const fn new(start: usize, stop: usize, presample: usize) -> Self {
        Self {
            start,
            stop,
            presample,
        }
    }

    /// Whether slot `index` is claimed: `start - presample < index < stop`.
    ///
    /// Both bounds are strict, so `stop` itself is never claimed.
    // TODO: confirm with the calibration owners whether `stop` should be
    // claimed; existing channel setups were tuned against this boundary.
    pub fn claims(&self, index: usize) -> bool {
        let lower = self.start as i64 - self.presample as i64;
        let index = index as i64;
        lower < index && index < self.stop as i64
    }

    fn validate(&self, nsamples: usize, owner: &str, label: &str) -> Result<(), String> {
        if self.stop < self.start {
            return Err(format!(
                "{owner}: {label}_stop ({}) is before {label}_start ({})",
                self.stop, self.start
            ));
        }
        if self.presample > self.start {
            return Err(format!(
                "{owner}: {label}_presample ({}) exceeds {label}_start ({})",
                self.presample, self.start
            ));
        }
        if self.stop >= nsamples {
            return Err(format!(
                "{owner}: {label}_stop ({}) outside acquisition window of {nsamples} samples",
                self.stop
            ));
        }
        Ok(())
    }
}

/// An analog input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Name handed to the post-processing hook.
    pub name: String,
    /// Hardware address of the analog input.
    pub physical_channel: String,
    /// Disabled channels claim no slots and produce no shot row.
    pub enabled: bool,
    /// Declared input range; must equal one advertised by the hardware.
    pub range: VoltageRange,
    /// Negate the shot values.
    pub invert: bool,
    /// Signal window.
    pub signal: SampleWindow,
    /// Reduction applied to signal samples.
    pub signal_method: AggregationMethod,
    /// Subtract a baseline measured in `baseline`.
    pub use_baseline: bool,
    /// Baseline window, only consulted when `use_baseline` is set.
    pub baseline: SampleWindow,
    /// Reduction applied to baseline samples.
    pub baseline_method: AggregationMethod,
}

impl Channel {
    /// Enabled channel with a signal window and no baseline.
    pub fn new(
        name: impl Into<String>,
        physical_channel: impl Into<String>,
        signal: SampleWindow,
    ) -> Self {
        Self {
            name: name.into(),
            physical_channel: physical_channel.into(),
            enabled: true,
            range: VoltageRange::BIPOLAR_10V,
            invert: false,
            signal,
            signal_method: AggregationMethod::Average,
            use_baseline: false,
            baseline: SampleWindow::default(),
            baseline_method: AggregationMethod::Average,
        }
    }

    /// Builder method to attach a baseline window.
    pub fn with_baseline(mut self, baseline: SampleWindow, method: AggregationMethod) -> Self {
        self.use_baseline = true;
        self.baseline = baseline;
        self.baseline_method = method;
        self
    }

    /// Whether the signal window, or the baseline window when in use, claims
    /// `index`. Does not look at `enabled`.
    pub fn claims(&self, index: usize) -> bool {
        self.signal.claims(index) || (self.use_baseline && self.baseline.claims(index))
    }
}

/// A chopper reference input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chopper {
    /// Name handed to the post-processing hook.
    pub name: String,
    /// Hardware address of the analog input.
    pub physical_channel: String,
    /// Disabled choppers claim no slot and produce no shot row.
    pub enabled: bool,
    /// Swap the sign of the demodulated values.
    pub invert: bool,
    /// The single slot read from this chopper.
    pub index: usize,
}

impl Chopper {
    /// Enabled, non-inverted chopper.
    pub fn new(name: impl Into<String>, physical_channel: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            physical_channel: physical_channel.into(),
            enabled: true,
            invert: false,
            index,
        }
    }
}

/// Check windows, chopper indices and physical-address uniqueness.
///
/// Addresses must be pairwise unique across channels and choppers, enabled or
/// not; a duplicate would make the ownership table ambiguous.
pub fn validate_layout(
    channels: &[Channel],
    choppers: &[Chopper],
    nsamples: usize,
) -> AppResult<()> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    let names = channels
        .iter()
        .map(|c| (c.physical_channel.as_str(), c.name.as_str()))
        .chain(choppers.iter().map(|c| (c.physical_channel.as_str(), c.name.as_str())));
    for (address, name) in names {
        if let Some(previous) = owners.insert(address, name) {
            return Err(DaqError::Configuration(format!(
                "Duplicate physical channel '{}' used by '{}' and '{}'",
                address, previous, name
            )));
        }
    }

    for channel in channels {
        if channel.range.min >= channel.range.max {
            return Err(DaqError::Configuration(format!(
                "{}: range minimum must be below maximum, got {}",
                channel.name, channel.range
            )));
        }
        channel
            .signal
            .validate(nsamples, &channel.name, "signal")
            .map_err(DaqError::Configuration)?;
        if channel.use_baseline {
            channel
                .baseline
                .validate(nsamples, &channel.name, "baseline")
                .map_err(DaqError::Configuration)?;
        }
    }

    for chopper in choppers {
        if chopper.index >= nsamples {
            return Err(DaqError::Configuration(format!(
                "{}: chopper index {} outside acquisition window of {} samples",
                chopper.name, chopper.index, nsamples
            )));
        }
    }
    Ok(())
}

/// Every channel's range must match one of the hardware-advertised ranges.
///
/// The error lists all offending channels, not just the first.
pub fn validate_ranges(channels: &[Channel], advertised: &[VoltageRange]) -> AppResult<()> {
    let offending: Vec<String> = channels
        .iter()
        .filter(|c| !advertised.iter().any(|r| r.matches(&c.range)))
        .map(|c| c.name.clone())
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(DaqError::InvalidVoltageRange { channels: offending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_aggregation_methods() {
        // Three signal rows, each holding [1], [2], [3] for two shots.
        let block = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        assert_eq!(AggregationMethod::Average.aggregate(block.view()), array![2.0, 2.0]);
        assert_eq!(AggregationMethod::Sum.aggregate(block.view()), array![6.0, 6.0]);
        assert_eq!(AggregationMethod::Min.aggregate(block.view()), array![1.0, 1.0]);
        assert_eq!(AggregationMethod::Max.aggregate(block.view()), array![3.0, 3.0]);
    }

    #[test]
    fn test_aggregation_is_per_shot() {
        let block = array![[1.0, 10.0], [3.0, -10.0]];
        assert_eq!(AggregationMethod::Average.aggregate(block.view()), array![2.0, 0.0]);
        assert_eq!(AggregationMethod::Max.aggregate(block.view()), array![3.0, 10.0]);
    }

    #[test]
    fn test_empty_block() {
        let block = ndarray::Array2::<f64>::zeros((0, 3));
        assert_eq!(AggregationMethod::Sum.aggregate(block.view()), array![0.0, 0.0, 0.0]);
        assert!(AggregationMethod::Average
            .aggregate(block.view())
            .iter()
            .all(|v| v.is_nan()));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("Average".parse::<AggregationMethod>().unwrap(), AggregationMethod::Average);
        assert_eq!("MAX".parse::<AggregationMethod>().unwrap(), AggregationMethod::Max);
        let err = "median".parse::<AggregationMethod>().unwrap_err();
        assert!(matches!(err, DaqError::UnknownAggregationMethod(ref m) if m == "median"));
    }

    #[test]
    fn test_window_claims_are_strict() {
        let window = SampleWindow::new(2, 5, 1);
        let claimed: Vec<usize> = (0..10).filter(|i| window.claims(*i)).collect();
        assert_eq!(claimed, vec![2, 3, 4]);

        let no_presample = SampleWindow::new(2, 5, 0);
        let claimed: Vec<usize> = (0..10).filter(|i| no_presample.claims(*i)).collect();
        assert_eq!(claimed, vec![3, 4]);
    }

    #[test]
    fn test_duplicate_physical_channel_rejected() {
        let channels = vec![Channel::new("a", "ai0", SampleWindow::new(1, 3, 0))];
        let choppers = vec![Chopper::new("chop", "ai0", 5)];
        let err = validate_layout(&channels, &choppers, 10).unwrap_err();
        assert!(err.to_string().contains("Duplicate physical channel 'ai0'"));
    }

    #[test]
    fn test_window_validation() {
        let backwards = vec![Channel::new("a", "ai0", SampleWindow::new(5, 3, 0))];
        assert!(validate_layout(&backwards, &[], 10).is_err());

        let presample = vec![Channel::new("a", "ai0", SampleWindow::new(1, 3, 2))];
        assert!(validate_layout(&presample, &[], 10).is_err());

        let outside = vec![Channel::new("a", "ai0", SampleWindow::new(1, 10, 0))];
        assert!(validate_layout(&outside, &[], 10).is_err());

        let chopper = vec![Chopper::new("chop", "ai1", 10)];
        assert!(validate_layout(&[], &chopper, 10).is_err());
    }

    #[test]
    fn test_baseline_window_only_checked_when_used() {
        let mut channel = Channel::new("a", "ai0", SampleWindow::new(1, 3, 0));
        channel.baseline = SampleWindow::new(50, 60, 0);
        assert!(validate_layout(&[channel.clone()], &[], 10).is_ok());
        channel.use_baseline = true;
        assert!(validate_layout(&[channel], &[], 10).is_err());
    }

    #[test]
    fn test_range_validation_lists_all_offenders() {
        let advertised = [VoltageRange::symmetric(1.0), VoltageRange::symmetric(10.0)];
        let mut a = Channel::new("a", "ai0", SampleWindow::new(1, 3, 0));
        a.range = VoltageRange::symmetric(3.0);
        let b = Channel::new("b", "ai1", SampleWindow::new(1, 3, 0));
        let mut c = Channel::new("c", "ai2", SampleWindow::new(1, 3, 0));
        c.range = VoltageRange::new(0.0, 10.0);

        let err = validate_ranges(&[a, b, c], &advertised).unwrap_err();
        match err {
            DaqError::InvalidVoltageRange { channels } => assert_eq!(channels, vec!["a", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_range_serde_as_pair() {
        let range: VoltageRange = serde_json::from_str("[-0.5, 0.5]").unwrap();
        assert!(range.matches(&VoltageRange::symmetric(0.5)));
        assert_eq!(serde_json::to_string(&range).unwrap(), "[-0.5,0.5]");
    }
}
