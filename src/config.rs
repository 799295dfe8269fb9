//! Daemon configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQMX_TMUX_`, nested keys
//!    separated by `__`
//!
//! ```text
//! DAQMX_TMUX_NSHOTS=500
//! DAQMX_TMUX_LOG_LEVEL=debug
//! DAQMX_TMUX_RETRY__MAX_ATTEMPTS=3
//! ```
//!
//! Channels and choppers are tables keyed by physical address. They keep the
//! order in which the file lists them, which fixes their 1-indexed ids in the
//! ownership table and the row order handed to the hook. Entries that only
//! come from the environment follow, by address.
//!
//! # Example
//!
//! ```no_run
//! use daqmx_tmux::config::DaemonConfig;
//!
//! let config = DaemonConfig::load_from("config/daqmx-tmux.toml")?;
//! println!("{} slots, {} channels", config.nsamples, config.channels.len());
//! # Ok::<(), daqmx_tmux::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{self, AggregationMethod, Channel, Chopper, SampleWindow, VoltageRange};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::DeviceSettings;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daqmx-tmux.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQMX_TMUX_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Number of slots in the acquisition window.
    pub nsamples: usize,
    /// Device name as known to the driver.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Physical input read during rest slots.
    #[serde(default = "default_rest_channel")]
    pub rest_channel: String,
    /// Terminal supplying the external sample clock.
    #[serde(default = "default_trigger_source")]
    pub trigger_source: String,
    /// Per-read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Nominal sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Rhai post-processing script. Absent means per-row means.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shots_processing_path: Option<PathBuf>,
    /// Initial number of shots per measurement.
    #[serde(default = "default_nshots")]
    pub nshots: usize,
    /// Initial delay before each read, in milliseconds.
    #[serde(default)]
    pub ms_wait: u64,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Read retry bounds.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Analog channels keyed by physical address.
    #[serde(default)]
    pub channels: IndexMap<String, ChannelConfig>,
    /// Choppers keyed by physical address.
    #[serde(default)]
    pub choppers: IndexMap<String, ChopperConfig>,
}

/// Read retry bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Wait after the first failed read.
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    /// Wait after the last scheduled failed read.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Attempts before a measurement fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// One analog channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Name handed to the post-processing hook.
    pub name: String,
    /// Input range `[min, max]` in volts.
    #[serde(default = "default_range")]
    pub range: VoltageRange,
    /// Disabled channels keep their id but claim no slots.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Negate shot values.
    #[serde(default)]
    pub invert: bool,
    /// First slot of the signal window.
    #[serde(default)]
    pub signal_start: usize,
    /// Last slot of the signal window.
    #[serde(default)]
    pub signal_stop: usize,
    /// Slots claimed ahead of `signal_start`.
    #[serde(default)]
    pub signal_presample: usize,
    /// Reduction over signal slots.
    #[serde(default)]
    pub signal_method: AggregationMethod,
    /// Subtract a baseline window.
    #[serde(default)]
    pub use_baseline: bool,
    /// First slot of the baseline window.
    #[serde(default)]
    pub baseline_start: usize,
    /// Last slot of the baseline window.
    #[serde(default)]
    pub baseline_stop: usize,
    /// Slots claimed ahead of `baseline_start`.
    #[serde(default)]
    pub baseline_presample: usize,
    /// Reduction over baseline slots.
    #[serde(default)]
    pub baseline_method: AggregationMethod,
}

/// One chopper reference input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChopperConfig {
    /// Name handed to the post-processing hook.
    pub name: String,
    /// Disabled choppers keep their id but claim no slot.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Swap the sign of demodulated values.
    #[serde(default)]
    pub invert: bool,
    /// Slot read from this chopper.
    pub index: usize,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_device_name() -> String {
    "Dev1".to_string()
}

fn default_rest_channel() -> String {
    "ai15".to_string()
}

fn default_trigger_source() -> String {
    "/Dev1/PFI0".to_string()
}

fn default_timeout() -> f64 {
    10.0
}

fn default_sample_rate() -> f64 {
    1000.0
}

fn default_nshots() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_range() -> VoltageRange {
    VoltageRange::BIPOLAR_10V
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Conversions
// ============================================================================

impl ChannelConfig {
    /// Model record for this entry.
    pub fn to_channel(&self, physical_channel: &str) -> Channel {
        Channel {
            name: self.name.clone(),
            physical_channel: physical_channel.to_string(),
            enabled: self.enabled,
            range: self.range,
            invert: self.invert,
            signal: SampleWindow::new(self.signal_start, self.signal_stop, self.signal_presample),
            signal_method: self.signal_method,
            use_baseline: self.use_baseline,
            baseline: SampleWindow::new(
                self.baseline_start,
                self.baseline_stop,
                self.baseline_presample,
            ),
            baseline_method: self.baseline_method,
        }
    }
}

impl From<&Channel> for ChannelConfig {
    fn from(channel: &Channel) -> Self {
        Self {
            name: channel.name.clone(),
            range: channel.range,
            enabled: channel.enabled,
            invert: channel.invert,
            signal_start: channel.signal.start,
            signal_stop: channel.signal.stop,
            signal_presample: channel.signal.presample,
            signal_method: channel.signal_method,
            use_baseline: channel.use_baseline,
            baseline_start: channel.baseline.start,
            baseline_stop: channel.baseline.stop,
            baseline_presample: channel.baseline.presample,
            baseline_method: channel.baseline_method,
        }
    }
}

impl ChopperConfig {
    /// Model record for this entry.
    pub fn to_chopper(&self, physical_channel: &str) -> Chopper {
        Chopper {
            name: self.name.clone(),
            physical_channel: physical_channel.to_string(),
            enabled: self.enabled,
            invert: self.invert,
            index: self.index,
        }
    }
}

impl From<&Chopper> for ChopperConfig {
    fn from(chopper: &Chopper) -> Self {
        Self {
            name: chopper.name.clone(),
            enabled: chopper.enabled,
            invert: chopper.invert,
            index: chopper.index,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DaemonConfig {
    /// Minimal configuration with no channels, used as a starting point by
    /// tests and tools.
    pub fn new(nsamples: usize) -> Self {
        Self {
            nsamples,
            device_name: default_device_name(),
            rest_channel: default_rest_channel(),
            trigger_source: default_trigger_source(),
            timeout: default_timeout(),
            sample_rate: default_sample_rate(),
            shots_processing_path: None,
            nshots: default_nshots(),
            ms_wait: 0,
            log_level: default_log_level(),
            retry: RetryConfig::default(),
            channels: IndexMap::new(),
            choppers: IndexMap::new(),
        }
    }

    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, apply environment
    /// overrides, then validate.
    ///
    /// # Errors
    ///
    /// `DaqError::Config` if the file or environment cannot be parsed
    /// (including unknown aggregation methods), `DaqError::Configuration`
    /// if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let source = match std::fs::read_to_string(path) {
            Ok(source) => Some(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Self::from_figment(Self::figment(path), source.as_deref())
    }

    /// Provider stack used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate from an arbitrary provider stack.
    ///
    /// Figment hands tables back sorted by key; `source`, the TOML text of
    /// the base file, restores the listed order of channels and choppers.
    pub fn from_figment(figment: Figment, source: Option<&str>) -> AppResult<Self> {
        let mut config: Self = figment.extract()?;
        if let Some(source) = source {
            config.apply_source_order(source)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_source_order(&mut self, source: &str) -> AppResult<()> {
        let document: toml::Table = toml::from_str(source)
            .map_err(|e| DaqError::Configuration(format!("Failed to parse configuration: {e}")))?;
        let listed = |section: &str| -> Vec<String> {
            document
                .get(section)
                .and_then(toml::Value::as_table)
                .map(|table| table.keys().cloned().collect())
                .unwrap_or_default()
        };
        sort_by_listing(&mut self.channels, &listed("channels"));
        sort_by_listing(&mut self.choppers, &listed("choppers"));
        Ok(())
    }

    /// Validate configuration after loading.
    ///
    /// Range-against-hardware checks need a backend and happen when the
    /// orchestrator starts.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        if self.nsamples == 0 {
            return Err(DaqError::Configuration("nsamples must be > 0".into()));
        }
        if self.nshots == 0 {
            return Err(DaqError::Configuration("nshots must be > 0".into()));
        }
        if !(self.timeout.is_finite() && self.timeout > 0.0) {
            return Err(DaqError::Configuration(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout
            )));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(DaqError::Configuration("retry.max_attempts must be > 0".into()));
        }
        if retry.min_backoff_ms == 0 || retry.max_backoff_ms < retry.min_backoff_ms {
            return Err(DaqError::Configuration(format!(
                "retry backoff must satisfy 0 < min_backoff_ms ({}) <= max_backoff_ms ({})",
                retry.min_backoff_ms, retry.max_backoff_ms
            )));
        }

        channel::validate_layout(&self.channels(), &self.choppers(), self.nsamples)
    }

    /// Channel records in id order.
    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|(address, entry)| entry.to_channel(address))
            .collect()
    }

    /// Chopper records in id order.
    pub fn choppers(&self) -> Vec<Chopper> {
        self.choppers
            .iter()
            .map(|(address, entry)| entry.to_chopper(address))
            .collect()
    }

    /// Replace the channel and chopper tables from model records.
    pub fn set_layout(&mut self, channels: &[Channel], choppers: &[Chopper]) {
        self.channels = channels
            .iter()
            .map(|c| (c.physical_channel.clone(), ChannelConfig::from(c)))
            .collect();
        self.choppers = choppers
            .iter()
            .map(|c| (c.physical_channel.clone(), ChopperConfig::from(c)))
            .collect();
    }

    /// Device-wide acquisition parameters.
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            device_name: self.device_name.clone(),
            rest_channel: self.rest_channel.clone(),
            trigger_source: self.trigger_source.clone(),
            sample_rate: self.sample_rate,
            timeout: Duration::try_from_secs_f64(self.timeout)
                .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout())),
        }
    }

    /// Retry policy for reads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.min_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
        )
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Failed to serialize configuration: {e}")))
    }
}

// Stable: unlisted keys keep their relative order after the listed ones.
fn sort_by_listing<V>(entries: &mut IndexMap<String, V>, listed: &[String]) {
    let rank = |key: &String| {
        listed
            .iter()
            .position(|k| k == key)
            .unwrap_or(listed.len())
    };
    entries.sort_by(|a, _, b, _| rank(a).cmp(&rank(b)));
}
