//! Shared fixtures for integration tests.
#![allow(dead_code)]

use daqmx_tmux::config::{ChannelConfig, ChopperConfig, DaemonConfig};
use daqmx_tmux::hardware::{BackendProbe, SimulatedBackend};
use daqmx_tmux::hook::MeanProcessor;
use daqmx_tmux::{Channel, Chopper, Orchestrator, SampleWindow};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Ten slots, one channel over slots 2..=4, one chopper at slot 8.
pub fn scenario_config() -> DaemonConfig {
    let mut config = DaemonConfig::new(10);
    config.nshots = 4;
    config.retry.min_backoff_ms = 1;
    config.retry.max_backoff_ms = 8;
    config.retry.max_attempts = 4;
    config.channels.insert(
        "ai0".into(),
        ChannelConfig::from(&Channel::new("signal", "ai0", SampleWindow::new(2, 5, 1))),
    );
    config
        .choppers
        .insert("ai7".into(), ChopperConfig::from(&Chopper::new("chopper", "ai7", 8)));
    config
}

/// Orchestrator over `backend` using the mean processor.
pub fn orchestrator_with(
    config: &DaemonConfig,
    backend: SimulatedBackend,
) -> (Orchestrator, BackendProbe) {
    let probe = backend.probe();
    let orchestrator = Orchestrator::new(config, Box::new(backend), Arc::new(MeanProcessor))
        .expect("Failed to create orchestrator");
    (orchestrator, probe)
}

/// Write `contents` to a temporary file.
pub fn temp_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes()).expect("Failed to write temp file");
    file
}
