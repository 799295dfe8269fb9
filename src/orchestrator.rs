//! Measurement orchestration.
//!
//! One [`Orchestrator`] drives the acquisition cycle
//! `Idle → TaskBuilding → Reading → Processing → Idle`. It is a cheap handle:
//! clones share the same daemon state, so control-plane calls (reading
//! results, changing the shot count) can be served from other tasks while a
//! measurement is in flight.
//!
//! State is split in two:
//!
//! - control-plane state (shot count, `ms_wait`, the stale flag, the current
//!   layout and the last published measurement) is readable at any time;
//! - the cycle context (backend and active task) sits behind an async mutex
//!   that only [`Orchestrator::measure`] takes, so at most one cycle runs.
//!
//! A configuration change only sets the stale flag. The cycle looks at it
//! before building a task and again after every read; a buffer read while the
//! flag was raised is dropped and the cycle restarts from `TaskBuilding`.

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use tmux_shots_api::{check_contract, ShotKind, ShotsProcessor};

use crate::channel::{self, Channel, Chopper, VoltageRange};
use crate::config::DaemonConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_backoff, RetryError, RetryPolicy};
use crate::hardware::{
    self, AcquisitionBackend, BackendError, DeviceSettings, RawSamples, SharedBackend,
    TaskHandle, TaskSpec,
};
use crate::hook::{self, NamedOutputs};
use crate::processing::{self, ShotVectorSet};
use crate::scheduler::OwnershipTable;

/// Phase of the measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeasurementState {
    /// No cycle in flight.
    Idle,
    /// Tearing down and rebuilding the hardware task.
    TaskBuilding,
    /// Waiting on the hardware read.
    Reading,
    /// Demultiplexing and running the hook.
    Processing,
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MeasurementState::Idle => "idle",
            MeasurementState::TaskBuilding => "task_building",
            MeasurementState::Reading => "reading",
            MeasurementState::Processing => "processing",
        };
        f.write_str(s)
    }
}

/// Durations recorded for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleTiming {
    /// From the start of the cycle to publication.
    pub acquisition: Duration,
    /// Demultiplexing plus hook.
    pub processing: Duration,
    /// Since the previous published cycle, if any.
    pub since_last: Option<Duration>,
}

/// Result of one successful cycle.
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Sequence number, starting at 1.
    pub id: u64,
    /// Table the buffer was read against.
    pub table: OwnershipTable,
    /// Raw buffer.
    pub raw: RawSamples,
    /// Demultiplexed shots.
    pub shots: ShotVectorSet,
    /// Hook outputs.
    pub outputs: NamedOutputs,
    /// Cycle durations.
    pub timing: CycleTiming,
}

/// Everything derived from one channel/chopper configuration.
#[derive(Debug)]
struct Layout {
    channels: Vec<Channel>,
    choppers: Vec<Chopper>,
    table: OwnershipTable,
    row_names: Vec<String>,
    row_kinds: Vec<ShotKind>,
    output_names: Vec<String>,
}

impl Layout {
    fn build(
        channels: Vec<Channel>,
        choppers: Vec<Chopper>,
        nsamples: usize,
        ranges: &[VoltageRange],
        processor: &dyn ShotsProcessor,
        nshots: usize,
    ) -> AppResult<Self> {
        channel::validate_layout(&channels, &choppers, nsamples)?;
        channel::validate_ranges(&channels, ranges)?;

        let table = OwnershipTable::build(&channels, &choppers, nsamples);
        let mut row_names = Vec::new();
        let mut row_kinds = Vec::new();
        for c in channels.iter().filter(|c| c.enabled) {
            row_names.push(c.name.clone());
            row_kinds.push(ShotKind::Channel);
        }
        for c in choppers.iter().filter(|c| c.enabled) {
            row_names.push(c.name.clone());
            row_kinds.push(ShotKind::Chopper);
        }
        let output_names = hook::discover_output_names(processor, &row_names, &row_kinds, nshots)?;

        Ok(Self {
            channels,
            choppers,
            table,
            row_names,
            row_kinds,
            output_names,
        })
    }
}

struct ActiveTask {
    handle: TaskHandle,
    nshots: usize,
    layout: Arc<Layout>,
}

struct CycleContext {
    backend: SharedBackend,
    task: Option<ActiveTask>,
    last_published: Option<Instant>,
}

struct Shared {
    nsamples: usize,
    device: DeviceSettings,
    retry: RetryPolicy,
    ranges: Vec<VoltageRange>,
    processor: Arc<dyn ShotsProcessor>,

    nshots: AtomicUsize,
    ms_wait: AtomicU64,
    stale: AtomicBool,
    count: AtomicU64,
    state: RwLock<MeasurementState>,
    layout: RwLock<Arc<Layout>>,
    last: RwLock<Option<Arc<Measurement>>>,

    cycle: Mutex<CycleContext>,
}

/// Reports `Idle` once a cycle ends, including when its future is dropped.
struct IdleOnDrop<'a>(&'a Orchestrator);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set_state(MeasurementState::Idle);
    }
}

/// Handle to the measurement cycle and its control-plane state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("nshots", &self.nshots())
            .field("stale", &self.is_stale())
            .field("measurements", &self.measurement_count())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Validate `config` against `backend`, build the ownership table and
    /// discover the hook's output names.
    ///
    /// Fails on any configuration error, including channel ranges the backend
    /// does not advertise. The hardware task is not built until the first
    /// measurement.
    pub fn new(
        config: &DaemonConfig,
        backend: Box<dyn AcquisitionBackend>,
        processor: Arc<dyn ShotsProcessor>,
    ) -> AppResult<Self> {
        config.validate()?;
        check_contract(processor.as_ref()).map_err(|e| DaqError::HookLoad(e.to_string()))?;

        let ranges = backend.voltage_ranges()?;
        let layout = Layout::build(
            config.channels(),
            config.choppers(),
            config.nsamples,
            &ranges,
            processor.as_ref(),
            config.nshots,
        )?;
        info!(
            nsamples = config.nsamples,
            channels = layout.channels.len(),
            choppers = layout.choppers.len(),
            table = %layout.table,
            outputs = ?layout.output_names,
            "Orchestrator ready"
        );

        let shared = Shared {
            nsamples: config.nsamples,
            device: config.device_settings(),
            retry: config.retry_policy(),
            ranges,
            processor,
            nshots: AtomicUsize::new(config.nshots),
            ms_wait: AtomicU64::new(config.ms_wait),
            stale: AtomicBool::new(true),
            count: AtomicU64::new(0),
            state: RwLock::new(MeasurementState::Idle),
            layout: RwLock::new(Arc::new(layout)),
            last: RwLock::new(None),
            cycle: Mutex::new(CycleContext {
                backend: hardware::share(backend),
                task: None,
                last_published: None,
            }),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Like [`new`](Self::new), loading the hook named by
    /// `shots_processing_path`.
    pub fn from_config(
        config: &DaemonConfig,
        backend: Box<dyn AcquisitionBackend>,
    ) -> AppResult<Self> {
        let processor = hook::load_processor(config.shots_processing_path.as_deref())?;
        Self::new(config, backend, processor)
    }

    // ------------------------------------------------------------------
    // Measurement cycle
    // ------------------------------------------------------------------

    /// Run one measurement cycle.
    ///
    /// # Errors
    ///
    /// - `MeasurementInProgress` if another cycle holds the hardware
    /// - `TaskBuild` if the task could not be built; the next call retries
    /// - `AcquisitionFailed` once every read attempt failed; the task is
    ///   cleared and rebuilt by the next call
    /// - hook and processing errors; nothing is published
    pub async fn measure(&self) -> AppResult<Arc<Measurement>> {
        let mut cycle = self
            .shared
            .cycle
            .try_lock()
            .map_err(|_| DaqError::MeasurementInProgress)?;
        let _idle = IdleOnDrop(self);
        self.run_cycle(&mut cycle).await
    }

    async fn run_cycle(&self, cycle: &mut CycleContext) -> AppResult<Arc<Measurement>> {
        let started = Instant::now();
        loop {
            if self.shared.stale.swap(false, Ordering::SeqCst) || cycle.task.is_none() {
                self.set_state(MeasurementState::TaskBuilding);
                if let Err(e) = self.build_task(cycle).await {
                    self.shared.stale.store(true, Ordering::SeqCst);
                    error!(error = %e, "Failed to build acquisition task");
                    return Err(e);
                }
            }
            let (handle, nshots, layout) = match &cycle.task {
                Some(task) => (task.handle, task.nshots, task.layout.clone()),
                None => {
                    return Err(DaqError::Processing("no acquisition task after build".into()))
                }
            };

            let wait = self.ms_wait();
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }

            self.set_state(MeasurementState::Reading);
            let raw = match self.read_with_retry(&cycle.backend, handle, nshots).await {
                Ok(raw) => raw,
                Err(RetryError::Exhausted { attempts, last }) => {
                    error!(attempts, error = %last, "Acquisition failed, clearing task");
                    self.clear_task(cycle).await;
                    return Err(DaqError::AcquisitionFailed { attempts, last });
                }
            };

            if self.shared.stale.load(Ordering::SeqCst) {
                warn!(nshots, "Configuration changed during read, discarding stale buffer");
                continue;
            }

            self.set_state(MeasurementState::Processing);
            let processing_started = Instant::now();
            let shots =
                processing::process(&raw, &layout.table, &layout.channels, &layout.choppers)?;
            let output = self.shared.processor.process(
                &shots.to_matrix()?,
                &layout.row_names,
                &layout.row_kinds,
            )?;
            let outputs = NamedOutputs::from_hook(output)?;
            let processing = processing_started.elapsed();

            let now = Instant::now();
            let since_last = cycle.last_published.map(|t| now.duration_since(t));
            cycle.last_published = Some(now);

            let id = self.shared.count.fetch_add(1, Ordering::SeqCst) + 1;
            let measurement = Arc::new(Measurement {
                id,
                table: layout.table.clone(),
                raw,
                shots,
                outputs,
                timing: CycleTiming {
                    acquisition: now.duration_since(started),
                    processing,
                    since_last,
                },
            });
            *self.shared.last.write() = Some(measurement.clone());
            info!(
                id,
                nshots,
                acquisition_ms = measurement.timing.acquisition.as_millis() as u64,
                "Measurement complete"
            );
            return Ok(measurement);
        }
    }

    async fn build_task(&self, cycle: &mut CycleContext) -> AppResult<()> {
        let layout = self.shared.layout.read().clone();
        let nshots = self.nshots();
        let spec = TaskSpec::resolve(
            &layout.table,
            &layout.channels,
            &layout.choppers,
            &self.shared.device,
            nshots,
        )?;

        let previous = cycle.task.take().map(|t| t.handle);
        let backend = cycle.backend.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut backend = backend.blocking_lock();
            if let Some(previous) = previous {
                backend.clear(previous);
            }
            backend.configure(&spec)
        })
        .await?
        .map_err(DaqError::TaskBuild)?;

        info!(task = handle.id(), nshots, table = %layout.table, "Acquisition task built");
        cycle.task = Some(ActiveTask {
            handle,
            nshots,
            layout,
        });
        Ok(())
    }

    async fn read_with_retry(
        &self,
        backend: &SharedBackend,
        handle: TaskHandle,
        nshots: usize,
    ) -> Result<RawSamples, RetryError<BackendError>> {
        retry_with_backoff(&self.shared.retry, |attempt| {
            let backend = backend.clone();
            async move {
                debug!(attempt, task = handle.id(), nshots, "Reading");
                let joined = tokio::task::spawn_blocking(move || {
                    let mut backend = backend.blocking_lock();
                    let result = backend.read(handle, nshots);
                    if result.is_err() {
                        if let Err(e) = backend.stop(handle) {
                            warn!(error = %e, "Failed to stop task after read error");
                        }
                    }
                    result
                })
                .await;
                joined.unwrap_or_else(|e| {
                    Err(BackendError::Read(format!("read worker failed: {e}")))
                })
            }
        })
        .await
    }

    async fn clear_task(&self, cycle: &mut CycleContext) {
        let Some(task) = cycle.task.take() else {
            return;
        };
        let backend = cycle.backend.clone();
        let cleared = tokio::task::spawn_blocking(move || {
            backend.blocking_lock().clear(task.handle);
        })
        .await;
        if let Err(e) = cleared {
            warn!(error = %e, "Failed to clear acquisition task");
        }
    }

    /// Release the hardware task, waiting for any cycle in flight.
    pub async fn shutdown(&self) {
        let mut cycle = self.shared.cycle.lock().await;
        self.clear_task(&mut cycle).await;
        self.shared.stale.store(true, Ordering::SeqCst);
        info!("Acquisition task released");
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Replace the channel and chopper configuration.
    ///
    /// Validates addresses, windows and ranges, rebuilds the table,
    /// rediscovers output names and marks the task stale. On error nothing
    /// changes.
    pub fn reconfigure(&self, channels: Vec<Channel>, choppers: Vec<Chopper>) -> AppResult<()> {
        let layout = Layout::build(
            channels,
            choppers,
            self.shared.nsamples,
            &self.shared.ranges,
            self.shared.processor.as_ref(),
            self.nshots(),
        )?;
        info!(table = %layout.table, outputs = ?layout.output_names, "Channel layout updated");
        *self.shared.layout.write() = Arc::new(layout);
        self.mark_stale();
        Ok(())
    }

    /// Shots per measurement.
    pub fn nshots(&self) -> usize {
        self.shared.nshots.load(Ordering::SeqCst)
    }

    /// Change the shot count; takes effect on the next task build.
    pub fn set_nshots(&self, nshots: usize) -> AppResult<()> {
        if nshots == 0 {
            return Err(DaqError::Configuration("nshots must be > 0".into()));
        }
        self.shared.nshots.store(nshots, Ordering::SeqCst);
        self.mark_stale();
        debug!(nshots, "Shot count changed");
        Ok(())
    }

    /// Delay before each read, in milliseconds.
    pub fn ms_wait(&self) -> u64 {
        self.shared.ms_wait.load(Ordering::SeqCst)
    }

    /// Change the delay before each read.
    pub fn set_ms_wait(&self, ms_wait: u64) {
        self.shared.ms_wait.store(ms_wait, Ordering::SeqCst);
    }

    /// Whether the next cycle rebuilds the task.
    pub fn is_stale(&self) -> bool {
        self.shared.stale.load(Ordering::SeqCst)
    }

    fn mark_stale(&self) {
        self.shared.stale.store(true, Ordering::SeqCst);
    }

    /// Current cycle phase.
    pub fn state(&self) -> MeasurementState {
        *self.shared.state.read()
    }

    fn set_state(&self, state: MeasurementState) {
        *self.shared.state.write() = state;
    }

    /// Ownership table for the current layout.
    pub fn ownership_table(&self) -> OwnershipTable {
        self.shared.layout.read().table.clone()
    }

    /// Input ranges advertised by the hardware.
    pub fn voltage_ranges(&self) -> Vec<VoltageRange> {
        self.shared.ranges.clone()
    }

    /// Output names declared by the hook.
    pub fn channel_names(&self) -> Vec<String> {
        self.shared.layout.read().output_names.clone()
    }

    /// Configured channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.shared.layout.read().channels.clone()
    }

    /// Configured choppers.
    pub fn choppers(&self) -> Vec<Chopper> {
        self.shared.layout.read().choppers.clone()
    }

    /// Number of published measurements.
    pub fn measurement_count(&self) -> u64 {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Latest published measurement.
    pub fn last_measurement(&self) -> Option<Arc<Measurement>> {
        self.shared.last.read().clone()
    }

    /// Raw buffer of the latest measurement.
    pub fn raw_samples(&self) -> Option<RawSamples> {
        self.last_measurement().map(|m| m.raw.clone())
    }

    /// Shot vectors of the latest measurement.
    pub fn shots(&self) -> Option<ShotVectorSet> {
        self.last_measurement().map(|m| m.shots.clone())
    }

    /// Hook outputs of the latest measurement.
    pub fn outputs(&self) -> Option<NamedOutputs> {
        self.last_measurement().map(|m| m.outputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ChopperConfig};
    use crate::hardware::{BackendProbe, SimulatedBackend};
    use crate::hook::{MeanProcessor, RhaiShotsProcessor, DEFAULT_MAX_OPERATIONS};
    use tmux_shots_api::ProcessingError;
    use tracing_test::traced_test;

    fn config() -> DaemonConfig {
        let mut config = DaemonConfig::new(10);
        config.nshots = 4;
        config.retry.min_backoff_ms = 1;
        config.retry.max_backoff_ms = 4;
        config.retry.max_attempts = 3;
        config.channels.insert(
            "ai0".into(),
            ChannelConfig::from(&Channel::new(
                "signal",
                "ai0",
                channel::SampleWindow::new(2, 5, 1),
            )),
        );
        config
            .choppers
            .insert("ai7".into(), ChopperConfig::from(&Chopper::new("chopper", "ai7", 8)));
        config
    }

    fn orchestrator(backend: SimulatedBackend) -> (Orchestrator, BackendProbe) {
        let probe = backend.probe();
        let orchestrator =
            Orchestrator::new(&config(), Box::new(backend), Arc::new(MeanProcessor)).unwrap();
        (orchestrator, probe)
    }

    #[tokio::test]
    async fn test_startup_state() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        assert_eq!(orchestrator.state(), MeasurementState::Idle);
        assert!(orchestrator.is_stale());
        assert_eq!(orchestrator.ownership_table().slots(), &[0, 0, 1, 1, 1, 0, 0, 0, -1, 0]);
        assert_eq!(orchestrator.channel_names(), vec!["signal", "chopper"]);
        assert_eq!(orchestrator.voltage_ranges().len(), 7);
        assert!(orchestrator.last_measurement().is_none());
        assert_eq!(probe.configure_count(), 0);
    }

    #[tokio::test]
    async fn test_measure_publishes() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        let measurement = orchestrator.measure().await.unwrap();

        assert_eq!(measurement.id, 1);
        assert_eq!(measurement.raw.nsamples(), 10);
        assert_eq!(measurement.raw.nshots(), 4);
        assert_eq!(measurement.shots.len(), 2);
        assert!(measurement.timing.since_last.is_none());
        // The first channel reads 0.1 V in every slot it owns.
        let signal = measurement.outputs.get("signal").unwrap();
        assert!((signal - 0.1).abs() < 1e-12);
        // Chopper alternates high/low with shot parity.
        assert_eq!(measurement.outputs.get("chopper"), Some(0.0));

        assert_eq!(probe.configure_count(), 1);
        assert_eq!(probe.read_count(), 1);
        assert!(!orchestrator.is_stale());
        assert_eq!(orchestrator.state(), MeasurementState::Idle);

        let second = orchestrator.measure().await.unwrap();
        assert_eq!(second.id, 2);
        assert!(second.timing.since_last.is_some());
        assert_eq!(probe.configure_count(), 1);
        assert_eq!(orchestrator.measurement_count(), 2);
        assert_eq!(orchestrator.outputs().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_nshots_change_rebuilds_task() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        orchestrator.measure().await.unwrap();
        assert!(orchestrator.set_nshots(0).is_err());
        orchestrator.set_nshots(7).unwrap();
        assert!(orchestrator.is_stale());

        let measurement = orchestrator.measure().await.unwrap();
        assert_eq!(measurement.raw.nshots(), 7);
        assert_eq!(probe.configure_count(), 2);
        assert_eq!(probe.clear_count(), 1);
        assert_eq!(probe.last_task().unwrap().nshots, 7);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_task_build_failure_is_recoverable() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        probe.fail_next_configures(1);

        let err = orchestrator.measure().await.unwrap_err();
        assert!(matches!(err, DaqError::TaskBuild(_)));
        assert!(err.is_recoverable());
        assert!(orchestrator.is_stale());
        assert!(logs_contain("Failed to build acquisition task"));

        orchestrator.measure().await.unwrap();
        assert_eq!(probe.configure_count(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_retry_recovers() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        probe.fail_next_reads(2);

        let measurement = orchestrator.measure().await.unwrap();
        assert_eq!(measurement.id, 1);
        assert_eq!(probe.read_count(), 3);
        assert_eq!(probe.stop_count(), 2);
        assert!(logs_contain("Attempt failed, backing off"));
    }

    #[tokio::test]
    async fn test_read_retry_exhausted() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        probe.fail_next_reads(3);

        let err = orchestrator.measure().await.unwrap_err();
        match err {
            DaqError::AcquisitionFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(probe.clear_count(), 1);
        assert!(orchestrator.last_measurement().is_none());

        // The next call rebuilds the cleared task.
        orchestrator.measure().await.unwrap();
        assert_eq!(probe.configure_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_measure_is_rejected() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        probe.hold_reads();

        let background = orchestrator.clone();
        let first = tokio::spawn(async move { background.measure().await });
        probe.read_started().await;

        let err = orchestrator.measure().await.unwrap_err();
        assert!(matches!(err, DaqError::MeasurementInProgress));
        probe.release_reads();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_hook_failure_publishes_nothing() {
        // Passes output-name discovery on zeros, fails on acquired data.
        let script = r#"
fn process(shots, names, kinds) {
    if shots[0][0] != 0.0 { throw "no calibration for " + names[0]; }
    [[0.0], ["signal"]]
}
"#;
        let processor =
            RhaiShotsProcessor::from_script(script, "calibrated.rhai", DEFAULT_MAX_OPERATIONS)
                .unwrap();
        let backend = SimulatedBackend::new();
        let probe = backend.probe();
        let orchestrator = Orchestrator::new(&config(), Box::new(backend), Arc::new(processor))
            .unwrap();
        assert_eq!(orchestrator.channel_names(), vec!["signal"]);

        let err = orchestrator.measure().await.unwrap_err();
        assert!(matches!(err, DaqError::Hook(ProcessingError::Execution(_))));
        assert!(err.to_string().contains("no calibration for signal"));
        assert!(!err.is_recoverable());
        assert!(orchestrator.last_measurement().is_none());
        assert!(orchestrator.outputs().is_none());
        assert_eq!(orchestrator.measurement_count(), 0);
        assert_eq!(orchestrator.state(), MeasurementState::Idle);

        // The task survives; only the hook failed.
        assert!(orchestrator.measure().await.is_err());
        assert_eq!(probe.configure_count(), 1);
        assert_eq!(probe.read_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_cycle_returns_to_idle() {
        let (orchestrator, probe) = orchestrator(SimulatedBackend::new());
        probe.hold_reads();

        let cycle = orchestrator.clone();
        let handle = tokio::spawn(async move { cycle.measure().await });
        probe.read_started().await;
        assert_eq!(orchestrator.state(), MeasurementState::Reading);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(orchestrator.state(), MeasurementState::Idle);

        probe.release_reads();
        let measurement = orchestrator.measure().await.unwrap();
        assert_eq!(measurement.id, 1);
    }

    #[tokio::test]
    async fn test_reconfigure() {
        let (orchestrator, _probe) = orchestrator(SimulatedBackend::new());
        orchestrator.measure().await.unwrap();

        let mut channels = orchestrator.channels();
        channels[0].name = "renamed".into();
        channels[0].signal = channel::SampleWindow::new(1, 4, 1);
        orchestrator
            .reconfigure(channels.clone(), orchestrator.choppers())
            .unwrap();
        assert!(orchestrator.is_stale());
        assert_eq!(orchestrator.ownership_table().slots(), &[0, 1, 1, 1, 0, 0, 0, 0, -1, 0]);
        assert_eq!(orchestrator.channel_names(), vec!["renamed", "chopper"]);

        channels[0].range = VoltageRange::symmetric(3.0);
        let err = orchestrator
            .reconfigure(channels, orchestrator.choppers())
            .unwrap_err();
        match err {
            DaqError::InvalidVoltageRange { channels } => assert_eq!(channels, vec!["renamed"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(orchestrator.channel_names(), vec!["renamed", "chopper"]);
    }

    #[test]
    fn test_startup_rejects_unadvertised_ranges() {
        let mut config = config();
        config.channels.get_mut("ai0").unwrap().range = VoltageRange::symmetric(3.0);
        let backend = Box::new(SimulatedBackend::new());
        let err = Orchestrator::new(&config, backend, Arc::new(MeanProcessor)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid voltage range for channel(s): signal");
    }

    #[tokio::test]
    async fn test_ms_wait_delays_read() {
        let (orchestrator, _probe) = orchestrator(SimulatedBackend::new());
        orchestrator.set_ms_wait(30);
        assert_eq!(orchestrator.ms_wait(), 30);
        let measurement = orchestrator.measure().await.unwrap();
        assert!(measurement.timing.acquisition >= Duration::from_millis(30));
    }
}
