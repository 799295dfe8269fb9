//! Acquisition backend boundary.
//!
//! The vendor driver (task creation, sample-clock timing, buffered analog
//! reads) sits behind [`AcquisitionBackend`]. The core hands it a fully
//! resolved [`TaskSpec`]: one physical input and voltage range per slot of the
//! ownership table. Hardware calls block, so the trait is synchronous; the
//! orchestrator runs reads on the blocking pool.
//!
//! A task is only valid for the table and shot count it was built from. The
//! orchestrator clears and rebuilds it whenever either changes.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::channel::{Channel, Chopper, VoltageRange};
use crate::error::{AppResult, DaqError};
use crate::scheduler::{OwnershipTable, Slot};

pub mod mock;

pub use mock::{BackendProbe, SimulatedBackend};

/// Errors reported by an acquisition backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The driver refused to create the task.
    #[error("task creation failed: {0}")]
    TaskCreation(String),

    /// A virtual channel could not be added to the task.
    #[error("virtual channel configuration failed: {0}")]
    Channel(String),

    /// Sample clock / trigger configuration failed.
    #[error("timing configuration failed: {0}")]
    Timing(String),

    /// The buffered read failed.
    #[error("read failed: {0}")]
    Read(String),

    /// No trigger arrived within the task timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The handle does not name a live task.
    #[error("unknown task handle {0}")]
    UnknownTask(u64),

    /// The returned buffer does not have the expected shape.
    #[error("buffer shape mismatch: {0}")]
    Shape(String),
}

/// Opaque identifier of a configured hardware task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Wrap a backend-specific task id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Backend-specific task id.
    pub const fn id(&self) -> u64 {
        self.0
    }
}

/// Device-wide acquisition parameters that do not depend on the table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSettings {
    /// Device name as known to the driver (e.g. `Dev1`).
    pub device_name: String,
    /// Physical input read during rest slots.
    pub rest_channel: String,
    /// Terminal supplying the external sample clock.
    pub trigger_source: String,
    /// Nominal sample rate in Hz; sizes the driver buffer in externally
    /// clocked mode.
    pub sample_rate: f64,
    /// Per-read timeout.
    pub timeout: Duration,
}

/// One virtual channel of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSpec {
    /// Unique virtual channel name (`sample_000`, `sample_001`, ...).
    pub name: String,
    /// Physical input bound to the slot.
    pub physical_channel: String,
    /// Input range for the slot.
    pub range: VoltageRange,
    /// Ownership of the slot.
    #[serde(skip)]
    pub owner: Slot,
}

/// Everything a backend needs to build a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpec {
    /// Device-wide parameters.
    pub device: DeviceSettings,
    /// Finite number of samples per virtual channel (shots).
    pub nshots: usize,
    /// One entry per ownership-table slot, in slot order.
    pub slots: Vec<SlotSpec>,
}

impl TaskSpec {
    /// Resolve every slot of `table` to a physical input and range.
    ///
    /// Rest slots read the rest channel and choppers are read at ±10 V;
    /// channel slots use the channel's own input and declared range.
    pub fn resolve(
        table: &OwnershipTable,
        channels: &[Channel],
        choppers: &[Chopper],
        device: &DeviceSettings,
        nshots: usize,
    ) -> AppResult<Self> {
        let slots = table
            .iter()
            .enumerate()
            .map(|(index, owner)| -> AppResult<SlotSpec> {
                let (physical_channel, range) = match owner {
                    Slot::Rest => (device.rest_channel.clone(), VoltageRange::BIPOLAR_10V),
                    Slot::Channel(k) => {
                        let channel = channels.get(k).ok_or_else(|| {
                            DaqError::Configuration(format!(
                                "slot {index} references missing channel {}",
                                k + 1
                            ))
                        })?;
                        (channel.physical_channel.clone(), channel.range)
                    }
                    Slot::Chopper(k) => {
                        let chopper = choppers.get(k).ok_or_else(|| {
                            DaqError::Configuration(format!(
                                "slot {index} references missing chopper {}",
                                k + 1
                            ))
                        })?;
                        (chopper.physical_channel.clone(), VoltageRange::BIPOLAR_10V)
                    }
                };
                Ok(SlotSpec {
                    name: format!("sample_{index:03}"),
                    physical_channel,
                    range,
                    owner,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            device: device.clone(),
            nshots,
            slots,
        })
    }

    /// Number of slots (`nsamples`).
    pub fn nsamples(&self) -> usize {
        self.slots.len()
    }
}

/// Raw samples of one acquisition cycle: `nsamples` rows by `nshots` columns,
/// in volts.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSamples {
    data: Array2<f64>,
}

impl RawSamples {
    /// Wrap an `nsamples × nshots` matrix.
    pub fn new(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// Build from a flat buffer grouped by scan: all slots of shot 0, then all
    /// slots of shot 1, and so on.
    pub fn from_interleaved(
        flat: Vec<f64>,
        nsamples: usize,
        nshots: usize,
    ) -> Result<Self, BackendError> {
        let len = flat.len();
        let by_shot = Array2::from_shape_vec((nshots, nsamples), flat).map_err(|_| {
            BackendError::Shape(format!(
                "{len} samples cannot fill {nsamples} slots x {nshots} shots"
            ))
        })?;
        Ok(Self {
            data: by_shot.reversed_axes(),
        })
    }

    /// Number of slots.
    pub fn nsamples(&self) -> usize {
        self.data.nrows()
    }

    /// Number of shots.
    pub fn nshots(&self) -> usize {
        self.data.ncols()
    }

    /// Full matrix view.
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// All shots of one slot.
    pub fn row(&self, slot: usize) -> Option<ArrayView1<'_, f64>> {
        (slot < self.nsamples()).then(|| self.data.index_axis(Axis(0), slot))
    }

    /// Copy into nested vectors, one per slot.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.data.outer_iter().map(|row| row.to_vec()).collect()
    }
}

/// The hardware driver seen from the core.
///
/// All methods may block. Implementations must leave a task restartable after
/// a failed [`read`](AcquisitionBackend::read) once [`stop`](AcquisitionBackend::stop)
/// has been called.
pub trait AcquisitionBackend: Send {
    /// Input ranges the device supports.
    fn voltage_ranges(&self) -> Result<Vec<VoltageRange>, BackendError>;

    /// Create a task with one virtual channel per slot and finite,
    /// externally clocked timing of `spec.nshots` samples per channel.
    fn configure(&mut self, spec: &TaskSpec) -> Result<TaskHandle, BackendError>;

    /// Start the task, read `nshots` samples per virtual channel, stop it.
    fn read(&mut self, task: TaskHandle, nshots: usize) -> Result<RawSamples, BackendError>;

    /// Stop a running task, leaving it configured.
    fn stop(&mut self, task: TaskHandle) -> Result<(), BackendError>;

    /// Release a task. Unknown handles are ignored.
    fn clear(&mut self, task: TaskHandle);
}

/// Backend shared between the async cycle and the blocking pool.
pub type SharedBackend = Arc<Mutex<Box<dyn AcquisitionBackend>>>;

/// Wrap a backend for use by the orchestrator.
pub fn share(backend: Box<dyn AcquisitionBackend>) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SampleWindow;

    fn device() -> DeviceSettings {
        DeviceSettings {
            device_name: "Dev1".into(),
            rest_channel: "ai15".into(),
            trigger_source: "/Dev1/PFI0".into(),
            sample_rate: 1000.0,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_resolve_slots() {
        let mut channel = Channel::new("signal", "ai0", SampleWindow::new(1, 3, 0));
        channel.range = VoltageRange::symmetric(2.0);
        let chopper = Chopper::new("chopper", "ai7", 3);
        let table = OwnershipTable::build(&[channel.clone()], &[chopper.clone()], 4);
        assert_eq!(table.slots(), &[0, 0, 1, -1]);

        let spec = TaskSpec::resolve(&table, &[channel], &[chopper], &device(), 50).unwrap();
        assert_eq!(spec.nsamples(), 4);
        assert_eq!(spec.nshots, 50);
        assert_eq!(spec.slots[0].physical_channel, "ai15");
        assert_eq!(spec.slots[0].range, VoltageRange::BIPOLAR_10V);
        assert_eq!(spec.slots[2].physical_channel, "ai0");
        assert_eq!(spec.slots[2].range, VoltageRange::symmetric(2.0));
        assert_eq!(spec.slots[3].physical_channel, "ai7");
        assert_eq!(spec.slots[3].range, VoltageRange::BIPOLAR_10V);
        assert_eq!(spec.slots[3].name, "sample_003");
    }

    #[test]
    fn test_resolve_rejects_dangling_ids() {
        let channel = Channel::new("signal", "ai0", SampleWindow::new(1, 3, 0));
        let table = OwnershipTable::build(&[channel], &[], 4);
        assert!(TaskSpec::resolve(&table, &[], &[], &device(), 1).is_err());
    }

    #[test]
    fn test_interleaved_layout() {
        // Two slots, three shots; slot varies fastest.
        let flat = vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0];
        let raw = RawSamples::from_interleaved(flat, 2, 3).unwrap();
        assert_eq!(raw.nsamples(), 2);
        assert_eq!(raw.nshots(), 3);
        assert_eq!(raw.row(0).unwrap().to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(raw.row(1).unwrap().to_vec(), vec![10.0, 11.0, 12.0]);
        assert!(raw.row(2).is_none());
    }

    #[test]
    fn test_interleaved_shape_mismatch() {
        let err = RawSamples::from_interleaved(vec![0.0; 5], 2, 3).unwrap_err();
        assert!(matches!(err, BackendError::Shape(_)));
    }
}
