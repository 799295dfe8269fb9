//! Simulated acquisition backend.
//!
//! Stands in for the vendor driver when running without hardware. Samples are
//! synthesized per slot from a pluggable generator and clamped to the slot's
//! input range, as a saturating ADC would.
//!
//! A [`BackendProbe`] shares counters and fault injection with the backend so
//! callers can observe it after handing the backend to the orchestrator:
//!
//! ```rust,ignore
//! let backend = SimulatedBackend::new();
//! let probe = backend.probe();
//! probe.fail_next_reads(2);
//! // ... run a measurement ...
//! assert_eq!(probe.read_count(), 3);
//! ```
//!
//! Reads sleep on the calling thread for the configured latency; the
//! orchestrator already runs them on the blocking pool. Reads can also be held
//! open until released through the probe, which pins a control-plane call
//! inside a read:
//!
//! ```rust,ignore
//! probe.hold_reads();
//! let cycle = tokio::spawn(async move { orchestrator.measure().await });
//! probe.read_started().await;
//! // ... the read is in flight ...
//! probe.release_reads();
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::{AcquisitionBackend, BackendError, RawSamples, SlotSpec, TaskHandle, TaskSpec};
use crate::channel::VoltageRange;
use crate::scheduler::Slot;

/// Standard bipolar input ranges of a multifunction DAQ board.
pub const STANDARD_RANGES: [f64; 7] = [0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Produces the voltage seen at `slot` during `shot`.
pub type SampleGenerator = Arc<dyn Fn(&SlotSpec, usize, usize) -> f64 + Send + Sync>;

/// Counters and fault injection shared with a [`SimulatedBackend`].
#[derive(Clone, Default)]
pub struct BackendProbe {
    inner: Arc<ProbeState>,
}

#[derive(Default)]
struct ProbeState {
    configures: AtomicUsize,
    reads: AtomicUsize,
    stops: AtomicUsize,
    clears: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_configures: AtomicUsize,
    last_task: Mutex<Option<TaskSpec>>,
    held: Mutex<bool>,
    released: Condvar,
    read_started: Notify,
}

impl BackendProbe {
    /// Number of `configure` calls, failed ones included.
    pub fn configure_count(&self) -> usize {
        self.inner.configures.load(Ordering::SeqCst)
    }

    /// Number of `read` calls, failed ones included.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stop_count(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    /// Number of `clear` calls for live tasks.
    pub fn clear_count(&self) -> usize {
        self.inner.clears.load(Ordering::SeqCst)
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` task builds fail.
    pub fn fail_next_configures(&self, n: usize) {
        self.inner.failing_configures.store(n, Ordering::SeqCst);
    }

    /// Block reads of live tasks until [`release_reads`](Self::release_reads).
    pub fn hold_reads(&self) {
        *self.inner.held.lock() = true;
    }

    /// Let held and future reads proceed.
    pub fn release_reads(&self) {
        *self.inner.held.lock() = false;
        self.inner.released.notify_all();
    }

    /// Wait until a read of a live task has started.
    pub async fn read_started(&self) {
        self.inner.read_started.notified().await;
    }

    fn wait_while_held(&self) {
        let mut held = self.inner.held.lock();
        while *held {
            self.inner.released.wait(&mut held);
        }
    }

    /// Spec of the most recently built task.
    pub fn last_task(&self) -> Option<TaskSpec> {
        self.inner.last_task.lock().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl fmt::Debug for BackendProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendProbe")
            .field("configures", &self.configure_count())
            .field("reads", &self.read_count())
            .field("stops", &self.stop_count())
            .field("clears", &self.clear_count())
            .finish()
    }
}

/// In-memory acquisition backend.
pub struct SimulatedBackend {
    ranges: Vec<VoltageRange>,
    generator: SampleGenerator,
    read_latency: Duration,
    tasks: HashMap<u64, TaskSpec>,
    next_task: u64,
    probe: BackendProbe,
}

impl SimulatedBackend {
    /// Backend advertising the standard ranges with the default generator.
    pub fn new() -> Self {
        Self {
            ranges: STANDARD_RANGES.iter().map(|&v| VoltageRange::symmetric(v)).collect(),
            generator: Arc::new(default_sample),
            read_latency: Duration::ZERO,
            tasks: HashMap::new(),
            next_task: 1,
            probe: BackendProbe::default(),
        }
    }

    /// Replace the advertised ranges.
    pub fn with_ranges(mut self, ranges: Vec<VoltageRange>) -> Self {
        self.ranges = ranges;
        self
    }

    /// Replace the sample generator.
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&SlotSpec, usize, usize) -> f64 + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    /// Block every read for `latency`.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    /// Handle for observing this backend.
    pub fn probe(&self) -> BackendProbe {
        self.probe.clone()
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionBackend for SimulatedBackend {
    fn voltage_ranges(&self) -> Result<Vec<VoltageRange>, BackendError> {
        Ok(self.ranges.clone())
    }

    fn configure(&mut self, spec: &TaskSpec) -> Result<TaskHandle, BackendError> {
        self.probe.inner.configures.fetch_add(1, Ordering::SeqCst);
        if BackendProbe::take_failure(&self.probe.inner.failing_configures) {
            return Err(BackendError::TaskCreation("simulated driver fault".into()));
        }
        if spec.nshots == 0 {
            return Err(BackendError::Timing("finite acquisition needs at least one sample".into()));
        }
        if let Some(slot) = spec
            .slots
            .iter()
            .find(|s| !self.ranges.iter().any(|r| r.matches(&s.range)))
        {
            return Err(BackendError::Channel(format!(
                "{} ({}): unsupported range {}",
                slot.name, slot.physical_channel, slot.range
            )));
        }

        let handle = TaskHandle::new(self.next_task);
        self.next_task += 1;
        self.tasks.insert(handle.id(), spec.clone());
        *self.probe.inner.last_task.lock() = Some(spec.clone());
        debug!(
            task = handle.id(),
            slots = spec.nsamples(),
            nshots = spec.nshots,
            "Simulated task configured"
        );
        Ok(handle)
    }

    fn read(&mut self, task: TaskHandle, nshots: usize) -> Result<RawSamples, BackendError> {
        self.probe.inner.reads.fetch_add(1, Ordering::SeqCst);
        let spec = self
            .tasks
            .get(&task.id())
            .ok_or(BackendError::UnknownTask(task.id()))?;

        self.probe.inner.read_started.notify_one();
        self.probe.wait_while_held();
        if !self.read_latency.is_zero() {
            std::thread::sleep(self.read_latency);
        }
        if BackendProbe::take_failure(&self.probe.inner.failing_reads) {
            return Err(BackendError::Read("simulated missed trigger".into()));
        }
        if nshots != spec.nshots {
            return Err(BackendError::Shape(format!(
                "task acquires {} shots, read requested {}",
                spec.nshots, nshots
            )));
        }

        let nsamples = spec.nsamples();
        let mut flat = Vec::with_capacity(nsamples * nshots);
        for shot in 0..nshots {
            for (index, slot) in spec.slots.iter().enumerate() {
                let volts = (self.generator)(slot, index, shot);
                flat.push(volts.clamp(slot.range.min, slot.range.max));
            }
        }
        RawSamples::from_interleaved(flat, nsamples, nshots)
    }

    fn stop(&mut self, task: TaskHandle) -> Result<(), BackendError> {
        self.probe.inner.stops.fetch_add(1, Ordering::SeqCst);
        if self.tasks.contains_key(&task.id()) {
            Ok(())
        } else {
            Err(BackendError::UnknownTask(task.id()))
        }
    }

    fn clear(&mut self, task: TaskHandle) {
        if self.tasks.remove(&task.id()).is_some() {
            self.probe.inner.clears.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Rest slots sit at 0 V, channel `k` reads a steady `0.1 * (k + 1)` V and
/// choppers alternate between 5 V and 0 V from shot to shot.
fn default_sample(slot: &SlotSpec, _index: usize, shot: usize) -> f64 {
    match slot.owner {
        Slot::Rest => 0.0,
        Slot::Channel(k) => 0.1 * (k + 1) as f64,
        Slot::Chopper(_) => {
            if shot % 2 == 0 {
                5.0
            } else {
                0.0
            }
        }
    }
}
