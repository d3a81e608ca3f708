//! The bounded work pool: a fixed-capacity circular buffer of work units
//! guarded by one mutex and two condition variables, plus the owned
//! buffer-coherence table and the per-device scheduler threads.

use crate::backend::{AccessMode, BoundArg, ComputeBackend};
use crate::coherence::{BufferTable, CoherenceMetrics};
use crate::config::{PoolConfig, MAX_PRIORITY};
use crate::device::{DeviceContext, DeviceRegistry};
use crate::error::{Error, Result};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::scheduler::{self, BusyTrend};
use crate::unit::{ArgValue, UnitEvent, UnitStatus, WorkUnit};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pool-level status, updated on every queue mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Init,
    Empty,
    NonEmpty,
    Full,
    Fail,
}

/// Optional per-dispatch instrumentation, layered in by collaborators
/// without modifying the scheduler. `on_dispatch` runs immediately before
/// argument binding, `on_submit` immediately after submission. Opaque
/// caller state travels in the closure captures.
#[derive(Default)]
pub struct DispatchHooks {
    pub on_dispatch: Option<Box<dyn Fn(&DeviceContext, &WorkUnit) + Send + Sync>>,
    pub on_submit: Option<Box<dyn Fn(&DeviceContext) + Send + Sync>>,
}

impl std::fmt::Debug for DispatchHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHooks")
            .field("on_dispatch", &self.on_dispatch.is_some())
            .field("on_submit", &self.on_submit.is_some())
            .finish()
    }
}

/// Final report returned by [`WorkPool::finish`].
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub completed_per_device: Vec<u64>,
    pub state: PoolState,
    pub coherence: CoherenceMetrics,
    pub metrics: MetricsSnapshot,
}

/// A unit claimed by a worker: what the scheduler loop needs to finish
/// the dispatch (drain the queue, publish completion, record timing).
pub(crate) struct ClaimedUnit {
    pub(crate) unit_index: u64,
    pub(crate) completion: Arc<UnitEvent>,
    pub(crate) dispatched_at: Instant,
}

pub(crate) struct PoolInner {
    slots: Vec<Option<WorkUnit>>,
    index_in: usize,
    index_out: usize,
    count: usize,
    high_water: usize,
    state: PoolState,
    next_unit_index: u64,
    sleeping: usize,
    // Per-device scheduler bookkeeping.
    pub(crate) completed: Vec<u64>,
    pub(crate) exec_history: Vec<Vec<Duration>>,
    pub(crate) busy: Vec<BusyTrend>,
    pub(crate) offset: Vec<i64>,
    pub(crate) exited: Vec<bool>,
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) registry: DeviceRegistry,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) not_empty: Condvar,
    pub(crate) not_full: Condvar,
    idle: Condvar,
    pub(crate) done: AtomicBool,
    // First fatal worker error; surfaced by finish.
    failure: Mutex<Option<Error>>,
    pub(crate) buffers: BufferTable,
    pub(crate) metrics: PoolMetrics,
    hooks: DispatchHooks,
}

/// The bounded heterogeneous work pool.
///
/// Construction enumerates devices and starts one scheduler thread per
/// device; producers then `enqueue` units and call `finish` to drain and
/// join.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("devices", &self.shared.registry.len())
            .field("capacity", &self.shared.config.capacity)
            .finish_non_exhaustive()
    }
}

impl WorkPool {
    pub fn new(config: PoolConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        Self::with_hooks(config, backend, DispatchHooks::default())
    }

    pub fn with_hooks(
        config: PoolConfig,
        backend: Arc<dyn ComputeBackend>,
        hooks: DispatchHooks,
    ) -> Result<Self> {
        config.validate()?;
        let registry = DeviceRegistry::new(backend)?;
        config.validate_for_devices(registry.len())?;

        let num_devices = registry.len();
        let inner = PoolInner {
            slots: (0..config.capacity).map(|_| None).collect(),
            index_in: 0,
            index_out: 0,
            count: 0,
            high_water: 0,
            state: PoolState::Init,
            next_unit_index: 0,
            sleeping: 0,
            completed: vec![0; num_devices],
            exec_history: vec![Vec::new(); num_devices],
            busy: vec![BusyTrend::Stay; num_devices],
            offset: vec![0; num_devices],
            exited: vec![false; num_devices],
        };

        let shared = Arc::new(PoolShared {
            buffers: BufferTable::new(num_devices),
            metrics: PoolMetrics::new(),
            inner: Mutex::new(inner),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
            hooks,
            config,
            registry,
        });

        let mut workers = Vec::with_capacity(num_devices);
        for device in shared.registry.iter().cloned().collect::<Vec<_>>() {
            let shared = Arc::clone(&shared);
            let name = format!("{}-{}", shared.config.thread_name_prefix, device.index());
            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = shared.config.stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || scheduler::worker_loop(shared, device))
                .map_err(|e| Error::resource(format!("spawning scheduler thread: {e}")))?;
            workers.push(handle);
        }

        info!(devices = num_devices, capacity = shared.config.capacity, "work pool started");
        Ok(Self { shared, workers })
    }

    pub fn num_devices(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Coherence-table timing counters accumulated so far.
    pub fn coherence_metrics(&self) -> CoherenceMetrics {
        self.shared.buffers.metrics()
    }

    /// Insert a copy of `unit` into the pool, blocking while the pool is
    /// at capacity. Out-of-range priorities are clamped, never rejected.
    /// Returns the unit's completion event for dependency chaining.
    pub fn enqueue(&self, unit: &WorkUnit, priority: u32) -> Result<Arc<UnitEvent>> {
        self.shared.enqueue(unit, priority)
    }

    /// Block until the pool has drained, then tear down: stop and join
    /// every scheduler thread, release all coherence-table buffers, and
    /// report per-device completion counts. A fatal worker error
    /// interrupts the drain and is returned instead of a report.
    pub fn finish(mut self) -> Result<PoolReport> {
        let shared = Arc::clone(&self.shared);

        {
            let mut inner = shared.inner.lock();
            // A failed pool will never drain; stop waiting on it.
            while inner.count > 0 && inner.state != PoolState::Fail {
                shared.idle.wait(&mut inner);
            }
            // Set under the lock so no worker can re-check and sleep
            // after the flag flips.
            shared.done.store(true, Ordering::Release);
            inner.sleeping = 0;
        }
        shared.not_empty.notify_all();

        let mut worker_panicked = false;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                worker_panicked = true;
            }
        }

        if let Some(error) = shared.failure.lock().take() {
            // The backend may be unusable after a device error; release
            // what we can and surface the original failure.
            let _ = shared.buffers.reset(shared.registry.backend().as_ref());
            return Err(error);
        }
        if worker_panicked {
            return Err(Error::internal("scheduler thread panicked"));
        }

        shared.buffers.reset(shared.registry.backend().as_ref())?;

        let (completed, state, high_water) = {
            let inner = shared.inner.lock();
            (inner.completed.clone(), inner.state, inner.high_water)
        };
        for (device, count) in completed.iter().enumerate() {
            info!(device, count, "units executed");
        }
        debug!(high_water, "peak pool occupancy");

        Ok(PoolReport {
            completed_per_device: completed,
            state,
            coherence: shared.buffers.metrics(),
            metrics: shared.metrics.snapshot(),
        })
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut inner = self.shared.inner.lock();
            self.shared.done.store(true, Ordering::Release);
            inner.sleeping = 0;
        }
        self.shared.not_empty.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl PoolShared {
    /// Record a fatal worker error: flip the pool to `Fail`, begin
    /// teardown, and wake every blocked producer and worker so nothing
    /// waits on work that can no longer be drained.
    pub(crate) fn fail(&self, error: Error) {
        {
            let mut inner = self.inner.lock();
            inner.state = PoolState::Fail;
            inner.sleeping = 0;
            self.done.store(true, Ordering::Release);
        }
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
        drop(failure);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.idle.notify_all();
    }

    fn enqueue(&self, unit: &WorkUnit, priority: u32) -> Result<Arc<UnitEvent>> {
        let priority = priority.min(MAX_PRIORITY);
        let capacity = self.config.capacity;

        let mut guard = self.inner.lock();
        loop {
            if guard.state == PoolState::Fail {
                return Err(Error::internal(
                    "pool is in a failed state, unit rejected",
                ));
            }
            if guard.count < capacity {
                break;
            }
            debug!("pool full, enqueue waiting");
            self.not_full.wait(&mut guard);
        }
        let inner = &mut *guard;

        if inner.count > capacity {
            inner.state = PoolState::Fail;
            return Err(Error::internal("live unit count exceeds capacity"));
        }
        if inner.count == 0 && inner.index_in != inner.index_out {
            inner.state = PoolState::Fail;
            return Err(Error::internal("cursors diverged on empty pool"));
        }

        inner.next_unit_index += 1;
        let seq = inner.next_unit_index;

        // Find a free slot: scan forward from the insertion cursor,
        // skipping occupants that are still pending, stopping at the
        // first empty slot.
        let mut placed = false;
        for _ in 0..capacity {
            match &inner.slots[inner.index_in] {
                None => {
                    placed = true;
                    break;
                }
                Some(occupant) => match occupant.status {
                    UnitStatus::Initialized | UnitStatus::Waiting => {
                        inner.index_in = (inner.index_in + 1) % capacity;
                    }
                    UnitStatus::Ready | UnitStatus::Complete => {
                        inner.state = PoolState::Fail;
                        return Err(Error::internal(format!(
                            "slot {} holds a unit in state {:?}",
                            inner.index_in, occupant.status
                        )));
                    }
                },
            }
        }
        if !placed {
            inner.state = PoolState::Fail;
            return Err(Error::internal("no free slot below capacity"));
        }

        let mut stored = unit.clone();
        stored.priority = priority;
        stored.unit_index = seq;
        stored.status = UnitStatus::Initialized;
        let event = stored.completion();

        inner.slots[inner.index_in] = Some(stored);
        inner.index_in = (inner.index_in + 1) % capacity;
        inner.count += 1;
        inner.high_water = inner.high_water.max(inner.count);

        if inner.count == 1 {
            // Empty -> non-empty: wake every sleeping worker so none can
            // miss the transition.
            let sleepers = inner.sleeping;
            inner.sleeping = 0;
            for _ in 0..sleepers {
                self.not_empty.notify_one();
            }
        }

        inner.state = if inner.count == capacity {
            PoolState::Full
        } else {
            PoolState::NonEmpty
        };

        self.metrics.record_enqueued();
        debug!(seq, priority, count = inner.count, "enqueued unit");
        Ok(event)
    }

    /// Sequence index of the next occupied slot at or after the
    /// extraction cursor, if any. Used by the round-robin gate.
    pub(crate) fn query(&self) -> Option<u64> {
        let inner = self.inner.lock();
        let capacity = self.config.capacity;
        if inner.count == 0 {
            return None;
        }
        let mut pos = inner.index_out;
        for _ in 0..capacity {
            if let Some(unit) = &inner.slots[pos] {
                return Some(unit.unit_index);
            }
            pos = (pos + 1) % capacity;
        }
        None
    }

    /// Claim at most one ready unit for `device` and drive it through
    /// buffer resolution, launch, and read-back. Sleeps on the not-empty
    /// condition when the pool is empty and teardown has not begun.
    pub(crate) fn extract_and_distribute(
        &self,
        device: &DeviceContext,
    ) -> Result<Option<ClaimedUnit>> {
        let capacity = self.config.capacity;
        let mut guard = self.inner.lock();

        if guard.count == 0 {
            if self.done.load(Ordering::Acquire) {
                return Ok(None);
            }
            guard.sleeping += 1;
            self.not_empty.wait(&mut guard);
        }
        if guard.count == 0 || self.done.load(Ordering::Acquire) {
            return Ok(None);
        }

        let inner = &mut *guard;

        // Scan forward from the extraction cursor through occupied slots
        // for the first unit that is ready or becomes ready; demote units
        // with outstanding dependencies to Waiting and move the cursor
        // past them for a later pass.
        let mut claimed: Option<WorkUnit> = None;
        let mut examined = 0usize;
        let occupied = inner.count;
        let mut pos = inner.index_out;

        for _ in 0..capacity {
            if examined == occupied {
                break;
            }
            let Some(unit) = inner.slots[pos].as_mut() else {
                pos = (pos + 1) % capacity;
                inner.index_out = pos;
                continue;
            };
            examined += 1;
            match unit.status {
                UnitStatus::Initialized | UnitStatus::Waiting => {
                    if unit.dependency_clear() {
                        unit.status = UnitStatus::Ready;
                        claimed = inner.slots[pos].take();
                        pos = (pos + 1) % capacity;
                        inner.index_out = pos;
                        break;
                    }
                    unit.status = UnitStatus::Waiting;
                    pos = (pos + 1) % capacity;
                    inner.index_out = pos;
                }
                UnitStatus::Ready | UnitStatus::Complete => {
                    inner.state = PoolState::Fail;
                    return Err(Error::internal(format!(
                        "slot {pos} holds a unit in state {:?} during extraction",
                        unit.status
                    )));
                }
            }
        }

        let Some(mut unit) = claimed else {
            return Ok(None);
        };

        // The slot is released before execution begins: queue turnover is
        // decoupled from execution latency.
        unit.status = UnitStatus::Complete;

        if inner.count == capacity {
            self.not_full.notify_one();
        }
        inner.count -= 1;
        inner.state = if inner.count == 0 {
            PoolState::Empty
        } else {
            PoolState::NonEmpty
        };
        if inner.count == 0 {
            self.idle.notify_all();
        }
        drop(guard);

        let dispatched_at = Instant::now();
        debug!(
            seq = unit.unit_index,
            device = device.index(),
            "claimed unit for dispatch"
        );
        self.dispatch(device, &unit)?;
        self.metrics.record_dispatched();

        Ok(Some(ClaimedUnit {
            unit_index: unit.unit_index,
            completion: unit.completion(),
            dispatched_at,
        }))
    }

    /// Resolve arguments, select the device's precompiled kernel, submit
    /// the launch, and queue read-back for write-back arguments. Runs
    /// without the pool lock held.
    fn dispatch(&self, device: &DeviceContext, unit: &WorkUnit) -> Result<()> {
        let backend = self.registry.backend().as_ref();

        if let Some(hook) = &self.hooks.on_dispatch {
            hook(device, unit);
        }

        let mut bound = Vec::with_capacity(unit.args.len());
        for arg in &unit.args {
            match &arg.value {
                ArgValue::Scalar(value) => bound.push(BoundArg::Scalar {
                    index: arg.index,
                    value: *value,
                }),
                ArgValue::Array { data, mode } => {
                    let buffer = self.buffers.request(backend, device.index(), data, *mode)?;
                    bound.push(BoundArg::Buffer {
                        index: arg.index,
                        buffer,
                    });
                }
            }
        }

        let kernel = unit.kernels.get(device.index()).ok_or_else(|| {
            Error::launch(format!(
                "unit {} has no kernel compiled for device {}",
                unit.unit_index,
                device.index()
            ))
        })?;

        backend.launch_kernel(device.index(), kernel, &unit.geometry, &bound)?;

        if let Some(hook) = &self.hooks.on_submit {
            hook(device);
        }

        // Write-back arguments return to host memory after submission.
        for arg in &unit.args {
            if let ArgValue::Array {
                data,
                mode: AccessMode::ReadWrite,
            } = &arg.value
            {
                let buffer =
                    self.buffers
                        .request(backend, device.index(), data, AccessMode::ReadWrite)?;
                data.with_data_mut(|out| backend.read_buffer(device.index(), buffer, out))?;
            }
        }

        Ok(())
    }
}
