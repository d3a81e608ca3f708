//! Work units: one schedulable kernel dispatch with bound arguments,
//! launch geometry, and dependency information.

use crate::backend::{AccessMode, KernelId, ScalarValue};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum supported launch dimensionality.
pub const MAX_WORK_DIM: usize = 3;

static BUFFER_KEY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical host buffer, used as the coherence-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey(u64);

impl BufferKey {
    fn next() -> Self {
        BufferKey(BUFFER_KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Host-side backing store for an array argument.
///
/// The key identifies the logical data across devices; the payload is what
/// gets staged to device buffers and what read-back writes into. Shared as
/// `Arc<HostBuffer>` between the producer and every pool-internal copy of
/// a unit, so results are visible to the producer after `finish`.
#[derive(Debug)]
pub struct HostBuffer {
    key: BufferKey,
    data: RwLock<Vec<u8>>,
}

impl HostBuffer {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            key: BufferKey::next(),
            data: RwLock::new(data),
        })
    }

    /// Zero-filled buffer of `len` bytes, for write-back outputs.
    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::new(vec![0u8; len])
    }

    pub fn from_f32_slice(values: &[f32]) -> Arc<Self> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(bytes)
    }

    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data
            .read()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }
}

/// Launch geometry: dimensionality plus fixed-length offset/global/local
/// arrays. Unused trailing dimensions stay at their identity values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub work_dim: u32,
    pub global_offset: [usize; MAX_WORK_DIM],
    pub global_size: [usize; MAX_WORK_DIM],
    pub local_size: [usize; MAX_WORK_DIM],
}

impl LaunchGeometry {
    pub fn one_dim(global: usize, local: usize) -> Self {
        Self {
            work_dim: 1,
            global_offset: [0; MAX_WORK_DIM],
            global_size: [global, 1, 1],
            local_size: [local, 1, 1],
        }
    }

    pub fn two_dim(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            work_dim: 2,
            global_offset: [0; MAX_WORK_DIM],
            global_size: [global[0], global[1], 1],
            local_size: [local[0], local[1], 1],
        }
    }

    pub fn with_offset(mut self, offset: [usize; MAX_WORK_DIM]) -> Self {
        self.global_offset = offset;
        self
    }

    /// Total number of work items across all dimensions. A `work_dim`
    /// beyond [`MAX_WORK_DIM`] is treated as [`MAX_WORK_DIM`].
    pub fn global_items(&self) -> usize {
        let dims = (self.work_dim as usize).min(MAX_WORK_DIM);
        self.global_size[..dims].iter().product()
    }
}

/// One kernel argument slot.
#[derive(Debug, Clone)]
pub struct KernelArg {
    pub index: u32,
    pub value: ArgValue,
}

#[derive(Debug, Clone)]
pub enum ArgValue {
    Scalar(ScalarValue),
    Array {
        data: Arc<HostBuffer>,
        mode: AccessMode,
    },
}

/// Completion flag for one enqueued unit, observable by dependents.
///
/// Set by the worker thread once the unit's device queue has drained.
/// Also constructible standalone so producers can gate units on external
/// conditions.
#[derive(Debug, Default)]
pub struct UnitEvent {
    complete: AtomicBool,
}

impl UnitEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Predecessor completion signals a unit must observe before it becomes
/// claimable.
#[derive(Debug, Clone, Default)]
pub struct Dependency {
    wait_list: Vec<Arc<UnitEvent>>,
}

impl Dependency {
    pub fn new(wait_list: Vec<Arc<UnitEvent>>) -> Self {
        Self { wait_list }
    }

    pub fn on(events: &[&Arc<UnitEvent>]) -> Self {
        Self {
            wait_list: events.iter().map(|e| Arc::clone(e)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wait_list.is_empty()
    }

    pub fn satisfied(&self) -> bool {
        self.wait_list.iter().all(|e| e.is_complete())
    }
}

/// Work unit state machine. `Initialized` is the entry state; extraction
/// promotes to `Ready` or demotes to `Waiting`; `Complete` is terminal
/// for one slot occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Initialized,
    Waiting,
    Ready,
    Complete,
}

/// Per-device compiled kernel handles for one logical kernel, resolved
/// once at unit creation and looked up by device index at dispatch.
#[derive(Debug, Clone)]
pub struct KernelSet {
    per_device: Vec<KernelId>,
}

impl KernelSet {
    pub fn new(per_device: Vec<KernelId>) -> Self {
        Self { per_device }
    }

    pub fn get(&self, device: usize) -> Option<KernelId> {
        self.per_device.get(device).copied()
    }

    pub fn num_devices(&self) -> usize {
        self.per_device.len()
    }
}

/// A single schedulable task.
///
/// Handed to the pool by value-copy semantics: `enqueue` clones the unit
/// into an internal slot, so the producer may reuse or mutate its copy
/// immediately afterward. The completion event is shared across copies.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub(crate) kernels: KernelSet,
    pub(crate) geometry: LaunchGeometry,
    pub(crate) args: Vec<KernelArg>,
    pub(crate) dependency: Option<Dependency>,
    pub(crate) priority: u32,
    pub(crate) unit_index: u64,
    pub(crate) status: UnitStatus,
    pub(crate) completion: Arc<UnitEvent>,
}

impl WorkUnit {
    pub fn new(kernels: KernelSet, geometry: LaunchGeometry) -> Self {
        Self {
            kernels,
            geometry,
            args: Vec::new(),
            dependency: None,
            priority: 0,
            unit_index: 0,
            status: UnitStatus::Initialized,
            completion: UnitEvent::new(),
        }
    }

    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.dependency = Some(dep);
        self
    }

    /// Bind a scalar argument at `index`.
    pub fn bind_scalar(&mut self, index: u32, value: ScalarValue) {
        self.args.push(KernelArg {
            index,
            value: ArgValue::Scalar(value),
        });
    }

    /// Bind an array argument at `index`. The buffer key is the
    /// coherence-table identity; `mode` governs staging and write-back.
    pub fn bind_array(&mut self, index: u32, data: Arc<HostBuffer>, mode: AccessMode) {
        self.args.push(KernelArg {
            index,
            value: ArgValue::Array { data, mode },
        });
    }

    /// Completion event of this unit, for building dependency chains.
    pub fn completion(&self) -> Arc<UnitEvent> {
        Arc::clone(&self.completion)
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Sequence index assigned at enqueue; zero until then.
    pub fn unit_index(&self) -> u64 {
        self.unit_index
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn geometry(&self) -> &LaunchGeometry {
        &self.geometry
    }

    /// True when the unit has no outstanding dependency.
    pub(crate) fn dependency_clear(&self) -> bool {
        match &self.dependency {
            None => true,
            Some(dep) => dep.is_empty() || dep.satisfied(),
        }
    }
}
