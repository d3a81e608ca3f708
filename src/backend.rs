//! The capability seam between the scheduler core and a concrete compute
//! runtime. Everything device-specific (enumeration, compilation, buffer
//! IO, kernel submission) lives behind [`ComputeBackend`]; the core never
//! assumes a particular API underneath it.

use crate::error::Result;
use crate::unit::LaunchGeometry;

/// Stable position of a device in the registry's device array.
pub type DeviceIndex = usize;

/// Opaque handle to a kernel compiled for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// Opaque handle to a device-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBufferId(pub u64);

/// Broad device category, used for reporting only; scheduling treats all
/// devices uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

/// Descriptive device metadata surfaced at enumeration time.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub compute_units: u32,
    pub clock_mhz: u32,
}

/// A kernel source reference: where the program text comes from and which
/// entry point to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub program: String,
    pub entry: String,
}

impl KernelSource {
    pub fn new<P: Into<String>, E: Into<String>>(program: P, entry: E) -> Self {
        Self {
            program: program.into(),
            entry: entry.into(),
        }
    }
}

/// Access mode of a device buffer, doubling as the coherence flag: a
/// buffer that was only ever read or only ever written on a device never
/// diverges from the valid copy and may be reused without migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Scalar values a kernel argument can carry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I32(i32),
    F32(f32),
}

/// A fully resolved kernel argument, ready for submission.
#[derive(Debug, Clone, Copy)]
pub enum BoundArg {
    Scalar { index: u32, value: ScalarValue },
    Buffer { index: u32, buffer: DeviceBufferId },
}

/// The set of operations the scheduler consumes from a compute runtime.
///
/// Implementations must be internally synchronized: the pool calls into
/// the backend concurrently from one thread per device.
pub trait ComputeBackend: Send + Sync + 'static {
    /// Enumerate every visible device, in stable order.
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Compile `source` for one device. A build failure carries the
    /// backend's diagnostic log in the error text.
    fn compile_kernel(&self, device: DeviceIndex, source: &KernelSource) -> Result<KernelId>;

    /// Allocate a device buffer. `init` requests copy-in of host data at
    /// creation, the fastest path when the mode allows it.
    fn create_buffer(
        &self,
        device: DeviceIndex,
        size: usize,
        mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<DeviceBufferId>;

    fn write_buffer(&self, device: DeviceIndex, buffer: DeviceBufferId, data: &[u8]) -> Result<()>;

    fn read_buffer(&self, device: DeviceIndex, buffer: DeviceBufferId, out: &mut [u8])
        -> Result<()>;

    fn release_buffer(&self, device: DeviceIndex, buffer: DeviceBufferId) -> Result<()>;

    /// Submit an N-dimensional kernel launch to the device's queue. The
    /// call may return before execution completes.
    fn launch_kernel(
        &self,
        device: DeviceIndex,
        kernel: KernelId,
        geometry: &LaunchGeometry,
        args: &[BoundArg],
    ) -> Result<()>;

    /// Block until every outstanding command on the device's queue has
    /// finished.
    fn finish_queue(&self, device: DeviceIndex) -> Result<()>;
}
