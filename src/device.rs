//! Device enumeration and per-device context metadata.

use crate::backend::{ComputeBackend, DeviceIndex, DeviceInfo, KernelSource};
use crate::error::{Error, Result};
use crate::unit::KernelSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One compute device: its stable index in the pool's device array plus
/// descriptive metadata. Created once at registry construction and
/// immutable thereafter.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    index: DeviceIndex,
    info: DeviceInfo,
}

impl DeviceContext {
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

/// All devices visible to one pool, in backend enumeration order.
pub struct DeviceRegistry {
    backend: Arc<dyn ComputeBackend>,
    devices: Vec<DeviceContext>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Enumerate devices through the backend. Finding none is a
    /// configuration error.
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        let infos = backend.enumerate_devices()?;
        if infos.is_empty() {
            return Err(Error::configuration("no compute devices found"));
        }

        let devices: Vec<DeviceContext> = infos
            .into_iter()
            .enumerate()
            .map(|(index, info)| DeviceContext { index, info })
            .collect();

        for dev in &devices {
            info!(
                index = dev.index,
                name = %dev.info.name,
                vendor = %dev.info.vendor,
                compute_units = dev.info.compute_units,
                clock_mhz = dev.info.clock_mhz,
                "enumerated device"
            );
        }

        Ok(Self { backend, devices })
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, index: DeviceIndex) -> Result<&DeviceContext> {
        self.devices
            .get(index)
            .ok_or_else(|| Error::configuration(format!("invalid device index {index}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceContext> {
        self.devices.iter()
    }

    /// Compile one kernel source for every device, producing the
    /// per-device handle set a work unit carries. Resolved once here and
    /// looked up by index at dispatch.
    pub fn compile_kernel_set(&self, source: &KernelSource) -> Result<KernelSet> {
        let mut handles = Vec::with_capacity(self.devices.len());
        for dev in &self.devices {
            debug!(device = dev.index, entry = %source.entry, "compiling kernel");
            let kernel = self.backend.compile_kernel(dev.index, source)?;
            handles.push(kernel);
        }
        Ok(KernelSet::new(handles))
    }
}
