//! Convenience re-exports for typical pool usage.

pub use crate::backend::{
    AccessMode, ComputeBackend, DeviceInfo, DeviceKind, KernelSource, ScalarValue,
};
pub use crate::config::{PoolConfig, SchedulingPolicy};
pub use crate::error::{Error, Result};
pub use crate::pool::{DispatchHooks, PoolReport, PoolState, WorkPool};
pub use crate::unit::{Dependency, HostBuffer, KernelSet, LaunchGeometry, UnitEvent, WorkUnit};
