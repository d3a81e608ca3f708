//! hetpool - heterogeneous-device work-pool scheduler
//!
//! A host-side runtime that queues kernel dispatches in a bounded shared
//! pool and drives them through one scheduler thread per compute device,
//! with lazy cross-device buffer coherence.
//!
//! # Quick Start
//!
//! ```no_run
//! use hetpool::prelude::*;
//! use std::sync::Arc;
//!
//! # fn run(backend: Arc<dyn ComputeBackend>) -> hetpool::Result<()> {
//! let config = PoolConfig::builder()
//!     .capacity(8)
//!     .expected_units(4)
//!     .build()?;
//! let pool = WorkPool::new(config, backend)?;
//!
//! let kernels = pool.registry().compile_kernel_set(
//!     &KernelSource::new("kernels/vec_add.cl", "vec_add"),
//! )?;
//!
//! let a = HostBuffer::from_f32_slice(&[1.0; 1024]);
//! let b = HostBuffer::from_f32_slice(&[2.0; 1024]);
//! let out = HostBuffer::zeroed(4096);
//!
//! let mut unit = WorkUnit::new(kernels, LaunchGeometry::one_dim(1024, 64));
//! unit.bind_array(0, a, AccessMode::ReadOnly);
//! unit.bind_array(1, b, AccessMode::ReadOnly);
//! unit.bind_array(2, out.clone(), AccessMode::ReadWrite);
//!
//! pool.enqueue(&unit, 0)?;
//! let report = pool.finish()?;
//! assert_eq!(report.metrics.units_completed, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Work pool**: fixed-capacity circular buffer guarded by a mutex and
//!   not-empty/not-full condition variables; enqueue blocks at capacity,
//!   extraction sleeps when empty.
//! - **Scheduler threads**: one per device, claiming work under a
//!   round-robin, static-ratio, or dynamic feedback policy.
//! - **Buffer coherence table**: per host buffer, tracks which device
//!   holds the valid copy and migrates lazily on demand.
//! - **Compute backend**: everything device-specific sits behind the
//!   [`backend::ComputeBackend`] trait.

#![warn(missing_debug_implementations)]

pub mod backend;
pub mod coherence;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod unit;

mod scheduler;

pub use backend::{AccessMode, ComputeBackend, DeviceInfo, DeviceKind, KernelSource, ScalarValue};
pub use coherence::CoherenceMetrics;
pub use config::{PoolConfig, PoolConfigBuilder, SchedulingPolicy, MAX_PRIORITY};
pub use device::{DeviceContext, DeviceRegistry};
pub use error::{Error, Result};
pub use metrics::MetricsSnapshot;
pub use pool::{DispatchHooks, PoolReport, PoolState, WorkPool};
pub use unit::{Dependency, HostBuffer, KernelSet, LaunchGeometry, UnitEvent, UnitStatus, WorkUnit};
