//! Cross-device buffer coherence.
//!
//! Maps each logical host buffer to a per-device array of device buffers
//! plus a validity marker. Buffers are created lazily on first request and
//! migrated between devices on demand through a host staging copy; a
//! buffer that was only ever read or only ever written on a device never
//! diverged and can be revalidated without a transfer.

use crate::backend::{AccessMode, ComputeBackend, DeviceBufferId, DeviceIndex};
use crate::error::{Error, Result};
use crate::unit::{BufferKey, HostBuffer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct DeviceSlot {
    buffer: DeviceBufferId,
    mode: AccessMode,
}

#[derive(Debug)]
struct TableEntry {
    slots: Vec<Option<DeviceSlot>>,
    valid_idx: DeviceIndex,
}

/// Accumulated buffer-management timing, owned by the table instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherenceMetrics {
    /// Total time spent inside `request`, transfers included.
    pub buffer_time: Duration,
    /// Time spent on device-to-device migrations.
    pub transfer_time: Duration,
    /// Number of migrations performed.
    pub transfers: u64,
}

/// The buffer coherence table for one scheduling epoch.
pub struct BufferTable {
    num_devices: usize,
    entries: Mutex<HashMap<BufferKey, TableEntry>>,
    buffer_time_ns: AtomicU64,
    transfer_time_ns: AtomicU64,
    transfers: AtomicU64,
}

impl std::fmt::Debug for BufferTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferTable")
            .field("num_devices", &self.num_devices)
            .field("num_entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl BufferTable {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            entries: Mutex::new(HashMap::new()),
            buffer_time_ns: AtomicU64::new(0),
            transfer_time_ns: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
        }
    }

    /// Resolve a device-resident buffer for `host` on `device`.
    ///
    /// Three cases: no entry yet (allocate per `mode`, mark valid);
    /// requested device already valid (return directly); another device
    /// valid (revalidate without transfer if the local copy never
    /// diverged, otherwise migrate through a host staging copy).
    pub fn request(
        &self,
        backend: &dyn ComputeBackend,
        device: DeviceIndex,
        host: &HostBuffer,
        mode: AccessMode,
    ) -> Result<DeviceBufferId> {
        let begin = Instant::now();
        let result = self.request_inner(backend, device, host, mode);
        self.buffer_time_ns
            .fetch_add(begin.elapsed().as_nanos() as u64, Ordering::Relaxed);
        result
    }

    fn request_inner(
        &self,
        backend: &dyn ComputeBackend,
        device: DeviceIndex,
        host: &HostBuffer,
        mode: AccessMode,
    ) -> Result<DeviceBufferId> {
        if device >= self.num_devices {
            return Err(Error::configuration(format!(
                "buffer requested for invalid device index {device}"
            )));
        }

        let mut entries = self.entries.lock();
        let key = host.key();
        let size = host.len();

        if let Some(entry) = entries.get_mut(&key) {
            if entry.valid_idx == device {
                let slot = entry.slots[device].ok_or_else(|| {
                    Error::internal("valid device holds no buffer for its entry")
                })?;
                trace!(?key, device, "buffer hit on valid device");
                return Ok(slot.buffer);
            }

            // Another device holds the valid copy.
            if let Some(slot) = entry.slots[device] {
                if matches!(slot.mode, AccessMode::ReadOnly | AccessMode::WriteOnly) {
                    // Local copy never diverged; flip validity, no transfer.
                    entry.valid_idx = device;
                    trace!(?key, device, "coherent local copy revalidated");
                    return Ok(slot.buffer);
                }
            }

            // Migrate: valid device -> host staging -> requested device.
            let transfer_begin = Instant::now();
            let src = entry.slots[entry.valid_idx]
                .ok_or_else(|| Error::internal("valid device holds no buffer for its entry"))?;

            let mut staging = vec![0u8; size];
            backend.read_buffer(entry.valid_idx, src.buffer, &mut staging)?;

            let dst = match entry.slots[device] {
                Some(slot) => slot.buffer,
                None => backend.create_buffer(device, size, AccessMode::ReadWrite, None)?,
            };
            backend.write_buffer(device, dst, &staging)?;

            entry.slots[device] = Some(DeviceSlot { buffer: dst, mode });
            let from = entry.valid_idx;
            entry.valid_idx = device;

            self.transfer_time_ns
                .fetch_add(transfer_begin.elapsed().as_nanos() as u64, Ordering::Relaxed);
            self.transfers.fetch_add(1, Ordering::Relaxed);
            debug!(?key, from, to = device, size, "migrated buffer");
            return Ok(dst);
        }

        // First request for this data: allocate lazily on the requesting
        // device, copying host data in where the mode allows it.
        let buffer = match mode {
            AccessMode::ReadOnly | AccessMode::WriteOnly => {
                host.with_data(|data| backend.create_buffer(device, size, mode, Some(data)))?
            }
            AccessMode::ReadWrite => {
                let buffer = backend.create_buffer(device, size, mode, None)?;
                host.with_data(|data| backend.write_buffer(device, buffer, data))?;
                buffer
            }
        };

        let mut slots: Vec<Option<DeviceSlot>> = vec![None; self.num_devices];
        slots[device] = Some(DeviceSlot { buffer, mode });
        entries.insert(
            key,
            TableEntry {
                slots,
                valid_idx: device,
            },
        );
        debug!(?key, device, size, ?mode, "created buffer entry");
        Ok(buffer)
    }

    /// Release every device buffer across every entry and clear the
    /// table. Invoked between scheduling epochs, not automatically.
    pub fn reset(&self, backend: &dyn ComputeBackend) -> Result<()> {
        let mut entries = self.entries.lock();
        for (key, entry) in entries.drain() {
            for (device, slot) in entry.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    backend.release_buffer(device, slot.buffer)?;
                    trace!(?key, device, "released buffer");
                }
            }
        }
        Ok(())
    }

    pub fn num_entries(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn metrics(&self) -> CoherenceMetrics {
        CoherenceMetrics {
            buffer_time: Duration::from_nanos(self.buffer_time_ns.load(Ordering::Relaxed)),
            transfer_time: Duration::from_nanos(self.transfer_time_ns.load(Ordering::Relaxed)),
            transfers: self.transfers.load(Ordering::Relaxed),
        }
    }
}
