//! In-process simulated compute backend for exercising the scheduler
//! without real devices. Buffers live in host memory, kernels are a small
//! fixed set interpreted by entry name, and per-device delay models make
//! queue-drain latency controllable from tests.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use hetpool::backend::{
    AccessMode, BoundArg, ComputeBackend, DeviceBufferId, DeviceIndex, DeviceInfo, DeviceKind,
    KernelId, KernelSource, ScalarValue,
};
use hetpool::error::{Error, Result};
use hetpool::unit::LaunchGeometry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

const KNOWN_KERNELS: &[&str] = &["vec_add", "scale", "noop"];

/// Queue-drain latency of one simulated device: `base + step * n` for the
/// n-th launch, so tests can make a device degrade over time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayModel {
    pub base: Duration,
    pub step: Duration,
}

impl DelayModel {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            step: Duration::ZERO,
        }
    }

    pub fn degrading(base: Duration, step: Duration) -> Self {
        Self { base, step }
    }
}

#[derive(Default)]
struct SimState {
    next_kernel: u64,
    next_buffer: u64,
    kernels: HashMap<KernelId, (DeviceIndex, String)>,
    buffers: HashMap<DeviceBufferId, (DeviceIndex, Vec<u8>)>,
    launches: Vec<u64>,
    pending_delay: Vec<Duration>,
}

pub struct SimBackend {
    devices: Vec<DeviceInfo>,
    delays: Vec<DelayModel>,
    state: Mutex<SimState>,
}

impl SimBackend {
    pub fn new(num_devices: usize) -> Self {
        Self::with_delays(vec![DelayModel::default(); num_devices])
    }

    pub fn with_delays(delays: Vec<DelayModel>) -> Self {
        let devices = (0..delays.len())
            .map(|i| DeviceInfo {
                name: format!("sim-device-{i}"),
                vendor: "hetpool-sim".to_string(),
                kind: if i % 2 == 0 {
                    DeviceKind::Gpu
                } else {
                    DeviceKind::Cpu
                },
                compute_units: 8,
                clock_mhz: 1000,
            })
            .collect();
        let num = delays.len();
        Self {
            devices,
            delays,
            state: Mutex::new(SimState {
                launches: vec![0; num],
                pending_delay: vec![Duration::ZERO; num],
                ..SimState::default()
            }),
        }
    }

    /// Number of device buffers currently allocated across all devices.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn launches(&self, device: DeviceIndex) -> u64 {
        self.state.lock().launches[device]
    }

    fn buffer_bytes(
        state: &HashMap<DeviceBufferId, (DeviceIndex, Vec<u8>)>,
        device: DeviceIndex,
        id: DeviceBufferId,
    ) -> Result<Vec<u8>> {
        let (owner, bytes) = state
            .get(&id)
            .ok_or_else(|| Error::launch(format!("unknown buffer {id:?}")))?;
        if *owner != device {
            return Err(Error::launch(format!(
                "buffer {id:?} belongs to device {owner}, not {device}"
            )));
        }
        Ok(bytes.clone())
    }

    fn arg_buffer(args: &[BoundArg], index: u32) -> Result<DeviceBufferId> {
        args.iter()
            .find_map(|a| match a {
                BoundArg::Buffer { index: i, buffer } if *i == index => Some(*buffer),
                _ => None,
            })
            .ok_or_else(|| Error::launch(format!("missing buffer argument {index}")))
    }

    fn arg_scalar_f32(args: &[BoundArg], index: u32) -> Result<f32> {
        args.iter()
            .find_map(|a| match a {
                BoundArg::Scalar {
                    index: i,
                    value: ScalarValue::F32(v),
                } if *i == index => Some(*v),
                _ => None,
            })
            .ok_or_else(|| Error::launch(format!("missing f32 scalar argument {index}")))
    }
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

impl ComputeBackend for SimBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn compile_kernel(&self, device: DeviceIndex, source: &KernelSource) -> Result<KernelId> {
        if !KNOWN_KERNELS.contains(&source.entry.as_str()) {
            return Err(Error::build(format!(
                "undefined entry point `{}` in `{}`",
                source.entry, source.program
            )));
        }
        let mut state = self.state.lock();
        state.next_kernel += 1;
        let id = KernelId(state.next_kernel);
        state.kernels.insert(id, (device, source.entry.clone()));
        Ok(id)
    }

    fn create_buffer(
        &self,
        device: DeviceIndex,
        size: usize,
        _mode: AccessMode,
        init: Option<&[u8]>,
    ) -> Result<DeviceBufferId> {
        let mut state = self.state.lock();
        state.next_buffer += 1;
        let id = DeviceBufferId(state.next_buffer);
        let data = match init {
            Some(bytes) => {
                if bytes.len() != size {
                    return Err(Error::launch("init data size mismatch"));
                }
                bytes.to_vec()
            }
            None => vec![0u8; size],
        };
        state.buffers.insert(id, (device, data));
        Ok(id)
    }

    fn write_buffer(&self, device: DeviceIndex, buffer: DeviceBufferId, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let (owner, bytes) = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::launch(format!("unknown buffer {buffer:?}")))?;
        if *owner != device {
            return Err(Error::launch("write to buffer on wrong device"));
        }
        bytes.clear();
        bytes.extend_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        device: DeviceIndex,
        buffer: DeviceBufferId,
        out: &mut [u8],
    ) -> Result<()> {
        let state = self.state.lock();
        let data = Self::buffer_bytes(&state.buffers, device, buffer)?;
        if out.len() > data.len() {
            return Err(Error::launch("read past end of buffer"));
        }
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }

    fn release_buffer(&self, _device: DeviceIndex, buffer: DeviceBufferId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .buffers
            .remove(&buffer)
            .ok_or_else(|| Error::launch(format!("double release of buffer {buffer:?}")))?;
        Ok(())
    }

    fn launch_kernel(
        &self,
        device: DeviceIndex,
        kernel: KernelId,
        geometry: &LaunchGeometry,
        args: &[BoundArg],
    ) -> Result<()> {
        let mut state = self.state.lock();

        let entry = {
            let (owner, entry) = state
                .kernels
                .get(&kernel)
                .ok_or_else(|| Error::launch(format!("unknown kernel {kernel:?}")))?;
            if *owner != device {
                return Err(Error::launch("kernel compiled for a different device"));
            }
            entry.clone()
        };

        let n = geometry.global_items();
        match entry.as_str() {
            "vec_add" => {
                let a = f32s(&Self::buffer_bytes(
                    &state.buffers,
                    device,
                    Self::arg_buffer(args, 0)?,
                )?);
                let b = f32s(&Self::buffer_bytes(
                    &state.buffers,
                    device,
                    Self::arg_buffer(args, 1)?,
                )?);
                let out_id = Self::arg_buffer(args, 2)?;
                if a.len() < n || b.len() < n {
                    return Err(Error::launch("vec_add inputs shorter than global size"));
                }
                let result: Vec<f32> = (0..n).map(|i| a[i] + b[i]).collect();
                state
                    .buffers
                    .get_mut(&out_id)
                    .ok_or_else(|| Error::launch("unknown output buffer"))?
                    .1 = bytes(&result);
            }
            "scale" => {
                let factor = Self::arg_scalar_f32(args, 2)?;
                let input = f32s(&Self::buffer_bytes(
                    &state.buffers,
                    device,
                    Self::arg_buffer(args, 0)?,
                )?);
                let out_id = Self::arg_buffer(args, 1)?;
                let result: Vec<f32> = input.iter().take(n).map(|v| v * factor).collect();
                state
                    .buffers
                    .get_mut(&out_id)
                    .ok_or_else(|| Error::launch("unknown output buffer"))?
                    .1 = bytes(&result);
            }
            "noop" => {}
            other => return Err(Error::launch(format!("unhandled kernel `{other}`"))),
        }

        let delay = self.delays[device];
        let owed = delay.base + delay.step * state.launches[device] as u32;
        state.launches[device] += 1;
        state.pending_delay[device] += owed;
        Ok(())
    }

    fn finish_queue(&self, device: DeviceIndex) -> Result<()> {
        let owed = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_delay[device])
        };
        if owed > Duration::ZERO {
            std::thread::sleep(owed);
        }
        Ok(())
    }
}

/// Initialize test logging once; respects `RUST_LOG`.
#[allow(dead_code)]
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
