//! Per-device scheduler threads and the work-division policies they run.
//!
//! Each device gets one thread executing a claim loop until teardown.
//! Round-robin gates on the head-of-queue sequence index; the ratio
//! policies derive per-device quotas from configured shares, and the
//! dynamic variant additionally shifts quota away from devices whose
//! execution times trend upward.

use crate::config::SchedulingPolicy;
use crate::device::DeviceContext;
use crate::error::Result;
use crate::pool::PoolShared;
use std::hint::spin_loop;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Load trend of one device, judged from its recent execution times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusyTrend {
    Stay,
    Up,
    Down,
}

/// Apportion `total` units across devices proportionally to `shares`,
/// using largest remainders so the quotas sum to exactly `total`.
pub(crate) fn quotas(shares: &[u32], total: u64) -> Vec<u64> {
    let sum: u64 = shares.iter().map(|&s| u64::from(s)).sum();
    debug_assert!(sum > 0);

    let mut result: Vec<u64> = shares
        .iter()
        .map(|&s| total * u64::from(s) / sum)
        .collect();
    let mut assigned: u64 = result.iter().sum();

    let mut remainders: Vec<(usize, u64)> = shares
        .iter()
        .enumerate()
        .map(|(i, &s)| (i, (total * u64::from(s)) % sum))
        .collect();
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut extra = remainders.into_iter();
    while assigned < total {
        match extra.next() {
            Some((i, _)) => {
                result[i] += 1;
                assigned += 1;
            }
            None => break,
        }
    }
    result
}

/// True when the last three samples are strictly increasing.
pub(crate) fn trend_increasing(history: &[Duration]) -> bool {
    let n = history.len();
    n >= 3 && history[n - 1] > history[n - 2] && history[n - 2] > history[n - 3]
}

/// Escalating wait for gated or idle claim loops: spin, then yield, then
/// park briefly.
struct ClaimBackoff {
    step: u32,
}

impl ClaimBackoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 16;

    fn new() -> Self {
        Self { step: 0 }
    }

    fn reset(&mut self) {
        self.step = 0;
    }

    fn wait(&mut self) {
        if self.step < Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                spin_loop();
            }
        } else if self.step < Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::park_timeout(Duration::from_micros(50));
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Per-thread view of the active policy.
struct DevicePlan {
    quota: Option<u64>,
}

impl DevicePlan {
    fn new(policy: &SchedulingPolicy, device: usize, expected_units: u64) -> Self {
        let quota = policy
            .shares()
            .map(|shares| quotas(shares, expected_units)[device]);
        Self { quota }
    }
}

/// Entry point of one scheduler thread. Any error escaping the claim
/// loop is fatal for the whole pool: it is recorded, every blocked
/// producer and worker is woken, and `finish` surfaces it. There is no
/// per-unit recovery below the device layer.
pub(crate) fn worker_loop(shared: Arc<PoolShared>, device: DeviceContext) {
    let result = run_device(&shared, &device);
    shared.inner.lock().exited[device.index()] = true;
    if let Err(e) = result {
        error!(device = device.index(), error = %e, "scheduler thread failed, failing the pool");
        shared.fail(e);
    }
}

fn run_device(shared: &Arc<PoolShared>, device: &DeviceContext) -> Result<()> {
    let d = device.index();
    let num_devices = shared.registry.len();
    let plan = DevicePlan::new(
        &shared.config.policy,
        d,
        shared.config.expected_units as u64,
    );
    let mut backoff = ClaimBackoff::new();

    loop {
        if shared.done.load(Ordering::Acquire) {
            break;
        }

        // Policy gate before claiming anything.
        match &shared.config.policy {
            SchedulingPolicy::RoundRobin => match shared.query() {
                Some(seq) if (seq - 1) % num_devices as u64 == d as u64 => {}
                Some(_) => {
                    // Head unit belongs to a peer.
                    backoff.wait();
                    continue;
                }
                // Empty pool: fall through and sleep in extraction.
                None => {}
            },
            SchedulingPolicy::StaticRatio { .. } | SchedulingPolicy::Dynamic { .. } => {
                if quota_reached(shared, &plan, d) {
                    debug!(device = d, "quota reached, scheduler exiting");
                    break;
                }
            }
        }

        let Some(claim) = shared.extract_and_distribute(device)? else {
            backoff.wait();
            continue;
        };
        backoff.reset();

        // Serialize against actual device completion before claiming
        // again: one in-flight unit per device.
        shared.registry.backend().finish_queue(d)?;
        let exec = claim.dispatched_at.elapsed();
        claim.completion.mark_complete();
        shared.metrics.record_completed(exec.as_nanos() as u64);
        trace!(device = d, seq = claim.unit_index, ?exec, "unit complete");

        record_completion(shared, d, num_devices, exec);
    }

    Ok(())
}

/// Check whether this device's quota (initial share plus any dynamic
/// offset) has been met; marks the device exited under the pool lock so
/// no peer can transfer quota to it afterward.
fn quota_reached(shared: &PoolShared, plan: &DevicePlan, device: usize) -> bool {
    let Some(quota) = plan.quota else {
        return false;
    };
    let mut inner = shared.inner.lock();
    let target = quota as i64 + inner.offset[device];
    if (inner.completed[device] as i64) >= target {
        inner.exited[device] = true;
        true
    } else {
        false
    }
}

/// Post-completion bookkeeping: counters, execution-time history, and —
/// for the dynamic policy — trend detection and quota transfer.
fn record_completion(shared: &PoolShared, device: usize, num_devices: usize, exec: Duration) {
    let mut guard = shared.inner.lock();
    let inner = &mut *guard;

    inner.completed[device] += 1;
    inner.exec_history[device].push(exec);

    if matches!(shared.config.policy, SchedulingPolicy::Dynamic { .. }) {
        if trend_increasing(&inner.exec_history[device]) {
            inner.busy[device] = BusyTrend::Up;
        }

        if inner.busy[device] == BusyTrend::Up {
            // Hand one unit of quota to the first peer that is neither
            // trending up nor already finished.
            let peer = (0..num_devices)
                .find(|&i| i != device && inner.busy[i] != BusyTrend::Up && !inner.exited[i]);
            if let Some(peer) = peer {
                inner.offset[device] -= 1;
                inner.offset[peer] += 1;
                debug!(from = device, to = peer, "transferred one unit of quota");
            }
        }
    }
}
