//! Per-host latency state attached to each host's policy-data slot.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::host::HostPolicyData;
use crate::load_balancer::ewma::{self, Aggregation, DecayState};
use crate::load_balancer::ring::SampleRing;

/// Latency state of one host: a sample ring plus the decayed estimate
/// folded from it.
///
/// Sample recording is lock-free. Aggregation takes the decay state with
/// `try_lock`, so a second aggregator skips instead of waiting. The
/// estimate is mirrored into atomics for lock-free reads on the selection
/// path.
#[derive(Debug)]
pub struct PeakEwmaHostData {
    ring: SampleRing,
    decay: Mutex<DecayState>,
    /// Published estimate, stored as the bits of an `f64`.
    ewma_bits: AtomicU64,
    last_update_ns: AtomicU64,
    read_cursor: AtomicU64,
}

impl PeakEwmaHostData {
    /// Create empty state with a ring of `max_samples` slots.
    pub fn new(max_samples: usize) -> Self {
        Self {
            ring: SampleRing::new(max_samples),
            decay: Mutex::new(DecayState::default()),
            ewma_bits: AtomicU64::new(0.0f64.to_bits()),
            last_update_ns: AtomicU64::new(0),
            read_cursor: AtomicU64::new(0),
        }
    }

    /// Record one round-trip time observed at `timestamp_ns`.
    pub fn record_rtt_sample(&self, rtt_ms: f64, timestamp_ns: u64) {
        self.ring.push(rtt_ms, timestamp_ns);
    }

    /// Current decayed estimate in milliseconds; `0.0` means no data yet.
    pub fn ewma_rtt(&self) -> f64 {
        f64::from_bits(self.ewma_bits.load(Ordering::Acquire))
    }

    /// Timestamp of the last folded sample, `0` if none.
    pub fn last_update_time(&self) -> u64 {
        self.last_update_ns.load(Ordering::Acquire)
    }

    /// Number of samples ever recorded.
    pub fn write_cursor(&self) -> u64 {
        self.ring.write_cursor()
    }

    /// Number of samples consumed (folded or skipped) by aggregation.
    pub fn read_cursor(&self) -> u64 {
        self.read_cursor.load(Ordering::Acquire)
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Fold every sample recorded since the previous aggregation into the
    /// estimate, using a decay time of `tau_ns` nanoseconds.
    ///
    /// Returns `None` when another thread is aggregating this host.
    pub fn aggregate(&self, tau_ns: f64) -> Option<Aggregation> {
        let mut state = self.decay.try_lock()?;
        let result = ewma::drain(&self.ring, &mut state, tau_ns);

        self.last_update_ns
            .store(state.last_update_ns, Ordering::Release);
        self.read_cursor.store(state.read_cursor, Ordering::Release);
        self.ewma_bits.store(state.ewma.to_bits(), Ordering::Release);
        Some(result)
    }
}

impl HostPolicyData for PeakEwmaHostData {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
