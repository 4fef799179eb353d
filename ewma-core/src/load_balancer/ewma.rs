//! Time-correct exponential decay of round-trip-time samples.
//!
//! The weight of a sample depends only on the gap between its timestamp
//! and the timestamp of the previously folded sample. When the fold runs
//! has no influence on the result, so a delayed aggregation pass produces
//! exactly the estimate a prompt one would have.

use crate::load_balancer::ring::{RttSample, SampleRing, SlotRead};

/// Mutable decay state of one host. Guarded by the owning host data.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct DecayState {
    /// Current estimate in milliseconds; `0.0` until the first fold.
    pub(crate) ewma: f64,
    /// Timestamp of the last folded sample; `0` until the first fold.
    pub(crate) last_update_ns: u64,
    /// Write index of the next sample to drain.
    pub(crate) read_cursor: u64,
}

/// Result of one drain of a host's sample ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregation {
    /// Estimate after the drain, in milliseconds.
    pub ewma: f64,
    /// Samples folded into the estimate.
    pub folded: u64,
    /// Samples lost to ring overflow and skipped unread.
    pub skipped: u64,
    /// Recorded samples left out of the estimate because their round-trip
    /// time was NaN or infinite.
    pub rejected: u64,
    /// Whether the drain stopped at a sample still being written.
    pub pending: bool,
}

/// Smoothing factor for a sample arriving `dt_ns` after the previous one.
///
/// `1 - e^(-dt / tau)`: zero for simultaneous samples, approaching one as
/// the gap grows well past the decay time.
pub fn decay_alpha(dt_ns: u64, tau_ns: f64) -> f64 {
    1.0 - (-(dt_ns as f64) / tau_ns).exp()
}

/// Fold a single sample into `state`.
pub(crate) fn fold(state: &mut DecayState, sample: RttSample, tau_ns: f64) {
    if state.last_update_ns == 0 {
        state.ewma = sample.rtt_ms;
        state.last_update_ns = sample.timestamp_ns;
        return;
    }

    // Concurrent writers may publish slightly out of timestamp order.
    let dt_ns = sample.timestamp_ns.saturating_sub(state.last_update_ns);
    let alpha = decay_alpha(dt_ns, tau_ns);
    state.ewma = alpha * sample.rtt_ms + (1.0 - alpha) * state.ewma;
    state.last_update_ns = state.last_update_ns.max(sample.timestamp_ns);
}

/// Drain every sample written since the last drain, oldest first.
///
/// Slots already lapped by the writers are skipped without being read.
/// Non-finite round-trip times are consumed but never folded, since one
/// would pin the estimate at NaN or infinity for good. A slot whose writer is still mid-publish ends the drain; it is picked
/// up by the next one.
pub(crate) fn drain(ring: &SampleRing, state: &mut DecayState, tau_ns: f64) -> Aggregation {
    let write_cursor = ring.write_cursor();
    let available = write_cursor.saturating_sub(state.read_cursor);
    let mut skipped = available.saturating_sub(ring.capacity() as u64);
    state.read_cursor += skipped;

    let mut folded = 0;
    let mut rejected = 0;
    let mut pending = false;
    while state.read_cursor < write_cursor {
        match ring.read(state.read_cursor) {
            SlotRead::Ready(sample) if !sample.rtt_ms.is_finite() => rejected += 1,
            SlotRead::Ready(sample) => {
                fold(state, sample, tau_ns);
                folded += 1;
            }
            SlotRead::Overwritten => skipped += 1,
            SlotRead::Pending => {
                pending = true;
                break;
            }
        }
        state.read_cursor += 1;
    }

    Aggregation {
        ewma: state.ewma,
        folded,
        skipped,
        rejected,
        pending,
    }
}
