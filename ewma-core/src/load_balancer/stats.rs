//! Load balancer statistics and the per-host bookkeeping table.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::host::{HostId, SharedHost};
use crate::load_balancer::ewma::Aggregation;

/// Counters kept by one load balancer instance.
#[derive(Debug, Default)]
pub struct LbStats {
    choose_host_calls: AtomicU64,
    no_host_selected: AtomicU64,
    lb_healthy_panic: AtomicU64,
    aggregation_passes: AtomicU64,
    samples_folded: AtomicU64,
    samples_overflowed: AtomicU64,
    samples_rejected: AtomicU64,
    hosts_added: AtomicU64,
    hosts_removed: AtomicU64,
}

impl LbStats {
    pub(crate) fn record_choose_host(&self) {
        self.choose_host_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_no_host(&self) {
        self.no_host_selected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.lb_healthy_panic.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aggregation_pass(&self) {
        self.aggregation_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aggregation(&self, aggregation: &Aggregation) {
        self.samples_folded
            .fetch_add(aggregation.folded, Ordering::Relaxed);
        self.samples_overflowed
            .fetch_add(aggregation.skipped, Ordering::Relaxed);
        self.samples_rejected
            .fetch_add(aggregation.rejected, Ordering::Relaxed);
    }

    pub(crate) fn record_membership(&self, added: usize, removed: usize) {
        self.hosts_added.fetch_add(added as u64, Ordering::Relaxed);
        self.hosts_removed.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> LbStatsSnapshot {
        LbStatsSnapshot {
            choose_host_calls: self.choose_host_calls.load(Ordering::Relaxed),
            no_host_selected: self.no_host_selected.load(Ordering::Relaxed),
            lb_healthy_panic: self.lb_healthy_panic.load(Ordering::Relaxed),
            aggregation_passes: self.aggregation_passes.load(Ordering::Relaxed),
            samples_folded: self.samples_folded.load(Ordering::Relaxed),
            samples_overflowed: self.samples_overflowed.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            hosts_added: self.hosts_added.load(Ordering::Relaxed),
            hosts_removed: self.hosts_removed.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`LbStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LbStatsSnapshot {
    /// Calls to `choose_host`.
    pub choose_host_calls: u64,
    /// Calls that found no eligible host.
    pub no_host_selected: u64,
    /// Selections made in panic mode.
    pub lb_healthy_panic: u64,
    /// Aggregation passes over the host set.
    pub aggregation_passes: u64,
    /// Samples folded into estimates.
    pub samples_folded: u64,
    /// Samples lost to ring overflow.
    pub samples_overflowed: u64,
    /// Non-finite samples left out of estimates.
    pub samples_rejected: u64,
    /// Hosts reported added by membership updates.
    pub hosts_added: u64,
    /// Hosts reported removed by membership updates.
    pub hosts_removed: u64,
}

/// Load-balancer-side record of a host it has aggregated.
///
/// Holds a strong reference to the host, so it must be erased when the
/// host leaves the pool.
#[derive(Debug)]
pub(crate) struct HostStats {
    host: SharedHost,
    aggregations: u64,
    samples_folded: u64,
    samples_skipped: u64,
    last_ewma: f64,
}

impl HostStats {
    pub(crate) fn new(host: SharedHost) -> Self {
        Self {
            host,
            aggregations: 0,
            samples_folded: 0,
            samples_skipped: 0,
            last_ewma: 0.0,
        }
    }

    pub(crate) fn record(&mut self, aggregation: &Aggregation) {
        self.aggregations += 1;
        self.samples_folded += aggregation.folded;
        self.samples_skipped += aggregation.skipped;
        self.last_ewma = aggregation.ewma;
    }

    pub(crate) fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            id: self.host.id(),
            aggregations: self.aggregations,
            samples_folded: self.samples_folded,
            samples_skipped: self.samples_skipped,
            last_ewma: self.last_ewma,
        }
    }
}

/// Plain copy of the bookkeeping kept for one host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostStatsSnapshot {
    /// The host.
    pub id: HostId,
    /// Aggregation passes that covered this host.
    pub aggregations: u64,
    /// Samples folded for this host.
    pub samples_folded: u64,
    /// Samples of this host lost to ring overflow.
    pub samples_skipped: u64,
    /// Estimate published by the most recent aggregation, in milliseconds.
    pub last_ewma: f64,
}
