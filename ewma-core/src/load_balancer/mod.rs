//! Peak EWMA load balancing.
//!
//! Request completions append round-trip samples to a ring attached to
//! each host. Selection calls fold those samples into a decayed estimate
//! at most once per aggregation interval and pick the host with the
//! lowest cost. There is no background timer: aggregation only happens
//! inline on the selection path.

pub mod ewma;
pub mod host_data;
pub mod ring;
pub mod selector;
pub mod stats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::clock::{duration_to_nanos, TimeSource};
use crate::config::PeakEwmaConfig;
use crate::domain::host::{Host, HostId, SharedHost};
use crate::domain::host_set::{CallbackHandle, SharedPrioritySet};
use crate::error::Result;

pub use ewma::Aggregation;
pub use host_data::PeakEwmaHostData;
pub use stats::{HostStatsSnapshot, LbStats, LbStatsSnapshot};

use stats::HostStats;

const NEVER: u64 = u64::MAX;

/// Per-request information offered to the load balancer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Downstream client address, if known.
    pub client_addr: Option<SocketAddr>,
}

type HostStatsTable = DashMap<HostId, HostStats>;

/// Peak EWMA load balancer for one worker.
///
/// Hosts are tracked by [`HostId`], which must be unique within the
/// priority set.
///
/// Several instances may share the same hosts. Latency state lives on the
/// hosts themselves, so it is shared between instances and outlives any of
/// them. Dropping an instance only unsubscribes it from membership updates
/// and releases its own bookkeeping; host data is never touched.
pub struct PeakEwmaLoadBalancer {
    priority_set: SharedPrioritySet,
    config: PeakEwmaConfig,
    time_source: Arc<dyn TimeSource>,
    decay_ns: f64,
    aggregation_interval_ns: u64,
    last_aggregation_ns: AtomicU64,
    host_stats: Arc<HostStatsTable>,
    stats: Arc<LbStats>,
    rng: Mutex<StdRng>,
    _member_update: CallbackHandle,
}

impl PeakEwmaLoadBalancer {
    /// Create a load balancer over `priority_set`.
    ///
    /// Every host already in the set gets latency state attached, and hosts
    /// added later are attached through a membership subscription.
    pub fn new(
        priority_set: SharedPrioritySet,
        config: PeakEwmaConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;

        let capacity = config.max_samples_per_host;
        let host_stats: Arc<HostStatsTable> = Arc::new(DashMap::new());
        let stats = Arc::new(LbStats::default());

        for host in priority_set.all_hosts() {
            attach_host_data(&host, capacity);
        }

        let member_update = {
            let host_stats = Arc::clone(&host_stats);
            let stats = Arc::clone(&stats);
            priority_set.add_member_update_cb(move |priority, added, removed| {
                on_member_update(&host_stats, &stats, capacity, priority, added, removed);
            })
        };

        debug!(
            algorithm = "peak_ewma",
            decay_time_ms = config.decay_time.as_millis() as u64,
            aggregation_interval_ms = config.aggregation_interval.as_millis() as u64,
            max_samples_per_host = capacity,
            "Created load balancer"
        );

        Ok(Self {
            decay_ns: config.decay_time.as_nanos() as f64,
            aggregation_interval_ns: duration_to_nanos(config.aggregation_interval),
            priority_set,
            config,
            time_source,
            last_aggregation_ns: AtomicU64::new(NEVER),
            host_stats,
            stats,
            rng: Mutex::new(StdRng::from_os_rng()),
            _member_update: member_update,
        })
    }

    /// Replace the tie-breaking RNG with a seeded one.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Choose a host for the next request, or `None` if no host is eligible.
    pub fn choose_host(&self, context: Option<&RequestContext>) -> Option<SharedHost> {
        self.stats.record_choose_host();
        let now = self.time_source.now_nanos();
        self.maybe_aggregate(now);

        let levels = self.priority_set.host_sets_per_priority();
        let candidates = selector::candidate_hosts(&levels, self.config.healthy_panic_threshold);
        if candidates.panic {
            self.stats.record_panic();
        }

        if candidates.hosts.is_empty() {
            self.stats.record_no_host();
            let total_hosts: usize = levels.iter().map(|level| level.len()).sum();
            if total_hosts > 0 {
                warn!(
                    total_hosts,
                    algorithm = "peak_ewma",
                    "No healthy upstream hosts available"
                );
            }
            return None;
        }

        for host in &candidates.hosts {
            attach_host_data(host, self.config.max_samples_per_host);
        }

        let chosen = {
            let mut rng = self.rng.lock();
            selector::select_best_host(&candidates.hosts, self.config.scoring, &mut *rng)
        }?;

        trace!(
            selected_host = %chosen.address(),
            client = ?context.and_then(|c| c.client_addr),
            priority = candidates.priority,
            panic = candidates.panic,
            candidates = candidates.hosts.len(),
            score = selector::host_score(&chosen, self.config.scoring),
            algorithm = "peak_ewma",
            "Selected host via Peak EWMA"
        );
        Some(chosen)
    }

    /// Fold pending samples of every host if at least one aggregation
    /// interval has passed since the previous pass. Returns whether a pass
    /// ran. The first call always runs.
    pub fn maybe_aggregate(&self, now: u64) -> bool {
        let last = self.last_aggregation_ns.load(Ordering::Acquire);
        if last != NEVER && now.saturating_sub(last) < self.aggregation_interval_ns {
            return false;
        }
        if self
            .last_aggregation_ns
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.stats.record_aggregation_pass();
        let hosts = self.priority_set.all_hosts();
        for host in &hosts {
            self.aggregate_host(host);
        }
        debug!(
            hosts = hosts.len(),
            tracked_hosts = self.host_stats.len(),
            algorithm = "peak_ewma",
            "Aggregated host latency samples"
        );
        true
    }

    fn aggregate_host(&self, host: &SharedHost) {
        let Some(data) = attach_host_data(host, self.config.max_samples_per_host) else {
            return;
        };
        let Some(aggregation) = data.aggregate(self.decay_ns) else {
            trace!(
                host = %host.address(),
                algorithm = "peak_ewma",
                "Host aggregated elsewhere, skipping"
            );
            return;
        };

        self.stats.record_aggregation(&aggregation);
        if aggregation.skipped > 0 {
            debug!(
                host = %host.address(),
                skipped = aggregation.skipped,
                capacity = data.capacity(),
                algorithm = "peak_ewma",
                "Sample ring overflowed between aggregations"
            );
        }

        let created = match self.host_stats.entry(host.id()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().record(&aggregation);
                false
            }
            Entry::Vacant(entry) => {
                let mut stats = HostStats::new(Arc::clone(host));
                stats.record(&aggregation);
                entry.insert(stats);
                true
            }
        };

        // A removal may have raced with this pass; never keep an entry for
        // a host that has already left the pool.
        if created && !self.is_member(host.id()) {
            self.host_stats.remove(&host.id());
        }
    }

    /// Membership is decided by [`HostId`], the same key the bookkeeping
    /// table uses.
    fn is_member(&self, id: HostId) -> bool {
        self.priority_set
            .host_sets_per_priority()
            .iter()
            .any(|level| level.hosts().iter().any(|h| h.id() == id))
    }

    /// Record a round-trip time for a request served by `host`.
    ///
    /// Attaches latency state first if the host has none.
    pub fn record_latency_sample(&self, host: &Host, rtt_ms: f64, timestamp_ns: u64) {
        if let Some(data) = attach_host_data(host, self.config.max_samples_per_host) {
            data.record_rtt_sample(rtt_ms, timestamp_ns);
        }
    }

    /// Record a round-trip time observed now.
    pub fn record_latency(&self, host: &Host, rtt: Duration) {
        let now = self.time_source.now_nanos();
        self.record_latency_sample(host, rtt.as_secs_f64() * 1_000.0, now);
    }

    /// Bookkeeping for a host this load balancer has aggregated.
    pub fn host_stats(&self, id: HostId) -> Option<HostStatsSnapshot> {
        self.host_stats.get(&id).map(|entry| entry.snapshot())
    }

    /// Number of hosts with load-balancer-side bookkeeping.
    pub fn tracked_hosts(&self) -> usize {
        self.host_stats.len()
    }

    /// Counters of this instance.
    pub fn stats(&self) -> LbStatsSnapshot {
        self.stats.snapshot()
    }

    /// The configuration in use.
    pub fn config(&self) -> &PeakEwmaConfig {
        &self.config
    }

    /// The host set this load balancer selects from.
    pub fn priority_set(&self) -> &SharedPrioritySet {
        &self.priority_set
    }
}

impl std::fmt::Debug for PeakEwmaLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakEwmaLoadBalancer")
            .field("config", &self.config)
            .field("tracked_hosts", &self.host_stats.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Return the host's Peak EWMA state, attaching fresh state if the slot is
/// empty. `None` if the slot holds another policy's data.
fn attach_host_data(host: &Host, capacity: usize) -> Option<Arc<PeakEwmaHostData>> {
    host.policy_data_or_insert_with(|| {
        debug!(
            host = %host.address(),
            capacity,
            algorithm = "peak_ewma",
            "Attached latency state to host"
        );
        Arc::new(PeakEwmaHostData::new(capacity))
    })
    .into_any()
    .downcast::<PeakEwmaHostData>()
    .ok()
}

fn on_member_update(
    host_stats: &HostStatsTable,
    stats: &LbStats,
    capacity: usize,
    priority: u32,
    added: &[SharedHost],
    removed: &[SharedHost],
) {
    for host in added {
        attach_host_data(host, capacity);
    }
    for host in removed {
        host_stats.remove(&host.id());
    }
    stats.record_membership(added.len(), removed.len());
    debug!(
        priority,
        added = added.len(),
        removed = removed.len(),
        tracked_hosts = host_stats.len(),
        algorithm = "peak_ewma",
        "Applied host membership update"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::host::CoarseHealth;
    use crate::domain::host_set::PrioritySet;
    use crate::error::ConfigError;

    const MILLI: u64 = 1_000_000;

    fn make_hosts(count: u64) -> Vec<SharedHost> {
        (0..count)
            .map(|i| {
                let addr = format!("10.0.0.{}:{}", i + 1, 8080 + i).parse().unwrap();
                Arc::new(Host::new(HostId(i), addr))
            })
            .collect()
    }

    fn setup(count: u64) -> (Vec<SharedHost>, SharedPrioritySet, Arc<ManualClock>) {
        let hosts = make_hosts(count);
        let set = Arc::new(PrioritySet::new(hosts.clone()));
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1000)));
        (hosts, set, clock)
    }

    fn balancer(set: &SharedPrioritySet, clock: &Arc<ManualClock>) -> PeakEwmaLoadBalancer {
        PeakEwmaLoadBalancer::new(Arc::clone(set), PeakEwmaConfig::default(), clock.clone())
            .unwrap()
            .with_rng_seed(3)
    }

    #[test]
    fn rejects_invalid_config() {
        let (_, set, clock) = setup(1);
        let config = PeakEwmaConfig {
            max_samples_per_host: 0,
            ..Default::default()
        };
        let err = PeakEwmaLoadBalancer::new(set, config, clock).unwrap_err();
        assert_eq!(err, ConfigError::ZeroRingCapacity);
    }

    #[test]
    fn attaches_state_on_construction() {
        let (hosts, set, clock) = setup(3);
        let _lb = balancer(&set, &clock);
        for host in &hosts {
            let data = host.policy_data_as::<PeakEwmaHostData>().unwrap();
            assert_eq!(data.capacity(), 100);
        }
    }

    #[test]
    fn aggregation_is_interval_gated() {
        let (hosts, set, clock) = setup(1);
        let lb = balancer(&set, &clock);

        assert!(lb.maybe_aggregate(clock.now_nanos()));
        lb.record_latency_sample(&hosts[0], 7.0, clock.now_nanos());
        clock.advance(Duration::from_millis(50));
        assert!(!lb.maybe_aggregate(clock.now_nanos()));
        assert_eq!(lb.host_stats(HostId(0)).unwrap().samples_folded, 0);

        clock.advance(Duration::from_millis(50));
        assert!(lb.maybe_aggregate(clock.now_nanos()));
        assert_eq!(lb.host_stats(HostId(0)).unwrap().samples_folded, 1);
        assert_eq!(lb.stats().aggregation_passes, 2);
    }

    #[test]
    fn clock_behind_last_pass_does_not_aggregate() {
        let (_, set, clock) = setup(1);
        let lb = balancer(&set, &clock);
        assert!(lb.maybe_aggregate(clock.now_nanos()));
        assert!(!lb.maybe_aggregate(clock.now_nanos() - 500 * MILLI));
    }

    #[test]
    fn prefers_faster_host() {
        let (hosts, set, clock) = setup(2);
        let lb = balancer(&set, &clock);
        let now = clock.now_nanos();
        lb.record_latency_sample(&hosts[0], 80.0, now);
        lb.record_latency_sample(&hosts[1], 5.0, now);

        let chosen = lb.choose_host(None).unwrap();
        assert_eq!(chosen.id(), HostId(1));
    }

    #[test]
    fn cold_host_is_chosen_over_measured_hosts() {
        let (hosts, set, clock) = setup(3);
        let lb = balancer(&set, &clock);
        let now = clock.now_nanos();
        lb.record_latency_sample(&hosts[0], 1.0, now);
        lb.record_latency_sample(&hosts[1], 1.0, now);

        let chosen = lb.choose_host(None).unwrap();
        assert_eq!(chosen.id(), HostId(2));
    }

    #[test]
    fn empty_pool_yields_none() {
        let set = Arc::new(PrioritySet::new(Vec::new()));
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1)));
        let lb = balancer(&set, &clock);

        assert!(lb.choose_host(None).is_none());
        assert_eq!(lb.stats().no_host_selected, 1);
    }

    #[test]
    fn panic_mode_selects_unhealthy_hosts() {
        let (hosts, set, clock) = setup(2);
        for host in &hosts {
            host.set_health(CoarseHealth::Unhealthy);
        }
        let lb = balancer(&set, &clock);

        assert!(lb.choose_host(None).is_some());
        assert_eq!(lb.stats().lb_healthy_panic, 1);
    }

    #[test]
    fn lazily_attaches_state_for_stale_hosts() {
        let (hosts, set, clock) = setup(1);
        let lb = balancer(&set, &clock);
        hosts[0].set_policy_data(None);

        let chosen = lb.choose_host(None).unwrap();
        assert!(chosen.policy_data_as::<PeakEwmaHostData>().is_some());
    }

    #[test]
    fn removal_erases_bookkeeping() {
        let (hosts, set, clock) = setup(2);
        let lb = balancer(&set, &clock);
        lb.choose_host(None);
        assert_eq!(lb.tracked_hosts(), 2);

        set.update_hosts(0, vec![hosts[1].clone()], &[], &[hosts[0].clone()]);
        assert_eq!(lb.tracked_hosts(), 1);
        assert!(lb.host_stats(HostId(0)).is_none());
        assert_eq!(lb.stats().hosts_removed, 1);
    }

    #[test]
    fn aggregating_a_removed_host_keeps_no_entry() {
        let (hosts, set, clock) = setup(2);
        let lb = balancer(&set, &clock);
        let removed = Arc::clone(&hosts[0]);
        set.update_hosts(0, vec![hosts[1].clone()], &[], &[removed.clone()]);

        // A pass that loaded the host list before the removal reaches the
        // removed host after its entry was already erased.
        lb.record_latency_sample(&removed, 8.0, clock.now_nanos());
        lb.aggregate_host(&removed);

        assert!(lb.host_stats(HostId(0)).is_none());
        assert_eq!(lb.tracked_hosts(), 0);
        drop(hosts);
        assert_eq!(Arc::strong_count(&removed), 1);
    }

    #[test]
    fn aggregating_a_member_keeps_its_entry() {
        let (hosts, set, clock) = setup(1);
        let lb = balancer(&set, &clock);
        lb.record_latency_sample(&hosts[0], 8.0, clock.now_nanos());
        lb.aggregate_host(&hosts[0]);

        let entry = lb.host_stats(HostId(0)).unwrap();
        assert_eq!(entry.samples_folded, 1);
        assert_eq!(entry.last_ewma, 8.0);
    }

    #[test]
    fn attach_reuses_existing_state() {
        let (hosts, _set, _clock) = setup(1);
        let first = attach_host_data(&hosts[0], 8).unwrap();
        first.record_rtt_sample(3.0, 1);

        let second = attach_host_data(&hosts[0], 16).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 8);
        assert_eq!(second.write_cursor(), 1);
    }

    #[derive(Debug)]
    struct ForeignPolicy;

    impl crate::domain::host::HostPolicyData for ForeignPolicy {
        fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn foreign_policy_data_is_left_alone() {
        let (hosts, set, clock) = setup(1);
        hosts[0].set_policy_data(Some(Arc::new(ForeignPolicy)));
        let lb = balancer(&set, &clock);

        assert!(attach_host_data(&hosts[0], 8).is_none());
        lb.record_latency_sample(&hosts[0], 5.0, clock.now_nanos());
        assert!(hosts[0].policy_data_as::<ForeignPolicy>().is_some());
        assert_eq!(lb.choose_host(None).unwrap().id(), HostId(0));
    }

    #[test]
    fn record_latency_uses_clock() {
        let (hosts, set, clock) = setup(1);
        let lb = balancer(&set, &clock);
        lb.record_latency(&hosts[0], Duration::from_millis(12));
        lb.maybe_aggregate(clock.now_nanos());

        let data = hosts[0].policy_data_as::<PeakEwmaHostData>().unwrap();
        assert!((data.ewma_rtt() - 12.0).abs() < 1e-9);
        assert_eq!(data.last_update_time(), clock.now_nanos());
    }
}
