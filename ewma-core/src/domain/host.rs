//! Upstream host models.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A unique identifier for an upstream host.
///
/// Ids must be unique within a priority set; load balancers key their
/// per-host bookkeeping by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Coarse health as reported by the host-pool health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoarseHealth {
    /// Eligible for regular selection.
    Healthy = 0,
    /// Reachable but not preferred; only selected in panic mode.
    Degraded = 1,
    /// Failing health checks; only selected in panic mode.
    Unhealthy = 2,
}

impl CoarseHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoarseHealth::Healthy,
            1 => CoarseHealth::Degraded,
            _ => CoarseHealth::Unhealthy,
        }
    }
}

/// Load-balancer-private data attached to a host.
///
/// The host owns whatever is attached; a load balancer only ever holds a
/// clone of the `Arc` for the duration of a call.
pub trait HostPolicyData: Any + Send + Sync + fmt::Debug {
    /// Upcast used for typed access through [`Host::policy_data_as`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Represents a single upstream host.
pub struct Host {
    id: HostId,
    addr: SocketAddr,
    health: AtomicU8,
    outstanding_requests: AtomicU64,
    policy_data: RwLock<Option<Arc<dyn HostPolicyData>>>,
}

impl Host {
    /// Create a host that starts out healthy and without policy data.
    pub fn new(id: HostId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            health: AtomicU8::new(CoarseHealth::Healthy as u8),
            outstanding_requests: AtomicU64::new(0),
            policy_data: RwLock::new(None),
        }
    }

    /// The host's identifier.
    pub fn id(&self) -> HostId {
        self.id
    }

    /// The socket address of the host.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Current coarse health.
    pub fn coarse_health(&self) -> CoarseHealth {
        CoarseHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Shorthand for `coarse_health() == Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.coarse_health() == CoarseHealth::Healthy
    }

    /// Update the coarse health of the host.
    pub fn set_health(&self, health: CoarseHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    /// Number of requests currently in flight to this host.
    pub fn outstanding_requests(&self) -> u64 {
        self.outstanding_requests.load(Ordering::Relaxed)
    }

    /// Increment the outstanding request counter and return a guard that
    /// decrements it when dropped.
    pub fn start_request(&self) -> OutstandingRequestGuard<'_> {
        self.outstanding_requests.fetch_add(1, Ordering::Relaxed);
        OutstandingRequestGuard { host: self }
    }

    /// The attached policy data, if any.
    pub fn policy_data(&self) -> Option<Arc<dyn HostPolicyData>> {
        self.policy_data.read().clone()
    }

    /// Replace the attached policy data.
    pub fn set_policy_data(&self, data: Option<Arc<dyn HostPolicyData>>) {
        *self.policy_data.write() = data;
    }

    /// Return the attached policy data, attaching `init()` first if the slot
    /// is empty. Existing data is never replaced.
    pub fn policy_data_or_insert_with<F>(&self, init: F) -> Arc<dyn HostPolicyData>
    where
        F: FnOnce() -> Arc<dyn HostPolicyData>,
    {
        if let Some(existing) = self.policy_data.read().as_ref() {
            return Arc::clone(existing);
        }
        let mut slot = self.policy_data.write();
        Arc::clone(slot.get_or_insert_with(init))
    }

    /// The attached policy data downcast to `T`. `None` if the slot is empty
    /// or holds another type.
    pub fn policy_data_as<T: HostPolicyData>(&self) -> Option<Arc<T>> {
        self.policy_data()?.into_any().downcast::<T>().ok()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("health", &self.coarse_health())
            .field("outstanding_requests", &self.outstanding_requests())
            .field("has_policy_data", &self.policy_data.read().is_some())
            .finish()
    }
}

/// A thread-safe reference to a Host.
pub type SharedHost = Arc<Host>;

/// A RAII guard that decrements the host's outstanding request counter
/// when the request finishes and drops the guard.
#[derive(Debug)]
pub struct OutstandingRequestGuard<'a> {
    host: &'a Host,
}

impl Drop for OutstandingRequestGuard<'_> {
    fn drop(&mut self) {
        self.host.outstanding_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Marker(u32);

    impl HostPolicyData for Marker {
        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[derive(Debug)]
    struct Other;

    impl HostPolicyData for Other {
        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn host() -> Host {
        Host::new(HostId(1), "10.0.0.1:8080".parse().unwrap())
    }

    #[test]
    fn starts_healthy_without_policy_data() {
        let host = host();
        assert!(host.is_healthy());
        assert!(host.policy_data().is_none());
        assert_eq!(host.outstanding_requests(), 0);
    }

    #[test]
    fn health_transitions() {
        let host = host();
        host.set_health(CoarseHealth::Degraded);
        assert_eq!(host.coarse_health(), CoarseHealth::Degraded);
        assert!(!host.is_healthy());
        host.set_health(CoarseHealth::Unhealthy);
        assert_eq!(host.coarse_health(), CoarseHealth::Unhealthy);
    }

    #[test]
    fn guard_tracks_outstanding_requests() {
        let host = host();
        let first = host.start_request();
        let second = host.start_request();
        assert_eq!(host.outstanding_requests(), 2);
        drop(first);
        assert_eq!(host.outstanding_requests(), 1);
        drop(second);
        assert_eq!(host.outstanding_requests(), 0);
    }

    #[test]
    fn insert_with_keeps_existing_data() {
        let host = host();
        host.policy_data_or_insert_with(|| Arc::new(Marker(1)));
        host.policy_data_or_insert_with(|| Arc::new(Marker(2)));
        assert_eq!(host.policy_data_as::<Marker>().unwrap().0, 1);
    }

    #[test]
    fn typed_access_rejects_other_types() {
        let host = host();
        host.set_policy_data(Some(Arc::new(Other)));
        assert!(host.policy_data_as::<Marker>().is_none());
        assert!(host.policy_data_as::<Other>().is_some());

        host.set_policy_data(None);
        assert!(host.policy_data().is_none());
    }
}
