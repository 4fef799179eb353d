//! Priority-partitioned host sets with change notifications.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::domain::host::SharedHost;

/// The hosts of a single priority level.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    hosts: Vec<SharedHost>,
}

impl HostSet {
    /// Create a host set from a list of hosts.
    pub fn new(hosts: Vec<SharedHost>) -> Self {
        Self { hosts }
    }

    /// Every host in this level regardless of health.
    pub fn hosts(&self) -> &[SharedHost] {
        &self.hosts
    }

    /// Hosts currently reporting [`Healthy`](crate::domain::host::CoarseHealth::Healthy).
    pub fn healthy_hosts(&self) -> Vec<SharedHost> {
        self.hosts.iter().filter(|h| h.is_healthy()).cloned().collect()
    }

    /// Number of hosts in this level.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether this level has no hosts.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Callback invoked with `(priority, added, removed)` after a level changes.
pub type MemberUpdateCb = dyn Fn(u32, &[SharedHost], &[SharedHost]) + Send + Sync;

type CallbackList = Mutex<Vec<(u64, Arc<MemberUpdateCb>)>>;

/// A lock-free set of host levels, indexed by priority (0 is preferred).
///
/// Readers take snapshots through `ArcSwap` without locking; writers
/// replace a level and then notify subscribers.
pub struct PrioritySet {
    levels: ArcSwap<Vec<HostSet>>,
    callbacks: Arc<CallbackList>,
    next_callback_id: AtomicU64,
}

impl PrioritySet {
    /// Create a priority set with a single level holding `hosts`.
    pub fn new(hosts: Vec<SharedHost>) -> Self {
        Self {
            levels: ArcSwap::from_pointee(vec![HostSet::new(hosts)]),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            next_callback_id: AtomicU64::new(0),
        }
    }

    /// Snapshot of all levels.
    pub fn host_sets_per_priority(&self) -> Arc<Vec<HostSet>> {
        self.levels.load_full()
    }

    /// Every host across all levels.
    pub fn all_hosts(&self) -> Vec<SharedHost> {
        self.levels
            .load()
            .iter()
            .flat_map(|set| set.hosts().iter().cloned())
            .collect()
    }

    /// Replace the hosts of `priority` and notify subscribers with the
    /// supplied delta. Missing intermediate levels are created empty.
    pub fn update_hosts(
        &self,
        priority: u32,
        hosts: Vec<SharedHost>,
        added: &[SharedHost],
        removed: &[SharedHost],
    ) {
        let index = priority as usize;
        let hosts = HostSet::new(hosts);
        self.levels.rcu(|levels| {
            let mut levels = Vec::clone(levels);
            if levels.len() <= index {
                levels.resize_with(index + 1, HostSet::default);
            }
            levels[index] = hosts.clone();
            levels
        });
        self.run_callbacks(priority, added, removed);
    }

    /// Subscribe to membership changes. The subscription lasts until the
    /// returned handle is dropped.
    #[must_use = "dropping the handle unsubscribes immediately"]
    pub fn add_member_update_cb<F>(&self, cb: F) -> CallbackHandle
    where
        F: Fn(u32, &[SharedHost], &[SharedHost]) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let cb: Arc<MemberUpdateCb> = Arc::new(cb);
        self.callbacks.lock().push((id, cb));
        CallbackHandle {
            id,
            callbacks: Arc::downgrade(&self.callbacks),
        }
    }

    /// Invoke every subscriber with a membership delta.
    pub fn run_callbacks(&self, priority: u32, added: &[SharedHost], removed: &[SharedHost]) {
        let callbacks: Vec<Arc<MemberUpdateCb>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(priority, added, removed);
        }
    }

    fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }
}

impl fmt::Debug for PrioritySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrioritySet")
            .field("levels", &*self.levels.load_full())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

/// A shared reference to a priority set.
pub type SharedPrioritySet = Arc<PrioritySet>;

/// Subscription to a [`PrioritySet`]; unsubscribes on drop.
#[derive(Debug)]
pub struct CallbackHandle {
    id: u64,
    callbacks: Weak<CallbackList>,
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
