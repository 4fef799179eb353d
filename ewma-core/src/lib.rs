//! Peak EWMA latency tracking and host selection.
//!
//! This crate contains the per-host latency state, the time-correct decay
//! aggregation and the host selection policy that let a request-routing
//! data plane send each request to the backend expected to answer fastest.

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod load_balancer;

pub use clock::{ManualClock, MonotonicClock, TimeSource};
pub use config::{PeakEwmaConfig, ScoringFormula};
pub use domain::host::{CoarseHealth, Host, HostId, HostPolicyData, SharedHost};
pub use domain::host_set::{HostSet, PrioritySet, SharedPrioritySet};
pub use error::{ConfigError, Result};
pub use load_balancer::{PeakEwmaHostData, PeakEwmaLoadBalancer, RequestContext};
