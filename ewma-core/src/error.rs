//! Error types for the Peak EWMA engine.
//!
//! Only construction can fail. Once a load balancer exists, every runtime
//! path degrades to a less accurate selection instead of returning an error.

use thiserror::Error;

/// Rejected configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The decay time constant must be strictly positive.
    #[error("decay_time must be greater than zero")]
    ZeroDecayTime,

    /// Every host needs at least one ring slot.
    #[error("max_samples_per_host must be greater than zero")]
    ZeroRingCapacity,

    /// The ring capacity exceeds the supported maximum.
    #[error("max_samples_per_host {requested} exceeds the maximum of {max}")]
    RingCapacityTooLarge {
        /// The configured capacity.
        requested: usize,
        /// The largest accepted capacity.
        max: usize,
    },

    /// The panic threshold is a percentage in `0.0..=100.0`.
    #[error("healthy_panic_threshold must be within 0..=100, got {0}")]
    InvalidPanicThreshold(f64),

    /// The load penalty of [`ScoringFormula::LoadPenalty`](crate::config::ScoringFormula::LoadPenalty)
    /// must be finite and non-negative.
    #[error("load penalty must be finite and non-negative, got {0}")]
    InvalidLoadPenalty(f64),
}

/// Result alias used by fallible constructors in this crate.
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
