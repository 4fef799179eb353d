//! Peak EWMA load balancer configuration.
//!
//! Values arrive already parsed from the enclosing proxy configuration;
//! [`PeakEwmaConfig::validate`] is the only gate between them and the
//! runtime code, which assumes a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Largest accepted ring capacity per host.
pub const MAX_RING_CAPACITY: usize = 65_536;

/// Configuration for [`PeakEwmaLoadBalancer`](crate::load_balancer::PeakEwmaLoadBalancer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakEwmaConfig {
    /// Decay time constant (tau). Larger values make old samples lose
    /// influence more slowly.
    pub decay_time: Duration,
    /// Minimum spacing between two aggregation passes.
    pub aggregation_interval: Duration,
    /// Ring capacity: unfolded samples retained per host before the oldest
    /// are overwritten.
    pub max_samples_per_host: usize,
    /// Percentage of healthy hosts below which selection falls back to all
    /// hosts of a priority level.
    pub healthy_panic_threshold: f64,
    /// How the latency estimate and outstanding requests combine into a score.
    pub scoring: ScoringFormula,
}

impl Default for PeakEwmaConfig {
    fn default() -> Self {
        Self {
            decay_time: Duration::from_secs(10),
            aggregation_interval: Duration::from_millis(100),
            max_samples_per_host: 100,
            healthy_panic_threshold: 50.0,
            scoring: ScoringFormula::PeakEwma,
        }
    }
}

impl PeakEwmaConfig {
    /// Check every field, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.decay_time.is_zero() {
            return Err(ConfigError::ZeroDecayTime);
        }
        if self.max_samples_per_host == 0 {
            return Err(ConfigError::ZeroRingCapacity);
        }
        if self.max_samples_per_host > MAX_RING_CAPACITY {
            return Err(ConfigError::RingCapacityTooLarge {
                requested: self.max_samples_per_host,
                max: MAX_RING_CAPACITY,
            });
        }
        if !(0.0..=100.0).contains(&self.healthy_panic_threshold) {
            return Err(ConfigError::InvalidPanicThreshold(
                self.healthy_panic_threshold,
            ));
        }
        if let ScoringFormula::LoadPenalty { penalty } = self.scoring {
            if !penalty.is_finite() || penalty < 0.0 {
                return Err(ConfigError::InvalidLoadPenalty(penalty));
            }
        }
        Ok(())
    }
}

/// Blending of a host's decayed latency and its outstanding requests.
///
/// Lower scores are better. A host without data (estimate `0.0`) always
/// scores `0.0` so that cold hosts receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringFormula {
    /// `ewma * (1 + outstanding)`, the classic Peak EWMA cost.
    PeakEwma,
    /// `ewma * (1 + outstanding * penalty)`.
    LoadPenalty {
        /// Weight of each outstanding request.
        penalty: f64,
    },
}

impl ScoringFormula {
    /// Score a host with latency estimate `ewma_ms` and `outstanding`
    /// in-flight requests.
    pub fn score(&self, ewma_ms: f64, outstanding: u64) -> f64 {
        if !ewma_ms.is_finite() {
            return f64::INFINITY;
        }
        let ewma = ewma_ms.max(0.0);
        let active = outstanding as f64;
        let score = match *self {
            ScoringFormula::PeakEwma => ewma * (1.0 + active),
            ScoringFormula::LoadPenalty { penalty } => ewma * (1.0 + active * penalty),
        };
        if score.is_nan() {
            f64::INFINITY
        } else {
            score
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PeakEwmaConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_decay_time() {
        let config = PeakEwmaConfig {
            decay_time: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDecayTime));
    }

    #[test]
    fn rejects_bad_ring_capacity() {
        let zero = PeakEwmaConfig {
            max_samples_per_host: 0,
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroRingCapacity));

        let huge = PeakEwmaConfig {
            max_samples_per_host: MAX_RING_CAPACITY + 1,
            ..Default::default()
        };
        assert!(matches!(
            huge.validate(),
            Err(ConfigError::RingCapacityTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_panic_threshold() {
        for threshold in [-1.0, 100.5, f64::NAN] {
            let config = PeakEwmaConfig {
                healthy_panic_threshold: threshold,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidPanicThreshold(_))
            ));
        }
    }

    #[test]
    fn rejects_negative_penalty() {
        let config = PeakEwmaConfig {
            scoring: ScoringFormula::LoadPenalty { penalty: -0.5 },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidLoadPenalty(-0.5)));
    }

    #[test]
    fn cold_host_scores_zero_regardless_of_load() {
        assert_eq!(ScoringFormula::PeakEwma.score(0.0, 0), 0.0);
        assert_eq!(ScoringFormula::PeakEwma.score(0.0, 42), 0.0);
        let penalty = ScoringFormula::LoadPenalty { penalty: 1.5 };
        assert_eq!(penalty.score(0.0, 7), 0.0);
    }

    #[test]
    fn outstanding_requests_raise_score() {
        let formula = ScoringFormula::PeakEwma;
        assert_eq!(formula.score(10.0, 0), 10.0);
        assert_eq!(formula.score(10.0, 3), 40.0);

        let penalty = ScoringFormula::LoadPenalty { penalty: 0.5 };
        assert_eq!(penalty.score(10.0, 2), 20.0);
    }

    #[test]
    fn nonsense_estimates_are_ordered_sanely() {
        let formula = ScoringFormula::PeakEwma;
        assert_eq!(formula.score(-5.0, 1), 0.0);
        assert_eq!(formula.score(f64::NAN, 0), f64::INFINITY);
        assert_eq!(formula.score(f64::INFINITY, 0), f64::INFINITY);
    }

    #[test]
    fn deserializes_partial_config() {
        let json = r#"{
            "max_samples_per_host": 10,
            "scoring": { "type": "load_penalty", "penalty": 1.5 }
        }"#;
        let config: PeakEwmaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_samples_per_host, 10);
        assert_eq!(config.scoring, ScoringFormula::LoadPenalty { penalty: 1.5 });
        assert_eq!(config.decay_time, Duration::from_secs(10));
        assert_eq!(config.aggregation_interval, Duration::from_millis(100));
    }
}
