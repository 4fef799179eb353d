//! Host scoring and selection logic.

use rand::Rng;
use tracing::trace;

use crate::config::ScoringFormula;
use crate::domain::host::SharedHost;
use crate::domain::host_set::HostSet;
use crate::load_balancer::host_data::PeakEwmaHostData;

/// The hosts a selection may choose from.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    /// Eligible hosts.
    pub hosts: Vec<SharedHost>,
    /// Priority level the hosts were taken from.
    pub priority: u32,
    /// Whether too few hosts were healthy and all hosts of the level are
    /// eligible regardless of health.
    pub panic: bool,
}

/// Pick the host subset to select from.
///
/// Levels are visited in priority order and the first non-empty one
/// decides: below `panic_threshold` percent healthy it is used in full,
/// otherwise its healthy hosts are used. A level with hosts but none
/// healthy (only possible with a zero threshold) defers to the next level.
pub fn candidate_hosts(levels: &[HostSet], panic_threshold: f64) -> Candidates {
    for (priority, level) in levels.iter().enumerate() {
        if level.is_empty() {
            continue;
        }
        let healthy = level.healthy_hosts();
        let healthy_percent = healthy.len() as f64 * 100.0 / level.len() as f64;
        if healthy_percent < panic_threshold {
            return Candidates {
                hosts: level.hosts().to_vec(),
                priority: priority as u32,
                panic: true,
            };
        }
        if !healthy.is_empty() {
            return Candidates {
                hosts: healthy,
                priority: priority as u32,
                panic: false,
            };
        }
    }
    Candidates::default()
}

/// Score one host. Hosts without Peak EWMA state score as cold.
pub fn host_score(host: &SharedHost, scoring: ScoringFormula) -> f64 {
    let ewma = host
        .policy_data_as::<PeakEwmaHostData>()
        .map(|data| data.ewma_rtt())
        .unwrap_or(0.0);
    scoring.score(ewma, host.outstanding_requests())
}

/// Selects the host with the lowest score. Equal scores are broken
/// uniformly at random.
pub fn select_best_host<R>(
    hosts: &[SharedHost],
    scoring: ScoringFormula,
    rng: &mut R,
) -> Option<SharedHost>
where
    R: Rng,
{
    let mut best: Option<&SharedHost> = None;
    let mut best_score = f64::INFINITY;
    let mut ties = 0u32;

    for host in hosts {
        let score = host_score(host, scoring);
        trace!(
            host = %host.address(),
            score,
            outstanding = host.outstanding_requests(),
            algorithm = "peak_ewma",
            "Evaluating host score"
        );
        if best.is_none() || score < best_score {
            best = Some(host);
            best_score = score;
            ties = 1;
        } else if score == best_score {
            // Reservoir sampling keeps each tied host equally likely.
            ties += 1;
            if rng.random_range(0..ties) == 0 {
                best = Some(host);
            }
        }
    }

    best.cloned()
}
