//! Rollout strategies — rolling update, blue-green, canary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_core::SlotId;
use fleet_core::config::RolloutConfig;

/// How to roll out a new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// Replace workers in batches. The only strategy implemented.
    #[default]
    Rolling,
    /// Full parallel pool, then switch over.
    BlueGreen,
    /// Small slice first, observe, then promote.
    Canary,
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RolloutStrategy::Rolling => "rolling",
            RolloutStrategy::BlueGreen => "blue-green",
            RolloutStrategy::Canary => "canary",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployOptions {
    pub strategy: RolloutStrategy,
    pub batches: u32,
    /// Pause after each replaced worker.
    pub settle_delay: Duration,
    /// Pause after each batch before the health gate.
    pub soak_period: Duration,
    pub rollback_on_failure: bool,
}

impl DeployOptions {
    pub fn from_config(cfg: &RolloutConfig) -> Self {
        Self {
            strategy: RolloutStrategy::Rolling,
            batches: cfg.batches,
            settle_delay: cfg.settle_delay(),
            soak_period: cfg.soak_period(),
            rollback_on_failure: cfg.rollback_on_failure,
        }
    }
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self::from_config(&RolloutConfig::default())
    }
}

/// Split `slots` into at most `batches` consecutive groups of
/// `ceil(len / batches)` workers. Fewer workers than batches gives
/// one worker per batch.
pub fn partition(slots: &[SlotId], batches: u32) -> Vec<Vec<SlotId>> {
    if slots.is_empty() {
        return Vec::new();
    }
    let size = slots.len().div_ceil(batches.max(1) as usize);
    slots.chunks(size).map(<[SlotId]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_workers_three_batches() {
        let slots: Vec<SlotId> = (0..9).collect();
        assert_eq!(
            partition(&slots, 3),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]
        );
    }

    #[test]
    fn uneven_and_small_pools() {
        let slots: Vec<SlotId> = (0..10).collect();
        let sizes: Vec<usize> = partition(&slots, 3).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        assert_eq!(partition(&[4, 7], 3), vec![vec![4], vec![7]]);
        assert!(partition(&[], 3).is_empty());
        assert_eq!(partition(&[1, 2], 0), vec![vec![1, 2]]);
    }

    #[test]
    fn options_follow_config() {
        let opts = DeployOptions::default();
        assert_eq!(opts.strategy, RolloutStrategy::Rolling);
        assert_eq!(opts.batches, 3);
        assert_eq!(opts.settle_delay, Duration::from_secs(2));
        assert_eq!(opts.soak_period, Duration::from_secs(30));
        assert!(opts.rollback_on_failure);
    }

    #[test]
    fn strategy_names() {
        let s: RolloutStrategy = serde_json::from_str(r#""blue-green""#).unwrap();
        assert_eq!(s, RolloutStrategy::BlueGreen);
        assert_eq!(RolloutStrategy::Canary.to_string(), "canary");
    }
}
