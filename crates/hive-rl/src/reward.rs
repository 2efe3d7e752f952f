//! Reward computation from before/after metric snapshots

use hive_core::{HiveError, MetricMap, Result};

/// Weighted metrics contributing to the reward signal
pub const METRIC_WEIGHTS: [(&str, f64); 6] = [
    ("views", 0.25),
    ("likes", 0.15),
    ("comments", 0.15),
    ("shares", 0.10),
    ("watch_time", 0.20),
    ("ctr", 0.15),
];

/// Maps metric improvements to a scalar reward in [-1, 1].
///
/// Pure computation: malformed input (non-finite values, negative elapsed
/// time) is a validation error, never silently coerced.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardCalculator;

impl RewardCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Metric weights as (name, weight) pairs
    pub fn weights(&self) -> &'static [(&'static str, f64)] {
        &METRIC_WEIGHTS
    }

    /// Calculate the reward for the observed metric change.
    ///
    /// For each weighted metric with a positive baseline, the relative
    /// improvement is compressed through `tanh(improvement * 5)`, weighted,
    /// and scaled by a linear time-decay factor floored at 0.1 (the same
    /// improvement observed a week later counts less). A zero baseline with
    /// a positive after-value earns a small flat credit of `weight * 0.1`.
    /// The sum is clamped to [-1, 1].
    pub fn calculate_reward(
        &self,
        metrics_before: &MetricMap,
        metrics_after: &MetricMap,
        time_elapsed_hours: f64,
    ) -> Result<f64> {
        validate_metrics(metrics_before)?;
        validate_metrics(metrics_after)?;
        if !time_elapsed_hours.is_finite() || time_elapsed_hours < 0.0 {
            return Err(HiveError::Validation(format!(
                "time_elapsed_hours must be finite and non-negative, got {time_elapsed_hours}"
            )));
        }

        let time_factor = (1.0 - (time_elapsed_hours - 24.0) / 168.0).max(0.1);

        let mut total_reward = 0.0;
        for (metric, weight) in METRIC_WEIGHTS {
            let before = metrics_before.get(metric).copied().unwrap_or(0.0);
            let after = metrics_after.get(metric).copied().unwrap_or(0.0);

            if before > 0.0 {
                let improvement = (after - before) / before;
                total_reward += (improvement * 5.0).tanh() * weight * time_factor;
            } else if after > 0.0 {
                // No baseline: small flat credit instead of a ratio
                total_reward += weight * 0.1;
            }
        }

        Ok(total_reward.clamp(-1.0, 1.0))
    }

    /// Flat bonus for high engagement, added on top of the main reward
    pub fn calculate_engagement_bonus(&self, metrics: &MetricMap) -> f64 {
        let engagement_rate = metrics.get("engagement_rate").copied().unwrap_or(0.0);

        if engagement_rate > 0.05 {
            0.2
        } else if engagement_rate > 0.02 {
            0.1
        } else if engagement_rate > 0.01 {
            0.05
        } else {
            0.0
        }
    }
}

fn validate_metrics(metrics: &MetricMap) -> Result<()> {
    for (name, value) in metrics {
        if !value.is_finite() {
            return Err(HiveError::Validation(format!(
                "metric '{name}' has non-finite value {value}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> MetricMap {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_reward_clamped_to_unit_range() {
        let calc = RewardCalculator::new();
        let before = metrics(&[
            ("views", 100.0),
            ("likes", 10.0),
            ("comments", 5.0),
            ("shares", 2.0),
            ("watch_time", 500.0),
            ("ctr", 0.01),
        ]);
        let after = metrics(&[
            ("views", 100_000.0),
            ("likes", 10_000.0),
            ("comments", 5_000.0),
            ("shares", 2_000.0),
            ("watch_time", 500_000.0),
            ("ctr", 0.9),
        ]);

        let reward = calc.calculate_reward(&before, &after, 24.0).unwrap();
        assert!(reward <= 1.0);
        assert!(reward >= -1.0);

        // Complete collapse should clamp on the negative side too
        let crash = calc.calculate_reward(&after, &before, 24.0).unwrap();
        assert!(crash >= -1.0);
        assert!(crash < 0.0);
    }

    #[test]
    fn test_views_only_improvement_bounded_by_views_weight() {
        // 30% views improvement at 24h elapsed; likes unchanged contribute ~0
        let calc = RewardCalculator::new();
        let before = metrics(&[("views", 1000.0), ("likes", 50.0)]);
        let after = metrics(&[("views", 1300.0), ("likes", 50.0)]);

        let reward = calc.calculate_reward(&before, &after, 24.0).unwrap();
        assert!(reward > 0.0, "views improvement should yield positive reward");
        assert!(
            reward <= 0.25 * (0.3f64 * 5.0).tanh() + 1e-12,
            "reward should not exceed the views-weight upper bound"
        );
    }

    #[test]
    fn test_zero_baseline_gets_flat_credit() {
        let calc = RewardCalculator::new();
        let before = metrics(&[("views", 0.0)]);
        let after = metrics(&[("views", 500.0)]);

        let reward = calc.calculate_reward(&before, &after, 24.0).unwrap();
        assert!((reward - 0.25 * 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_time_decay_reduces_reward() {
        let calc = RewardCalculator::new();
        let before = metrics(&[("views", 1000.0)]);
        let after = metrics(&[("views", 1500.0)]);

        let fresh = calc.calculate_reward(&before, &after, 24.0).unwrap();
        let stale = calc.calculate_reward(&before, &after, 24.0 + 168.0).unwrap();
        assert!(stale < fresh);
        assert!(stale > 0.0, "decay floors at 0.1, never zeroes the reward");
    }

    #[test]
    fn test_time_decay_floor() {
        let calc = RewardCalculator::new();
        let before = metrics(&[("views", 1000.0)]);
        let after = metrics(&[("views", 2000.0)]);

        // Far past the decay window the factor is pinned at 0.1
        let at_floor = calc.calculate_reward(&before, &after, 10_000.0).unwrap();
        let expected = 0.25 * (1.0f64 * 5.0).tanh() * 0.1;
        assert!((at_floor - expected).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_metric_is_validation_error() {
        let calc = RewardCalculator::new();
        let before = metrics(&[("views", f64::NAN)]);
        let after = metrics(&[("views", 100.0)]);

        assert!(calc.calculate_reward(&before, &after, 24.0).is_err());
        assert!(calc.calculate_reward(&after, &before, 24.0).is_err());
    }

    #[test]
    fn test_negative_elapsed_is_validation_error() {
        let calc = RewardCalculator::new();
        let m = metrics(&[("views", 100.0)]);
        assert!(calc.calculate_reward(&m, &m, -1.0).is_err());
    }

    #[test]
    fn test_engagement_bonus_thresholds() {
        let calc = RewardCalculator::new();

        assert_eq!(calc.calculate_engagement_bonus(&metrics(&[("engagement_rate", 0.06)])), 0.2);
        assert_eq!(calc.calculate_engagement_bonus(&metrics(&[("engagement_rate", 0.03)])), 0.1);
        assert_eq!(calc.calculate_engagement_bonus(&metrics(&[("engagement_rate", 0.015)])), 0.05);
        assert_eq!(calc.calculate_engagement_bonus(&metrics(&[("engagement_rate", 0.005)])), 0.0);
        assert_eq!(calc.calculate_engagement_bonus(&MetricMap::new()), 0.0);
    }
}
