//! QC policy evaluation.
//!
//! A pure function over a metrics-store snapshot: it never mutates the
//! store and never touches acquisition state. The worker decides what to
//! do with the resulting [`PolicyDecision`].

use acq_core::config::PolicyConfig;
use acq_core::{MetricField, PolicyDecision};
use tracing::debug;

use crate::store::TimepointMetricsStore;

/// Threshold and outlier rules evaluated at timepoint end.
#[derive(Debug, Clone)]
pub struct QcPolicy {
    config: PolicyConfig,
}

impl QcPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate all configured rules over the store.
    ///
    /// Rule order is fixed: per-FOV thresholds first (focus minimum, then
    /// Z drift), then outlier detection. A FOV flagged by several rules
    /// appears once in `flagged`, at its first-flag position, with the
    /// reasons accumulated in rule order.
    pub fn check_timepoint(&self, store: &TimepointMetricsStore) -> PolicyDecision {
        let mut decision = PolicyDecision::default();
        if !self.config.enabled {
            return decision;
        }

        for m in store.get_all() {
            if let (Some(min), Some(score)) = (self.config.focus_score_min, m.focus_score) {
                if score < min {
                    decision.flag(m.fov.clone(), format!("focus_score={:.2} < {:.1}", score, min));
                }
            }
            if let (Some(max), Some(diff)) =
                (self.config.z_drift_max_um, m.z_diff_from_last_timepoint_um)
            {
                if diff.abs() > max {
                    decision.flag(m.fov.clone(), format!("z_drift={:.2} um > {:.1}", diff, max));
                }
            }
        }

        if let Some(outliers) = &self.config.detect_outliers {
            self.detect_outliers(store, outliers.metric, outliers.std_threshold, &mut decision);
        }

        decision.should_pause = self.config.pause_if_any_flagged && !decision.is_clean();
        debug!(
            flagged = decision.flagged.len(),
            should_pause = decision.should_pause,
            timepoint = store.timepoint(),
            "policy evaluated"
        );
        decision
    }

    /// Flag FOVs whose metric deviates from the mean by strictly more
    /// than `std_threshold` population standard deviations. Needs at
    /// least 3 non-null values to be meaningful.
    fn detect_outliers(
        &self,
        store: &TimepointMetricsStore,
        metric: MetricField,
        std_threshold: f64,
        decision: &mut PolicyDecision,
    ) {
        let values = store.get_metric_values(metric);
        if values.len() < 3 {
            return;
        }

        let n = values.len() as f64;
        let mean = values.iter().map(|(_, v)| v).sum::<f64>() / n;
        let stddev =
            (values.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        for (fov, value) in values {
            if (value - mean).abs() > std_threshold * stddev {
                decision.flag(fov, format!("outlier in {}", metric));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::config::OutlierConfig;
    use acq_core::{FovId, FovMetrics};
    use chrono::Utc;

    fn store_with_scores(scores: &[f64]) -> TimepointMetricsStore {
        let store = TimepointMetricsStore::new(0);
        for (i, &score) in scores.iter().enumerate() {
            let mut m = FovMetrics::new(FovId::new("A", i as u32), Utc::now(), 1000.0);
            m.focus_score = Some(score);
            store.add(m);
        }
        store
    }

    fn policy(config: PolicyConfig) -> QcPolicy {
        QcPolicy::new(PolicyConfig {
            enabled: true,
            ..config
        })
    }

    #[test]
    fn test_disabled_policy_is_always_clean() {
        let store = store_with_scores(&[1.0, 2.0]);
        let policy = QcPolicy::new(PolicyConfig {
            enabled: false,
            focus_score_min: Some(100.0),
            pause_if_any_flagged: true,
            ..Default::default()
        });
        let decision = policy.check_timepoint(&store);
        assert!(decision.is_clean());
        assert!(!decision.should_pause);
    }

    #[test]
    fn test_focus_threshold_reason_format() {
        let store = store_with_scores(&[150.0, 40.0, 200.0]);
        let policy = policy(PolicyConfig {
            focus_score_min: Some(100.0),
            pause_if_any_flagged: true,
            ..Default::default()
        });

        let decision = policy.check_timepoint(&store);
        assert_eq!(decision.flagged, vec![FovId::new("A", 1)]);
        assert_eq!(
            decision.reasons[&FovId::new("A", 1)],
            vec!["focus_score=40.00 < 100.0".to_string()]
        );
        assert!(decision.should_pause);
    }

    #[test]
    fn test_threshold_is_strict() {
        let store = store_with_scores(&[100.0]);
        let policy = policy(PolicyConfig {
            focus_score_min: Some(100.0),
            ..Default::default()
        });
        assert!(policy.check_timepoint(&store).is_clean());
    }

    #[test]
    fn test_z_drift_uses_absolute_value() {
        let store = TimepointMetricsStore::new(1);
        let mut m = FovMetrics::new(FovId::new("A", 0), Utc::now(), 1000.0);
        m.z_diff_from_last_timepoint_um = Some(-6.0);
        store.add(m);

        let policy = policy(PolicyConfig {
            z_drift_max_um: Some(5.0),
            ..Default::default()
        });
        let decision = policy.check_timepoint(&store);
        assert_eq!(
            decision.reasons[&FovId::new("A", 0)],
            vec!["z_drift=-6.00 um > 5.0".to_string()]
        );
    }

    #[test]
    fn test_null_metrics_never_flag() {
        let store = TimepointMetricsStore::new(0);
        store.add(FovMetrics::new(FovId::new("A", 0), Utc::now(), 1000.0));

        let policy = policy(PolicyConfig {
            focus_score_min: Some(100.0),
            z_drift_max_um: Some(1.0),
            ..Default::default()
        });
        assert!(policy.check_timepoint(&store).is_clean());
    }

    fn outlier_policy(threshold: f64) -> QcPolicy {
        policy(PolicyConfig {
            detect_outliers: Some(OutlierConfig {
                metric: MetricField::FocusScore,
                std_threshold: threshold,
            }),
            pause_if_any_flagged: true,
            ..Default::default()
        })
    }

    // The three worked examples: deviations that touch but do not
    // strictly exceed the threshold must not flag.

    #[test]
    fn test_outlier_500_among_100s_not_flagged() {
        let store = store_with_scores(&[100.0, 102.0, 98.0, 500.0]);
        assert!(outlier_policy(2.0).check_timepoint(&store).is_clean());
    }

    #[test]
    fn test_outlier_300_among_100s_not_flagged() {
        let store = store_with_scores(&[100.0, 100.0, 100.0, 300.0]);
        assert!(outlier_policy(2.0).check_timepoint(&store).is_clean());
    }

    #[test]
    fn test_outlier_exact_threshold_not_flagged() {
        // Mean 160, stddev 120: the deviation of 400 is exactly 2 sigma.
        let store = store_with_scores(&[100.0, 100.0, 100.0, 100.0, 400.0]);
        assert!(outlier_policy(2.0).check_timepoint(&store).is_clean());
    }

    #[test]
    fn test_outlier_beyond_threshold_flagged() {
        let store = store_with_scores(&[100.0, 100.0, 100.0, 100.0, 100.0, 1000.0]);
        let decision = outlier_policy(2.0).check_timepoint(&store);
        assert_eq!(decision.flagged, vec![FovId::new("A", 5)]);
        assert_eq!(
            decision.reasons[&FovId::new("A", 5)],
            vec!["outlier in focus_score".to_string()]
        );
        assert!(decision.should_pause);
    }

    #[test]
    fn test_outlier_needs_three_samples() {
        let store = store_with_scores(&[1.0, 1000.0]);
        assert!(outlier_policy(0.1).check_timepoint(&store).is_clean());
    }

    #[test]
    fn test_reasons_accumulate_without_duplicate_flag() {
        let store = TimepointMetricsStore::new(1);
        for i in 0..4u32 {
            let mut m = FovMetrics::new(FovId::new("A", i), Utc::now(), 1000.0);
            m.focus_score = Some(if i == 3 { 1.0 } else { 500.0 });
            m.z_diff_from_last_timepoint_um = Some(if i == 3 { 10.0 } else { 0.0 });
            store.add(m);
        }

        let policy = policy(PolicyConfig {
            focus_score_min: Some(100.0),
            z_drift_max_um: Some(5.0),
            detect_outliers: Some(OutlierConfig {
                metric: MetricField::FocusScore,
                std_threshold: 1.0,
            }),
            pause_if_any_flagged: false,
            ..Default::default()
        });

        let decision = policy.check_timepoint(&store);
        assert_eq!(decision.flagged, vec![FovId::new("A", 3)]);
        let reasons = &decision.reasons[&FovId::new("A", 3)];
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].starts_with("focus_score="));
        assert!(reasons[1].starts_with("z_drift="));
        assert_eq!(reasons[2], "outlier in focus_score");
        // pause_if_any_flagged off: flags never pause.
        assert!(!decision.should_pause);
    }
}
