//! Per-FOV quality metrics and policy decisions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fov::FovId;

/// Quality metrics computed for one FOV.
///
/// Optional fields are `None` when the corresponding metric is disabled
/// or its computation failed; `error` carries the failure reason in the
/// latter case. The record is extensible; new optional fields are added
/// without breaking stored CSVs, which write one column per known field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FovMetrics {
    pub fov: FovId,
    pub timestamp: DateTime<Utc>,
    /// Absolute Z position in micrometers.
    pub z_position_um: f64,
    pub focus_score: Option<f64>,
    pub laser_af_displacement_um: Option<f64>,
    pub z_diff_from_last_timepoint_um: Option<f64>,
    pub error: Option<String>,
}

impl FovMetrics {
    pub fn new(fov: FovId, timestamp: DateTime<Utc>, z_position_um: f64) -> Self {
        Self {
            fov,
            timestamp,
            z_position_um,
            focus_score: None,
            laser_af_displacement_um: None,
            z_diff_from_last_timepoint_um: None,
            error: None,
        }
    }

    /// Record for a FOV whose QC computation failed outright.
    pub fn with_error(
        fov: FovId,
        timestamp: DateTime<Utc>,
        z_position_um: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(fov, timestamp, z_position_um)
        }
    }
}

/// Named numeric field of [`FovMetrics`], as referenced by policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    FocusScore,
    ZPositionUm,
    LaserAfDisplacementUm,
    ZDiffFromLastTimepointUm,
}

impl MetricField {
    /// Extract this field's value from a metrics record, if present.
    pub fn extract(&self, metrics: &FovMetrics) -> Option<f64> {
        match self {
            MetricField::FocusScore => metrics.focus_score,
            MetricField::ZPositionUm => Some(metrics.z_position_um),
            MetricField::LaserAfDisplacementUm => metrics.laser_af_displacement_um,
            MetricField::ZDiffFromLastTimepointUm => metrics.z_diff_from_last_timepoint_um,
        }
    }
}

impl std::fmt::Display for MetricField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetricField::FocusScore => "focus_score",
            MetricField::ZPositionUm => "z_position_um",
            MetricField::LaserAfDisplacementUm => "laser_af_displacement_um",
            MetricField::ZDiffFromLastTimepointUm => "z_diff_from_last_timepoint_um",
        };
        write!(f, "{}", name)
    }
}

/// Result of evaluating the QC policy over one timepoint's metrics.
///
/// `flagged` preserves the order in which FOVs were first flagged; a
/// re-flagged FOV is not duplicated but its `reasons` accumulate in
/// rule-evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDecision {
    pub flagged: Vec<FovId>,
    pub reasons: HashMap<FovId, Vec<String>>,
    pub should_pause: bool,
}

impl PolicyDecision {
    /// Flag a FOV with a reason, accumulating without duplication.
    pub fn flag(&mut self, fov: FovId, reason: String) {
        if !self.reasons.contains_key(&fov) {
            self.flagged.push(fov.clone());
        }
        self.reasons.entry(fov).or_default().push(reason);
    }

    pub fn is_clean(&self) -> bool {
        self.flagged.is_empty()
    }
}
