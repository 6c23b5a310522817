//! Acquisition configuration.
//!
//! Settings are loaded from YAML files via the `config` crate and
//! deserialized with `deny_unknown_fields`, so a misspelled key is a load
//! error rather than a silently ignored field. After deserialization a
//! semantic validation pass runs; a run is never constructed from
//! settings that fail it.
//!
//! ## Schema
//!
//! ```yaml
//! progression_policy: auto        # auto | manual | qc_gated
//! qc:
//!   enabled: true
//!   focus_score_method: laplacian_variance
//!   compute_focus_score: true
//!   compute_laser_af_displacement: false
//!   compute_z_diff: true
//! policy:
//!   enabled: true
//!   focus_score_min: 100.0
//!   z_drift_max_um: 5.0
//!   detect_outliers:
//!     metric: focus_score
//!     std_threshold: 2.0
//!   pause_if_any_flagged: true
//! ```

use std::path::Path;

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AcqResult};
use crate::metrics::MetricField;
use crate::state::ProgressionPolicy;

/// Focus-score algorithm applied to captured frames.
///
/// Selected once per run from the QC configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusScoreMethod {
    /// Variance of the discrete Laplacian of the image.
    #[default]
    LaplacianVariance,
    /// Image variance divided by its mean (0 when the mean is 0).
    NormalizedVariance,
    /// Mean Sobel gradient magnitude.
    GradientMagnitude,
    /// Mean FFT magnitude after zeroing the centered low-frequency square.
    FftHighFreq,
}

impl std::fmt::Display for FocusScoreMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FocusScoreMethod::LaplacianVariance => "laplacian_variance",
            FocusScoreMethod::NormalizedVariance => "normalized_variance",
            FocusScoreMethod::GradientMagnitude => "gradient_magnitude",
            FocusScoreMethod::FftHighFreq => "fft_high_freq",
        };
        write!(f, "{}", name)
    }
}

/// Which metrics the QC job computes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QcConfig {
    pub enabled: bool,
    pub focus_score_method: FocusScoreMethod,
    pub compute_focus_score: bool,
    pub compute_laser_af_displacement: bool,
    pub compute_z_diff: bool,
}

/// Outlier rule parameters: flag FOVs whose named metric deviates from
/// the timepoint mean by more than `std_threshold` standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutlierConfig {
    pub metric: MetricField,
    pub std_threshold: f64,
}

/// QC policy rule set. Absent optional fields disable the rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub focus_score_min: Option<f64>,
    pub z_drift_max_um: Option<f64>,
    pub detect_outliers: Option<OutlierConfig>,
    pub pause_if_any_flagged: bool,
}

/// Top-level acquisition settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AcquisitionSettings {
    pub progression_policy: ProgressionPolicy,
    pub qc: QcConfig,
    pub policy: PolicyConfig,
}

impl AcquisitionSettings {
    /// Load settings from a YAML file and validate them.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> AcqResult<Self> {
        let path = path.as_ref();
        let settings: Self = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| {
                    AcqError::Configuration(format!("non-UTF8 config path: {:?}", path))
                })?,
                FileFormat::Yaml,
            ))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML string and validate them.
    pub fn from_yaml_str(yaml: &str) -> AcqResult<Self> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> AcqResult<()> {
        if let Some(min) = self.policy.focus_score_min {
            if !min.is_finite() {
                return Err(AcqError::Configuration(
                    "policy.focus_score_min must be finite".into(),
                ));
            }
        }

        if let Some(max) = self.policy.z_drift_max_um {
            if !max.is_finite() || max <= 0.0 {
                return Err(AcqError::Configuration(
                    "policy.z_drift_max_um must be a positive number".into(),
                ));
            }
        }

        if let Some(outliers) = &self.policy.detect_outliers {
            if !outliers.std_threshold.is_finite() || outliers.std_threshold <= 0.0 {
                return Err(AcqError::Configuration(
                    "policy.detect_outliers.std_threshold must be a positive number".into(),
                ));
            }
        }

        // A policy rule over a metric nobody computes can never fire.
        if self.policy.enabled {
            if self.policy.focus_score_min.is_some()
                && !(self.qc.enabled && self.qc.compute_focus_score)
            {
                return Err(AcqError::Configuration(
                    "policy.focus_score_min requires qc.enabled and qc.compute_focus_score".into(),
                ));
            }
            if self.policy.z_drift_max_um.is_some() && !(self.qc.enabled && self.qc.compute_z_diff)
            {
                return Err(AcqError::Configuration(
                    "policy.z_drift_max_um requires qc.enabled and qc.compute_z_diff".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let settings = AcquisitionSettings::from_yaml_str("progression_policy: auto").unwrap();
        assert_eq!(settings.progression_policy, ProgressionPolicy::Auto);
        assert!(!settings.qc.enabled);
        assert!(!settings.policy.enabled);
    }

    #[test]
    fn test_full_yaml_round_trip() {
        let yaml = r#"
progression_policy: qc_gated
qc:
  enabled: true
  focus_score_method: gradient_magnitude
  compute_focus_score: true
  compute_z_diff: true
policy:
  enabled: true
  focus_score_min: 100.0
  z_drift_max_um: 5.0
  detect_outliers:
    metric: focus_score
    std_threshold: 2.0
  pause_if_any_flagged: true
"#;
        let settings = AcquisitionSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.progression_policy, ProgressionPolicy::QcGated);
        assert_eq!(
            settings.qc.focus_score_method,
            FocusScoreMethod::GradientMagnitude
        );
        assert_eq!(settings.policy.focus_score_min, Some(100.0));
        assert_eq!(
            settings.policy.detect_outliers.as_ref().unwrap().metric,
            MetricField::FocusScore
        );
        assert!(settings.policy.pause_if_any_flagged);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = r#"
progression_policy: auto
qc:
  enabled: true
  focus_threshold: 3.0
"#;
        let err = AcquisitionSettings::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AcqError::Config(_)));
    }

    #[test]
    fn test_negative_drift_threshold_rejected() {
        let yaml = r#"
qc:
  enabled: true
  compute_z_diff: true
policy:
  enabled: true
  z_drift_max_um: -1.0
"#;
        let err = AcquisitionSettings::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AcqError::Configuration(_)));
    }

    #[test]
    fn test_rule_over_disabled_metric_rejected() {
        let yaml = r#"
qc:
  enabled: false
policy:
  enabled: true
  focus_score_min: 50.0
"#;
        let err = AcquisitionSettings::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, AcqError::Configuration(_)));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition.yaml");
        std::fs::write(&path, "progression_policy: manual\n").unwrap();

        let settings = AcquisitionSettings::from_yaml_file(&path).unwrap();
        assert_eq!(settings.progression_policy, ProgressionPolicy::Manual);
    }
}
