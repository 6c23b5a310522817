//! Timepoint state and run progression policy.

use serde::{Deserialize, Serialize};

/// State of one timepoint's acquisition.
///
/// The timepoint state machine in `acq-engine` owns the transitions; this
/// enum lives here so the event stream and observers can name states
/// without depending on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimepointState {
    /// Actively acquiring FOVs
    Acquiring,
    /// Acquisition paused, waiting for an external action
    Paused,
    /// Re-acquiring specific FOVs
    Retaking,
    /// All FOVs captured, waiting for the next timepoint or review
    Captured,
}

impl std::fmt::Display for TimepointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimepointState::Acquiring => write!(f, "acquiring"),
            TimepointState::Paused => write!(f, "paused"),
            TimepointState::Retaking => write!(f, "retaking"),
            TimepointState::Captured => write!(f, "captured"),
        }
    }
}

/// How the run advances between timepoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressionPolicy {
    /// Advance as soon as a timepoint reaches `Captured`.
    #[default]
    Auto,
    /// Wait for an external proceed signal.
    Manual,
    /// Wait for an external proceed signal *and* a clean policy decision.
    QcGated,
}

impl std::fmt::Display for ProgressionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressionPolicy::Auto => write!(f, "auto"),
            ProgressionPolicy::Manual => write!(f, "manual"),
            ProgressionPolicy::QcGated => write!(f, "qc_gated"),
        }
    }
}
