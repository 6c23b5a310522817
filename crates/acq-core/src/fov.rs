//! FOV identity and per-capture records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a field of view within an acquisition.
///
/// Equality and hashing are by value; the derived ordering
/// (`region_id` ascending, then `fov_index` ascending) is the planned
/// capture order within a timepoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FovId {
    pub region_id: String,
    pub fov_index: u32,
}

impl FovId {
    pub fn new(region_id: impl Into<String>, fov_index: u32) -> Self {
        Self {
            region_id: region_id.into(),
            fov_index,
        }
    }
}

impl std::fmt::Display for FovId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region_id, self.fov_index)
    }
}

/// Per-FOV record produced at dispatch time. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureInfo {
    pub fov: FovId,
    pub timepoint: usize,
    pub timestamp: DateTime<Utc>,
    pub stage_x_mm: f64,
    pub stage_y_mm: f64,
    pub stage_z_mm: f64,
    /// Piezo-Z displacement in micrometers, when a piezo is fitted.
    pub piezo_z_um: Option<f64>,
    pub channel: String,
}

impl CaptureInfo {
    /// Absolute Z position in micrometers (stage Z plus piezo displacement).
    pub fn absolute_z_um(&self) -> f64 {
        self.stage_z_mm * 1000.0 + self.piezo_z_um.unwrap_or(0.0)
    }
}
