//! Per-timepoint metrics store.
//!
//! Thread-safe mapping from FOV identifier to its metrics, scoped to one
//! timepoint. The store is append-or-replace only: a retake replaces the
//! FOV's record in place (the original insertion position is kept), and
//! every entry carries the store's timepoint index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use acq_core::error::{AcqError, AcqResult};
use acq_core::{FovId, FovMetrics, MetricField};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Fixed CSV column order for `qc_metrics.csv`.
const CSV_COLUMNS: [&str; 8] = [
    "region_id",
    "fov_index",
    "timestamp",
    "z_position_um",
    "focus_score",
    "laser_af_displacement_um",
    "z_diff_from_last_timepoint_um",
    "error",
];

#[derive(Default)]
struct Inner {
    order: Vec<FovId>,
    entries: HashMap<FovId, FovMetrics>,
}

/// Columnar snapshot of a store for in-process analysis.
///
/// Rows share one index: `fovs[i]` goes with `focus_score[i]` and so on,
/// in store insertion order.
#[derive(Debug, Clone, Default)]
pub struct MetricsFrame {
    pub fovs: Vec<FovId>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub z_position_um: Vec<f64>,
    pub focus_score: Vec<Option<f64>>,
    pub laser_af_displacement_um: Vec<Option<f64>>,
    pub z_diff_from_last_timepoint_um: Vec<Option<f64>>,
    pub errors: Vec<Option<String>>,
}

impl MetricsFrame {
    pub fn len(&self) -> usize {
        self.fovs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fovs.is_empty()
    }

    /// One numeric column by field name, nulls preserved.
    pub fn column(&self, field: MetricField) -> Vec<Option<f64>> {
        match field {
            MetricField::FocusScore => self.focus_score.clone(),
            MetricField::ZPositionUm => self.z_position_um.iter().map(|&v| Some(v)).collect(),
            MetricField::LaserAfDisplacementUm => self.laser_af_displacement_um.clone(),
            MetricField::ZDiffFromLastTimepointUm => {
                self.z_diff_from_last_timepoint_um.clone()
            }
        }
    }
}

/// Metrics for all FOVs of one timepoint.
pub struct TimepointMetricsStore {
    timepoint: usize,
    inner: Mutex<Inner>,
}

impl TimepointMetricsStore {
    pub fn new(timepoint: usize) -> Self {
        Self {
            timepoint,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn timepoint(&self) -> usize {
        self.timepoint
    }

    /// Insert or replace the record for a FOV.
    pub fn add(&self, metrics: FovMetrics) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&metrics.fov) {
            inner.order.push(metrics.fov.clone());
        }
        inner.entries.insert(metrics.fov.clone(), metrics);
    }

    pub fn get(&self, fov: &FovId) -> Option<FovMetrics> {
        self.inner.lock().entries.get(fov).cloned()
    }

    /// Snapshot of all records in insertion order.
    pub fn get_all(&self) -> Vec<FovMetrics> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|fov| inner.entries.get(fov).cloned())
            .collect()
    }

    /// Snapshot of the non-null values of one metric, in insertion order.
    pub fn get_metric_values(&self, field: MetricField) -> Vec<(FovId, f64)> {
        self.get_all()
            .into_iter()
            .filter_map(|m| field.extract(&m).map(|v| (m.fov, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Columnar snapshot for in-process analysis.
    pub fn to_frame(&self) -> MetricsFrame {
        let mut frame = MetricsFrame::default();
        for m in self.get_all() {
            frame.fovs.push(m.fov);
            frame.timestamps.push(m.timestamp);
            frame.z_position_um.push(m.z_position_um);
            frame.focus_score.push(m.focus_score);
            frame.laser_af_displacement_um.push(m.laser_af_displacement_um);
            frame
                .z_diff_from_last_timepoint_um
                .push(m.z_diff_from_last_timepoint_um);
            frame.errors.push(m.error);
        }
        frame
    }

    /// Write the store as CSV, one row per FOV in insertion order.
    ///
    /// Missing values are empty strings. Floats use shortest-round-trip
    /// formatting, so [`TimepointMetricsStore::load`] restores them
    /// exactly.
    pub fn save(&self, path: impl AsRef<Path>) -> AcqResult<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::Writer::from_writer(BufWriter::new(file));

        writer
            .write_record(CSV_COLUMNS)
            .map_err(|e| AcqError::Processing(format!("csv write failed: {}", e)))?;

        for m in self.get_all() {
            writer
                .write_record([
                    m.fov.region_id.clone(),
                    m.fov.fov_index.to_string(),
                    m.timestamp.to_rfc3339(),
                    m.z_position_um.to_string(),
                    fmt_opt(m.focus_score),
                    fmt_opt(m.laser_af_displacement_um),
                    fmt_opt(m.z_diff_from_last_timepoint_um),
                    m.error.clone().unwrap_or_default(),
                ])
                .map_err(|e| AcqError::Processing(format!("csv write failed: {}", e)))?;
        }

        writer
            .flush()
            .map_err(|e| AcqError::Processing(format!("csv flush failed: {}", e)))?;
        Ok(())
    }

    /// Read a store back from a CSV written by [`TimepointMetricsStore::save`].
    pub fn load(path: impl AsRef<Path>, timepoint: usize) -> AcqResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));

        let headers = reader
            .headers()
            .map_err(|e| AcqError::Processing(format!("csv read failed: {}", e)))?;
        if headers.iter().ne(CSV_COLUMNS) {
            return Err(AcqError::Processing(format!(
                "unexpected qc_metrics columns: {:?}",
                headers
            )));
        }

        let store = Self::new(timepoint);
        for record in reader.records() {
            let record =
                record.map_err(|e| AcqError::Processing(format!("csv read failed: {}", e)))?;
            let field = |i: usize| record.get(i).unwrap_or_default();

            let fov = FovId::new(
                field(0),
                field(1)
                    .parse::<u32>()
                    .map_err(|e| AcqError::Processing(format!("bad fov_index: {}", e)))?,
            );
            let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(field(2))
                .map_err(|e| AcqError::Processing(format!("bad timestamp: {}", e)))?
                .with_timezone(&Utc);

            let metrics = FovMetrics {
                fov,
                timestamp,
                z_position_um: parse_f64(field(3))?.ok_or_else(|| {
                    AcqError::Processing("missing z_position_um".to_string())
                })?,
                focus_score: parse_f64(field(4))?,
                laser_af_displacement_um: parse_f64(field(5))?,
                z_diff_from_last_timepoint_um: parse_f64(field(6))?,
                error: match field(7) {
                    "" => None,
                    s => Some(s.to_string()),
                },
            };
            store.add(metrics);
        }
        Ok(store)
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_f64(s: &str) -> AcqResult<Option<f64>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse::<f64>()
        .map(Some)
        .map_err(|e| AcqError::Processing(format!("bad float '{}': {}", s, e)))
}
