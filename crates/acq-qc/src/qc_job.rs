//! QC metric computation for a single captured frame.

use acq_core::config::QcConfig;
use acq_core::{CaptureInfo, FovMetrics, Frame};
use tracing::debug;

use crate::focus;

/// Compute the configured metrics for one FOV.
///
/// `prev_z_um` is the same FOV's absolute Z at the previous timepoint,
/// when known; the z-diff metric is computed only in that case. A failed
/// focus computation is folded into the record's `error` field; QC never
/// fails a run.
pub fn compute_fov_metrics(
    image: &Frame,
    info: &CaptureInfo,
    qc: &QcConfig,
    prev_z_um: Option<f64>,
) -> FovMetrics {
    let z_um = info.absolute_z_um();
    let mut metrics = FovMetrics::new(info.fov.clone(), info.timestamp, z_um);

    if qc.compute_focus_score {
        match focus::focus_score(qc.focus_score_method, image) {
            Ok(score) => metrics.focus_score = Some(score),
            Err(e) => {
                debug!(fov = %info.fov, error = %e, "focus score computation failed");
                metrics.error = Some(e.to_string());
            }
        }
    }

    if qc.compute_laser_af_displacement {
        metrics.laser_af_displacement_um = info.piezo_z_um;
    }

    if qc.compute_z_diff {
        metrics.z_diff_from_last_timepoint_um = prev_z_um.map(|prev| z_um - prev);
    }

    metrics
}
