//! Job kinds and their results.

use std::path::PathBuf;
use std::sync::Arc;

use acq_core::config::QcConfig;
use acq_core::error::{JobError, JobKind};
use acq_core::{CaptureInfo, FovId, FovMetrics, Frame};
use tracing::debug;

use crate::tiff;

/// A unit of background work for one captured frame.
///
/// Each job owns an `Arc` handle to its frame; the frame buffer is freed
/// when the last handle drops, which for a save+QC pair is whichever job
/// finishes second.
pub enum Job {
    /// Write the frame to disk next to its capture info.
    SaveImage {
        image: Arc<Frame>,
        info: CaptureInfo,
        path: PathBuf,
    },
    /// Compute QC metrics for the frame.
    QcMetrics {
        image: Arc<Frame>,
        info: CaptureInfo,
        qc: QcConfig,
        /// Same FOV's absolute Z at the previous timepoint, when known.
        prev_z_um: Option<f64>,
    },
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::SaveImage { .. } => JobKind::SaveImage,
            Job::QcMetrics { .. } => JobKind::Qc,
        }
    }

    pub fn fov(&self) -> &FovId {
        match self {
            Job::SaveImage { info, .. } => &info.fov,
            Job::QcMetrics { info, .. } => &info.fov,
        }
    }

    /// Execute the job, consuming it (and its frame handle).
    pub(crate) fn run(self) -> JobResult {
        match self {
            Job::SaveImage { image, info, path } => {
                let outcome = tiff::write_frame(&image, &path).map_err(|e| {
                    JobError::new(JobKind::SaveImage, Some(info.fov.clone()), e.to_string())
                });
                if outcome.is_ok() {
                    debug!(fov = %info.fov, path = %path.display(), "image saved");
                }
                JobResult::SaveImage {
                    fov: info.fov,
                    path,
                    outcome,
                }
            }
            Job::QcMetrics {
                image,
                info,
                qc,
                prev_z_um,
            } => {
                let metrics = acq_qc::compute_fov_metrics(&image, &info, &qc, prev_z_um);
                JobResult::Qc {
                    fov: info.fov,
                    outcome: Ok(metrics),
                }
            }
        }
    }
}

/// Completed-job report, tagged like [`Job`].
#[derive(Debug)]
pub enum JobResult {
    SaveImage {
        fov: FovId,
        path: PathBuf,
        outcome: Result<(), JobError>,
    },
    Qc {
        fov: FovId,
        outcome: Result<FovMetrics, JobError>,
    },
}

impl JobResult {
    pub fn kind(&self) -> JobKind {
        match self {
            JobResult::SaveImage { .. } => JobKind::SaveImage,
            JobResult::Qc { .. } => JobKind::Qc,
        }
    }

    pub fn fov(&self) -> &FovId {
        match self {
            JobResult::SaveImage { fov, .. } => fov,
            JobResult::Qc { fov, .. } => fov,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::config::FocusScoreMethod;
    use chrono::Utc;

    fn info() -> CaptureInfo {
        CaptureInfo {
            fov: FovId::new("A", 0),
            timepoint: 0,
            timestamp: Utc::now(),
            stage_x_mm: 0.0,
            stage_y_mm: 0.0,
            stage_z_mm: 1.0,
            piezo_z_um: None,
            channel: "BF".to_string(),
        }
    }

    #[test]
    fn test_save_job_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A_0_BF.tiff");

        let job = Job::SaveImage {
            image: Arc::new(Frame::from_gray8(4, 4, vec![9; 16])),
            info: info(),
            path: path.clone(),
        };
        assert_eq!(job.kind(), JobKind::SaveImage);

        match job.run() {
            JobResult::SaveImage { outcome, .. } => outcome.unwrap(),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(path.exists());
    }

    #[test]
    fn test_save_job_failure_is_structured() {
        let job = Job::SaveImage {
            image: Arc::new(Frame::from_gray8(4, 4, vec![0; 2])),
            info: info(),
            path: std::env::temp_dir().join("never_written.tiff"),
        };

        match job.run() {
            JobResult::SaveImage { outcome, fov, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.kind, JobKind::SaveImage);
                assert_eq!(err.fov, Some(fov));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_qc_job_produces_metrics() {
        let qc = QcConfig {
            enabled: true,
            focus_score_method: FocusScoreMethod::NormalizedVariance,
            compute_focus_score: true,
            compute_z_diff: true,
            ..Default::default()
        };
        let job = Job::QcMetrics {
            image: Arc::new(Frame::from_gray8(4, 4, (0..16).collect())),
            info: info(),
            qc,
            prev_z_um: Some(900.0),
        };

        match job.run() {
            JobResult::Qc { outcome, .. } => {
                let m = outcome.unwrap();
                assert!(m.focus_score.is_some());
                assert_eq!(m.z_diff_from_last_timepoint_um, Some(100.0));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_frame_released_when_last_job_finishes() {
        let frame = Arc::new(Frame::from_gray8(4, 4, vec![1; 16]));
        let weak = Arc::downgrade(&frame);
        let dir = tempfile::tempdir().unwrap();

        let save = Job::SaveImage {
            image: frame.clone(),
            info: info(),
            path: dir.path().join("x.tiff"),
        };
        let qc = Job::QcMetrics {
            image: frame.clone(),
            info: info(),
            qc: QcConfig::default(),
            prev_z_um: None,
        };

        // Loop's own handle released right after dispatch.
        drop(frame);
        assert!(weak.upgrade().is_some());

        let _ = save.run();
        let _ = qc.run();
        assert!(weak.upgrade().is_none());
    }
}
