//! Core types for the acquisition control stack.
//!
//! This crate provides the foundational vocabulary shared by every other
//! crate in the workspace: FOV identity and capture records, the image
//! frame buffer, the per-FOV metrics record, timepoint state and
//! progression policy, the observer event stream, the error taxonomy,
//! and the validated configuration surface.
//!
//! Nothing in here talks to hardware or spawns threads; the heaviest
//! machinery is the [`events::EventBus`] fan-out and the
//! [`config`](crate::config) loader.

pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod fov;
pub mod metrics;
pub mod state;

pub use config::{
    AcquisitionSettings, FocusScoreMethod, OutlierConfig, PolicyConfig, QcConfig,
};
pub use data::{Frame, PixelData};
pub use error::{AcqError, AcqResult, HardwareError, HardwareErrorKind, JobError, JobKind};
pub use events::{AcquisitionEvent, EventBus};
pub use fov::{CaptureInfo, FovId};
pub use metrics::{FovMetrics, MetricField, PolicyDecision};
pub use state::{ProgressionPolicy, TimepointState};
