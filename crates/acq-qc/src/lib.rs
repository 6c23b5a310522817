//! Quality control for acquisition runs.
//!
//! Three pieces, deliberately decoupled from the state machine:
//!
//! - [`focus`] - pure focus-score functions over an image frame.
//! - [`store`] - the per-timepoint metrics store and its CSV persistence.
//! - [`policy`] - threshold/outlier rule evaluation over a store snapshot.
//!
//! The QC job itself ([`qc_job::compute_fov_metrics`]) runs inside the job
//! runner and produces a [`acq_core::FovMetrics`] record; it never touches
//! acquisition state. The worker is responsible for feeding results into
//! the store and for acting on a [`acq_core::PolicyDecision`].

pub mod focus;
pub mod policy;
pub mod qc_job;
pub mod store;

pub use policy::QcPolicy;
pub use qc_job::compute_fov_metrics;
pub use store::{MetricsFrame, TimepointMetricsStore};
