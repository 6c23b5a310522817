//! Error types for the acquisition stack.
//!
//! This module defines the primary error type, [`AcqError`], together with
//! the structured errors produced by the two failure-prone subsystems:
//! hardware ([`HardwareError`]) and background jobs ([`JobError`]).
//!
//! ## Error Hierarchy
//!
//! `AcqError` consolidates the error sources of the whole workspace:
//!
//! - **`Config`**: wraps errors from the `config` crate, typically file
//!   parsing or format issues (including unknown fields, which the
//!   settings structs reject).
//! - **`Configuration`**: semantic errors in the configuration: values
//!   that parse but are logically invalid (e.g. a negative drift
//!   threshold). Caught during the validation step, before a run starts.
//! - **`Io`**: wraps `std::io::Error` for file operations (metric CSVs,
//!   the summary JSON, output directories).
//! - **`Hardware`**: structured error from the microscope interface.
//!   Fatal to the run; the worker propagates abort through the context.
//! - **`Job`**: failure inside a background job. Save failures are fatal
//!   to the run; QC failures are folded into the per-FOV metrics record
//!   and never pause the run by themselves.
//! - **`Processing`**: numerical/data failures inside metric computation
//!   (e.g. an image too small for a convolution kernel).
//! - **`RunnerShutdown`**: a dispatch was attempted after the job runner
//!   stopped accepting work.
//!
//! Rejected state-machine transitions are deliberately *not* errors: the
//! state machine reports them as negative results (`false`) without
//! mutating state, so callers can probe transitions cheaply.

use thiserror::Error;

use crate::fov::FovId;

// =============================================================================
// Hardware Errors
// =============================================================================

/// Category of a hardware failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareErrorKind {
    Initialization,
    Communication,
    Motion,
    Trigger,
    Channel,
    Timeout,
}

impl std::fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HardwareErrorKind::Initialization => "initialization",
            HardwareErrorKind::Communication => "communication",
            HardwareErrorKind::Motion => "motion",
            HardwareErrorKind::Trigger => "trigger",
            HardwareErrorKind::Channel => "channel",
            HardwareErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", label)
    }
}

/// Structured error from the microscope hardware interface.
///
/// Carries the device name so multi-device setups can tell a stage fault
/// from a camera fault in the same run log.
#[derive(Error, Debug, Clone)]
#[error("Hardware '{device}' {kind} error: {message}")]
pub struct HardwareError {
    pub device: String,
    pub kind: HardwareErrorKind,
    pub message: String,
}

impl HardwareError {
    pub fn new(
        device: impl Into<String>,
        kind: HardwareErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Job Errors
// =============================================================================

/// The kind of background job that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    SaveImage,
    Qc,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::SaveImage => write!(f, "save_image"),
            JobKind::Qc => write!(f, "qc"),
        }
    }
}

/// Structured failure from a background job.
///
/// The FOV identifier is present whenever the job was bound to a specific
/// capture site, which is every job kind today.
#[derive(Error, Debug, Clone)]
pub struct JobError {
    pub kind: JobKind,
    pub fov: Option<FovId>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobKind, fov: Option<FovId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            fov,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fov {
            Some(fov) => write!(f, "Job '{}' failed for {}: {}", self.kind, fov, self.message),
            None => write!(f, "Job '{}' failed: {}", self.kind, self.message),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type for the acquisition stack.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Configuration file parsing failed.
    ///
    /// Unknown fields are rejected at this level: the settings structs
    /// deserialize with `deny_unknown_fields`, so a typo in the YAML
    /// surfaces here rather than being silently ignored.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration validation failed.
    ///
    /// Values parsed correctly but fail semantic checks (negative
    /// thresholds, a policy rule referencing a disabled metric, an empty
    /// acquisition plan). Prevents the run from starting; no state
    /// machine is created.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Microscope hardware failure. Fatal to the run.
    #[error("{0}")]
    Hardware(#[from] HardwareError),

    /// Background job failure.
    ///
    /// Only save-image failures reach the caller as this variant; QC
    /// failures are recorded as metric-level errors by the worker.
    #[error("{0}")]
    Job(#[from] JobError),

    /// Data processing failure inside metric computation.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// The job runner no longer accepts dispatches.
    #[error("Job runner is shut down")]
    RunnerShutdown,
}
