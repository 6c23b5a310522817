//! Acquisition control core.
//!
//! Drives FOV-by-FOV capture across timepoints, with graceful pause,
//! per-FOV retake, background save/QC jobs and policy evaluation.
//!
//! # Structure
//!
//! - [`context::AcquisitionContext`] - run-level control record:
//!   timepoint index, abort flag, progression policy.
//! - [`state_machine::TimepointStateMachine`] - pause / resume / retake
//!   control within one timepoint.
//! - [`controller::AcquisitionController`] - cloneable control-plane
//!   handle for UI/RPC threads.
//! - [`worker::AcquisitionWorker`] - the per-FOV loop tying context,
//!   state machine, job runner, metrics store and hardware together.
//!
//! # Threads
//!
//! The worker runs on one dedicated thread and is the only code that
//! touches hardware. Control operations arrive from any other thread
//! through the state machine, which is the single synchronization point
//! (one lock, two condition variables). Background jobs run in the
//! `acq-runner` pool and report back through result polling on the
//! worker thread.

pub mod context;
pub mod controller;
pub mod state_machine;
pub mod worker;

pub use context::AcquisitionContext;
pub use controller::AcquisitionController;
pub use state_machine::TimepointStateMachine;
pub use worker::{AcquisitionWorker, PlannedFov, RunPlan};
