//! Background job execution for the acquisition loop.
//!
//! The worker thread captures frames and hands the slow work of writing
//! images to disk and computing QC metrics to a [`JobRunner`] pool so
//! the next FOV's hardware motion overlaps with the previous FOV's
//! processing.
//!
//! Job kinds are a closed tagged variant ([`Job`]) with a matching result
//! variant ([`JobResult`]); a shared frame is an `Arc<Frame>` whose buffer
//! is released when the last holding job completes.

pub mod job;
pub mod runner;
pub mod tiff;

pub use job::{Job, JobResult};
pub use runner::{JobRunner, RunnerConfig};
