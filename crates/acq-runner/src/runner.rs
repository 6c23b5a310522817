//! Worker pool executing jobs in the background.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Acquisition worker                   │
//! │     dispatch() per frame, poll_results() per FOV     │
//! └──────────────────────────────────────────────────────┘
//!                │ FIFO queue (mpsc)         ▲
//!                ▼                           │ completed batch
//! ┌──────────────────────────────────────────────────────┐
//! │        acq-job-0 .. acq-job-N worker threads         │
//! │   pop → run → push JobResult → signal if drained     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Ordering between dispatches is not preserved: two jobs may complete in
//! either order. `drain()` is the only rendezvous: it blocks until every
//! dispatched job has reported a result.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use acq_core::error::{AcqError, AcqResult, JobError, JobKind};
use acq_core::FovId;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobResult};

/// Upper bound on the worker count regardless of core count.
const MAX_WORKERS: usize = 8;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of worker threads (default: logical CPUs, capped at 8).
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(MAX_WORKERS),
        }
    }
}

impl RunnerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }
}

/// State shared between the dispatching thread and the workers.
struct Shared {
    completed: Mutex<Vec<JobResult>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    dispatched: AtomicU64,
}

/// Bounded parallel executor for per-FOV jobs.
pub struct JobRunner {
    /// `None` once shutdown begins; dropping the sender stops the workers.
    queue: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let workers = config.workers.clamp(1, MAX_WORKERS);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let shared = Arc::new(Shared {
            completed: Mutex::new(Vec::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            dispatched: AtomicU64::new(0),
        });

        info!(workers, "starting job runner");

        let handles = (0..workers)
            .map(|i| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("acq-job-{}", i))
                    .spawn(move || worker_loop(rx, shared))
                    .expect("failed to spawn job worker thread")
            })
            .collect();

        Self {
            queue: Mutex::new(Some(tx)),
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueue a job for background execution. Returns immediately.
    ///
    /// Fails with [`AcqError::RunnerShutdown`] once `shutdown()` has run.
    pub fn dispatch(&self, job: Job) -> AcqResult<()> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(AcqError::RunnerShutdown);
        };

        debug!(kind = %job.kind(), fov = %job.fov(), "dispatching job");
        *self.shared.outstanding.lock() += 1;
        if tx.send(job).is_err() {
            // Workers are gone; undo the accounting.
            *self.shared.outstanding.lock() -= 1;
            return Err(AcqError::RunnerShutdown);
        }
        self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the batch of results completed since the last poll.
    pub fn poll_results(&self) -> Vec<JobResult> {
        std::mem::take(&mut *self.shared.completed.lock())
    }

    /// Block until every dispatched job has completed.
    pub fn drain(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    /// Refuse new dispatches, drain outstanding work and join the workers.
    ///
    /// Idempotent; later calls are no-ops.
    pub fn shutdown(&self) {
        let was_running = self.queue.lock().take().is_some();
        if !was_running {
            return;
        }

        self.drain();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("job worker panicked during shutdown");
            }
        }
        info!(
            dispatched = self.shared.dispatched.load(Ordering::Relaxed),
            "job runner stopped"
        );
    }

    /// Total jobs accepted since construction.
    pub fn dispatched_jobs(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Jobs dispatched but not yet completed.
    pub fn outstanding_jobs(&self) -> usize {
        *self.shared.outstanding.lock()
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, shared: Arc<Shared>) {
    loop {
        // Hold the receiver lock only while popping, not while running.
        let job = { rx.lock().recv() };
        let Ok(job) = job else {
            break; // queue sender dropped: shutdown
        };

        let kind = job.kind();
        let fov = job.fov().clone();
        let save_path = match &job {
            Job::SaveImage { path, .. } => Some(path.clone()),
            Job::QcMetrics { .. } => None,
        };

        // A panicking job must not take the worker thread (and with it
        // every later drain()) down; it becomes a failed result like any
        // other job error.
        let result = match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%kind, %fov, panic = %message, "job panicked");
                panicked_result(kind, fov, save_path, message)
            }
        };

        shared.completed.lock().push(result);
        let mut outstanding = shared.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            shared.idle.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Failure result standing in for a job that panicked instead of
/// returning.
fn panicked_result(
    kind: JobKind,
    fov: FovId,
    save_path: Option<PathBuf>,
    message: String,
) -> JobResult {
    let err = JobError::new(kind, Some(fov.clone()), format!("job panicked: {}", message));
    match kind {
        JobKind::SaveImage => JobResult::SaveImage {
            fov,
            path: save_path.unwrap_or_default(),
            outcome: Err(err),
        },
        JobKind::Qc => JobResult::Qc {
            fov,
            outcome: Err(err),
        },
    }
}
