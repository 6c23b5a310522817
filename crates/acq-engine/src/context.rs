//! Run-level acquisition context.

use acq_core::error::{AcqError, AcqResult};
use acq_core::ProgressionPolicy;
use parking_lot::Mutex;

struct Inner {
    current_timepoint: usize,
    aborted: bool,
}

/// Control record for one acquisition run.
///
/// Tracks the timepoint index and the abort flag behind a single mutex.
/// The context holds no references to state machines or stores; it only
/// answers "should the run keep going, and under which progression
/// policy".
pub struct AcquisitionContext {
    inner: Mutex<Inner>,
    total_timepoints: usize,
    progression_policy: ProgressionPolicy,
}

impl AcquisitionContext {
    /// Create a context for `total_timepoints >= 1` timepoints.
    pub fn new(total_timepoints: usize, progression_policy: ProgressionPolicy) -> AcqResult<Self> {
        if total_timepoints == 0 {
            return Err(AcqError::Configuration(
                "total_timepoints must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                current_timepoint: 0,
                aborted: false,
            }),
            total_timepoints,
            progression_policy,
        })
    }

    pub fn current_timepoint(&self) -> usize {
        self.inner.lock().current_timepoint
    }

    pub fn total_timepoints(&self) -> usize {
        self.total_timepoints
    }

    /// Move to the next timepoint index.
    pub fn advance(&self) {
        self.inner.lock().current_timepoint += 1;
    }

    /// Request cooperative abort of the whole run.
    pub fn request_abort(&self) {
        self.inner.lock().aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    pub fn progression_policy(&self) -> ProgressionPolicy {
        self.progression_policy
    }

    /// True while the run loop should keep iterating timepoints.
    pub fn should_continue(&self) -> bool {
        let inner = self.inner.lock();
        !inner.aborted && inner.current_timepoint < self.total_timepoints
    }
}
