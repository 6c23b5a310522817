//! Control-plane handle for UI/RPC threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use acq_core::{FovId, TimepointState};
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::context::AcquisitionContext;
use crate::state_machine::TimepointStateMachine;

/// Slot holding the current timepoint's state machine, installed by the
/// worker at each timepoint start.
pub(crate) type MachineSlot = Arc<Mutex<Option<Arc<TimepointStateMachine>>>>;

/// One-shot proceed signal for `Manual`/`QcGated` progression.
#[derive(Default)]
pub(crate) struct ProceedLatch {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl ProceedLatch {
    pub(crate) fn signal(&self) {
        *self.flag.lock() = true;
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for a signal, consuming it on success.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cv.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut *flag)
    }
}

/// Cloneable handle exposing the run's control plane.
///
/// All operations are safe to call from any thread at any time; those
/// that need a live timepoint state machine are rejected (return `false`)
/// between timepoints.
#[derive(Clone)]
pub struct AcquisitionController {
    context: Arc<AcquisitionContext>,
    machine: MachineSlot,
    proceed: Arc<ProceedLatch>,
}

impl AcquisitionController {
    pub(crate) fn new(
        context: Arc<AcquisitionContext>,
        machine: MachineSlot,
        proceed: Arc<ProceedLatch>,
    ) -> Self {
        Self {
            context,
            machine,
            proceed,
        }
    }

    fn current_machine(&self) -> Option<Arc<TimepointStateMachine>> {
        self.machine.lock().clone()
    }

    /// Request a graceful pause of the current timepoint.
    pub fn pause(&self) -> bool {
        self.current_machine()
            .map(|sm| sm.request_pause())
            .unwrap_or(false)
    }

    /// Resume a paused timepoint.
    pub fn resume(&self) -> bool {
        self.current_machine()
            .map(|sm| sm.resume())
            .unwrap_or(false)
    }

    /// Retake the given FOVs within the paused timepoint.
    pub fn retake(&self, fovs: &[FovId]) -> bool {
        self.current_machine()
            .map(|sm| sm.retake(fovs))
            .unwrap_or(false)
    }

    /// Abort the current operation.
    ///
    /// During a retake session only the session is aborted and the run
    /// stays alive; in every other situation the whole run is aborted via
    /// the context. Returns whether the abort was accepted.
    pub fn abort(&self) -> bool {
        match self.current_machine() {
            Some(sm) => {
                let (accepted, abort_whole_run) = sm.abort();
                if abort_whole_run {
                    info!("aborting acquisition run");
                    self.context.request_abort();
                }
                accepted
            }
            None => {
                info!("aborting acquisition run (no active timepoint)");
                self.context.request_abort();
                true
            }
        }
    }

    /// Allow the run past the progression gate (`Manual`/`QcGated` only).
    pub fn proceed(&self) {
        self.proceed.signal();
    }

    /// State of the current timepoint, if one is active.
    pub fn state(&self) -> Option<TimepointState> {
        self.current_machine().map(|sm| sm.state())
    }

    pub fn fovs_remaining(&self) -> Option<usize> {
        self.current_machine().map(|sm| sm.fovs_remaining())
    }

    pub fn is_aborted(&self) -> bool {
        self.context.is_aborted()
    }

    pub fn current_timepoint(&self) -> usize {
        self.context.current_timepoint()
    }
}
