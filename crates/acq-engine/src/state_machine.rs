//! Timepoint state machine for pause/resume/retake control.
//!
//! Thread-safe state machine used from the control plane (pause, resume,
//! retake, abort) and from the worker thread (state queries, transitions
//! at safe points).
//!
//! # State transitions
//!
//! ```text
//! ┌───────────┐ mark_all_captured ┌──────────┐
//! │ Acquiring │──────────────────▶│ Captured │
//! └───────────┘                   └──────────┘
//!    ▲     │ request_pause           │     ▲
//!    │     │ + complete_pause        │     │ resume()
//!    │     ▼                         ▼     │ (no FOVs left)
//!    │  ┌────────────────────────────────┐
//!    └──│             Paused             │
//! resume└────────────────────────────────┘
//! (FOVs      │ retake(fovs)      ▲
//!  left)     ▼                   │ complete_retakes / abort
//!        ┌──────────┐            │
//!        │ Retaking │────────────┘
//!        └──────────┘
//! ```
//!
//! Pause is graceful: `request_pause` only raises a flag, and the worker
//! transitions via `complete_pause` after finishing the in-flight FOV and
//! draining its jobs. Illegal operations return `false` without mutating
//! anything.

use std::time::{Duration, Instant};

use acq_core::{AcquisitionEvent, EventBus, FovId, TimepointState};
use parking_lot::{Condvar, Mutex};

struct Inner {
    state: TimepointState,
    fovs_remaining: usize,
    total_fovs: usize,
    pause_requested: bool,
    resume_signal: bool,
    retake_list: Vec<FovId>,
}

/// Pause/resume/retake control for one timepoint.
///
/// One mutex guards all state; two condition variables signal the two
/// blocking waits (`wait_for_pause` for the control plane,
/// `wait_for_resume` for the worker). Events are emitted while the lock
/// is held so observers see transitions in the order they happened;
/// emission is a non-blocking channel send, never a callback.
pub struct TimepointStateMachine {
    inner: Mutex<Inner>,
    pause_cv: Condvar,
    resume_cv: Condvar,
    events: EventBus,
}

impl TimepointStateMachine {
    pub fn new(total_fovs: usize, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TimepointState::Acquiring,
                fovs_remaining: total_fovs,
                total_fovs,
                pause_requested: false,
                resume_signal: false,
                retake_list: Vec::new(),
            }),
            pause_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            events,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> TimepointState {
        self.inner.lock().state
    }

    /// Count of FOVs still to acquire.
    pub fn fovs_remaining(&self) -> usize {
        self.inner.lock().fovs_remaining
    }

    pub fn total_fovs(&self) -> usize {
        self.inner.lock().total_fovs
    }

    // --- Pause / resume ---

    /// Request a pause. Accepted only from `Acquiring` or `Captured`.
    ///
    /// Idempotent: repeated requests are equivalent to one. The actual
    /// transition happens when the worker calls [`complete_pause`]
    /// (after finishing the current FOV and draining its jobs).
    ///
    /// [`complete_pause`]: TimepointStateMachine::complete_pause
    pub fn request_pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            TimepointState::Acquiring | TimepointState::Captured
        ) {
            return false;
        }
        let newly_requested = !inner.pause_requested;
        inner.pause_requested = true;
        self.pause_cv.notify_all();
        if newly_requested {
            self.events.emit(AcquisitionEvent::PauseRequested);
        }
        true
    }

    /// Whether a pause is pending.
    pub fn is_pause_requested(&self) -> bool {
        self.inner.lock().pause_requested
    }

    /// Block until a pause is requested, or until `timeout` elapses.
    ///
    /// Returns whether the flag is set. Timing out changes nothing.
    pub fn wait_for_pause(&self, timeout: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        match timeout {
            None => {
                while !inner.pause_requested {
                    self.pause_cv.wait(&mut inner);
                }
                true
            }
            Some(t) => {
                let deadline = Instant::now() + t;
                while !inner.pause_requested {
                    if self.pause_cv.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                inner.pause_requested
            }
        }
    }

    /// Complete the transition to `Paused` iff a pause is pending.
    ///
    /// This is the only entry into `Paused` apart from
    /// [`complete_retakes`] and abort-from-`Retaking`. Clears the flag.
    ///
    /// [`complete_retakes`]: TimepointStateMachine::complete_retakes
    pub fn complete_pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.pause_requested {
            return false;
        }
        inner.pause_requested = false;
        let old = inner.state;
        inner.state = TimepointState::Paused;
        self.emit_transition(old, TimepointState::Paused);
        self.events.emit(AcquisitionEvent::Paused);
        true
    }

    /// Resume from `Paused`: back to `Acquiring` if FOVs remain,
    /// otherwise to `Captured`. Signals the waiting worker.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TimepointState::Paused {
            return false;
        }
        let new = if inner.fovs_remaining > 0 {
            TimepointState::Acquiring
        } else {
            TimepointState::Captured
        };
        inner.state = new;
        inner.resume_signal = true;
        self.resume_cv.notify_all();
        self.emit_transition(TimepointState::Paused, new);
        self.events.emit(AcquisitionEvent::Resumed);
        true
    }

    /// Block until resumed (or a retake starts), or until `timeout`
    /// elapses. Consumes the signal on success.
    pub fn wait_for_resume(&self, timeout: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        match timeout {
            None => {
                while !inner.resume_signal {
                    self.resume_cv.wait(&mut inner);
                }
            }
            Some(t) => {
                let deadline = Instant::now() + t;
                while !inner.resume_signal {
                    if self.resume_cv.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                if !inner.resume_signal {
                    return false;
                }
            }
        }
        inner.resume_signal = false;
        true
    }

    // --- Retake ---

    /// Start retaking the given FOVs. Valid only from `Paused` with a
    /// non-empty list. Signals the waiting worker.
    pub fn retake(&self, fovs: &[FovId]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TimepointState::Paused || fovs.is_empty() {
            return false;
        }
        inner.retake_list = fovs.to_vec();
        inner.state = TimepointState::Retaking;
        inner.resume_signal = true;
        self.resume_cv.notify_all();
        self.emit_transition(TimepointState::Paused, TimepointState::Retaking);
        self.events.emit(AcquisitionEvent::RetakeStarted {
            fovs: fovs.to_vec(),
        });
        true
    }

    /// Snapshot copy of the pending retake list.
    pub fn get_retake_list(&self) -> Vec<FovId> {
        self.inner.lock().retake_list.clone()
    }

    /// Finish the retake session and return to `Paused`.
    pub fn complete_retakes(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TimepointState::Retaking {
            return false;
        }
        inner.retake_list.clear();
        inner.state = TimepointState::Paused;
        self.emit_transition(TimepointState::Retaking, TimepointState::Paused);
        self.events.emit(AcquisitionEvent::RetakesComplete);
        true
    }

    // --- FOV tracking ---

    /// Mark one FOV captured. Saturates at zero; retakes do not restore
    /// the count. No state transition.
    pub fn mark_fov_captured(&self) {
        let mut inner = self.inner.lock();
        inner.fovs_remaining = inner.fovs_remaining.saturating_sub(1);
    }

    /// Transition `Acquiring` → `Captured` once every FOV is done.
    pub fn mark_all_captured(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TimepointState::Acquiring {
            return false;
        }
        inner.state = TimepointState::Captured;
        self.emit_transition(TimepointState::Acquiring, TimepointState::Captured);
        true
    }

    // --- Abort ---

    /// Abort the current operation.
    ///
    /// From `Retaking` only the retake session is aborted: the list is
    /// cleared, the machine returns to `Paused` and the run stays alive
    /// (`abort_whole_run == false`). From any other state the caller is
    /// told to abort the entire run and propagate to the context.
    pub fn abort(&self) -> (bool, bool) {
        let mut inner = self.inner.lock();
        if inner.state == TimepointState::Retaking {
            inner.retake_list.clear();
            inner.state = TimepointState::Paused;
            inner.resume_signal = true;
            self.resume_cv.notify_all();
            self.emit_transition(TimepointState::Retaking, TimepointState::Paused);
            (true, false)
        } else {
            (true, true)
        }
    }

    fn emit_transition(&self, old: TimepointState, new: TimepointState) {
        if old != new {
            self.events
                .emit(AcquisitionEvent::StateChanged { old, new });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn machine(total_fovs: usize) -> TimepointStateMachine {
        TimepointStateMachine::new(total_fovs, EventBus::new())
    }

    #[test]
    fn test_initial_state() {
        let sm = machine(5);
        assert_eq!(sm.state(), TimepointState::Acquiring);
        assert_eq!(sm.fovs_remaining(), 5);
        assert_eq!(sm.total_fovs(), 5);
    }

    // --- Pause / resume ---

    #[test]
    fn test_request_pause_from_acquiring() {
        let sm = machine(5);
        assert!(sm.request_pause());
        assert!(sm.is_pause_requested());
        // Flag alone does not transition.
        assert_eq!(sm.state(), TimepointState::Acquiring);
    }

    #[test]
    fn test_request_pause_is_idempotent() {
        let sm = machine(5);
        assert!(sm.request_pause());
        assert!(sm.request_pause());
        assert!(sm.is_pause_requested());

        sm.complete_pause();
        // Both requests were satisfied by the single completion.
        assert!(!sm.is_pause_requested());
        assert_eq!(sm.state(), TimepointState::Paused);
    }

    #[test]
    fn test_request_pause_rejected_while_paused_or_retaking() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();
        assert!(!sm.request_pause());

        sm.retake(&[FovId::new("A", 0)]);
        assert!(!sm.request_pause());
    }

    #[test]
    fn test_complete_pause_without_request_fails() {
        let sm = machine(5);
        assert!(!sm.complete_pause());
        assert_eq!(sm.state(), TimepointState::Acquiring);
    }

    #[test]
    fn test_resume_with_fovs_remaining_returns_to_acquiring() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        assert!(sm.resume());
        assert_eq!(sm.state(), TimepointState::Acquiring);
        assert_eq!(sm.fovs_remaining(), 5);
    }

    #[test]
    fn test_resume_without_fovs_remaining_goes_to_captured() {
        let sm = machine(2);
        sm.mark_fov_captured();
        sm.mark_fov_captured();
        sm.request_pause();
        sm.complete_pause();

        assert_eq!(sm.fovs_remaining(), 0);
        assert!(sm.resume());
        assert_eq!(sm.state(), TimepointState::Captured);
    }

    #[test]
    fn test_resume_not_from_paused_fails() {
        let sm = machine(5);
        assert!(!sm.resume());
    }

    #[test]
    fn test_wait_for_pause_sees_request() {
        let sm = machine(5);
        assert!(!sm.wait_for_pause(Some(Duration::from_millis(10))));

        sm.request_pause();
        assert!(sm.wait_for_pause(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wait_for_resume_unblocks_on_resume() {
        let sm = std::sync::Arc::new(machine(5));
        sm.request_pause();
        sm.complete_pause();

        let waiter = {
            let sm = sm.clone();
            thread::spawn(move || sm.wait_for_resume(Some(Duration::from_secs(2))))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(sm.resume());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_for_resume_times_out() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        assert!(!sm.wait_for_resume(Some(Duration::from_millis(20))));
        assert_eq!(sm.state(), TimepointState::Paused);
    }

    // --- Retake ---

    #[test]
    fn test_retake_from_paused() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        let fovs = [FovId::new("A1", 0), FovId::new("A1", 1)];
        assert!(sm.retake(&fovs));
        assert_eq!(sm.state(), TimepointState::Retaking);
        assert_eq!(sm.get_retake_list(), fovs.to_vec());
    }

    #[test]
    fn test_retake_not_from_paused_fails() {
        let sm = machine(5);
        assert!(!sm.retake(&[FovId::new("A1", 0)]));
        assert_eq!(sm.state(), TimepointState::Acquiring);
    }

    #[test]
    fn test_retake_empty_list_fails() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        assert!(!sm.retake(&[]));
        assert_eq!(sm.state(), TimepointState::Paused);
    }

    #[test]
    fn test_retake_signals_waiting_worker() {
        let sm = std::sync::Arc::new(machine(5));
        sm.request_pause();
        sm.complete_pause();

        let waiter = {
            let sm = sm.clone();
            thread::spawn(move || sm.wait_for_resume(Some(Duration::from_secs(2))))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(sm.retake(&[FovId::new("A", 0)]));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_complete_retakes_returns_to_paused() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();
        sm.retake(&[FovId::new("A1", 0)]);

        assert!(sm.complete_retakes());
        assert_eq!(sm.state(), TimepointState::Paused);
        assert!(sm.get_retake_list().is_empty());
    }

    #[test]
    fn test_complete_retakes_not_from_retaking_fails() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        assert!(!sm.complete_retakes());
    }

    #[test]
    fn test_retakes_do_not_restore_fov_count() {
        let sm = machine(3);
        for _ in 0..3 {
            sm.mark_fov_captured();
        }
        sm.request_pause();
        sm.complete_pause();
        sm.retake(&[FovId::new("A", 1)]);
        sm.complete_retakes();

        assert_eq!(sm.fovs_remaining(), 0);
    }

    // --- FOV tracking ---

    #[test]
    fn test_mark_fov_captured_decrements() {
        let sm = machine(5);
        sm.mark_fov_captured();
        assert_eq!(sm.fovs_remaining(), 4);
        sm.mark_fov_captured();
        assert_eq!(sm.fovs_remaining(), 3);
    }

    #[test]
    fn test_mark_fov_captured_saturates_at_zero() {
        let sm = machine(1);
        sm.mark_fov_captured();
        sm.mark_fov_captured();
        assert_eq!(sm.fovs_remaining(), 0);
    }

    #[test]
    fn test_mark_all_captured() {
        let sm = machine(5);
        assert!(sm.mark_all_captured());
        assert_eq!(sm.state(), TimepointState::Captured);
    }

    #[test]
    fn test_mark_all_captured_not_from_acquiring_fails() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();
        assert!(!sm.mark_all_captured());
        assert_eq!(sm.state(), TimepointState::Paused);
    }

    #[test]
    fn test_pause_from_captured() {
        let sm = machine(1);
        sm.mark_fov_captured();
        sm.mark_all_captured();

        assert!(sm.request_pause());
        assert!(sm.complete_pause());
        assert_eq!(sm.state(), TimepointState::Paused);
    }

    // --- Abort ---

    #[test]
    fn test_abort_from_retaking_returns_to_paused() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();
        sm.retake(&[FovId::new("A1", 0)]);

        let (accepted, abort_all) = sm.abort();
        assert!(accepted);
        assert!(!abort_all);
        assert_eq!(sm.state(), TimepointState::Paused);
        assert!(sm.get_retake_list().is_empty());
    }

    #[test]
    fn test_abort_from_acquiring_aborts_all() {
        let sm = machine(5);
        let (accepted, abort_all) = sm.abort();
        assert!(accepted);
        assert!(abort_all);
        assert_eq!(sm.state(), TimepointState::Acquiring);
    }

    #[test]
    fn test_abort_from_paused_aborts_all() {
        let sm = machine(5);
        sm.request_pause();
        sm.complete_pause();

        let (accepted, abort_all) = sm.abort();
        assert!(accepted);
        assert!(abort_all);
    }

    // --- Events ---

    #[test]
    fn test_transitions_reach_observers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let sm = TimepointStateMachine::new(2, bus);

        sm.request_pause();
        sm.complete_pause();
        sm.resume();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events[0], AcquisitionEvent::PauseRequested));
        assert!(matches!(
            events[1],
            AcquisitionEvent::StateChanged {
                old: TimepointState::Acquiring,
                new: TimepointState::Paused,
            }
        ));
        assert!(matches!(events[2], AcquisitionEvent::Paused));
        assert!(matches!(
            events[3],
            AcquisitionEvent::StateChanged {
                old: TimepointState::Paused,
                new: TimepointState::Acquiring,
            }
        ));
        assert!(matches!(events[4], AcquisitionEvent::Resumed));
    }

    #[test]
    fn test_rejected_operations_emit_nothing() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let sm = TimepointStateMachine::new(2, bus);

        assert!(!sm.resume());
        assert!(!sm.complete_retakes());
        assert!(!sm.complete_pause());
        assert_eq!(rx.try_iter().count(), 0);
    }

    // --- Thread safety ---

    #[test]
    fn test_concurrent_pause_requests() {
        let sm = std::sync::Arc::new(machine(100));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let sm = sm.clone();
                thread::spawn(move || sm.request_pause())
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().any(|&accepted| accepted));
        assert!(sm.is_pause_requested());
    }

    #[test]
    fn test_concurrent_fov_marking() {
        let sm = std::sync::Arc::new(machine(100));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let sm = sm.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        sm.mark_fov_captured();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sm.fovs_remaining(), 0);
    }
}
