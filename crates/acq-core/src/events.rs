//! Observer event stream.
//!
//! The worker, the state machine and the metrics path all report progress
//! through an [`EventBus`]: a fan-out of unbounded channels where `emit`
//! is best-effort and never blocks the emitter. Subscribers that go away
//! are pruned on the next emit.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fov::FovId;
use crate::metrics::{FovMetrics, PolicyDecision};
use crate::state::TimepointState;

/// One notification from the acquisition stack.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A state-machine transition completed.
    StateChanged {
        old: TimepointState,
        new: TimepointState,
    },
    /// A pause was requested (the transition happens later, at a safe point).
    PauseRequested,
    /// The machine entered `Paused`.
    Paused,
    /// The machine left `Paused` via resume.
    Resumed,
    /// A retake session started for the listed FOVs.
    RetakeStarted { fovs: Vec<FovId> },
    /// One FOV of the current retake session finished re-capturing.
    RetakeFovComplete { fov: FovId },
    /// The retake session finished and the machine returned to `Paused`.
    RetakesComplete,
    /// One FOV finished its hardware capture and job dispatch.
    FovCaptured { fov: FovId },
    /// A timepoint reached `Captured`.
    TimepointCaptured { timepoint: usize },
    /// QC metrics for one FOV were folded into the store.
    MetricsUpdated { metrics: FovMetrics },
    /// The QC policy was evaluated over a timepoint's store.
    QcPolicyDecision { decision: PolicyDecision },
    /// The run finished, cleanly or not.
    RunStopped { aborted: bool },
}

/// Best-effort event fan-out.
///
/// Cloning the bus shares the subscriber list, so components constructed
/// with a clone all feed the same observers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<AcquisitionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer and return its receiving end.
    pub fn subscribe(&self) -> Receiver<AcquisitionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber. Never blocks; dead
    /// subscribers are dropped.
    pub fn emit(&self, event: AcquisitionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.emit(AcquisitionEvent::TimepointCaptured { timepoint: 3 });

        for rx in [&rx1, &rx2] {
            match rx.try_recv() {
                Ok(AcquisitionEvent::TimepointCaptured { timepoint }) => {
                    assert_eq!(timepoint, 3)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_dead_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.emit(AcquisitionEvent::PauseRequested);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(AcquisitionEvent::Resumed);
    }

    #[test]
    fn test_cloned_bus_shares_subscribers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        let clone = bus.clone();
        clone.emit(AcquisitionEvent::RetakesComplete);

        assert!(matches!(
            rx.try_recv(),
            Ok(AcquisitionEvent::RetakesComplete)
        ));
    }
}
