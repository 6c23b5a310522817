//! Acquisition worker: the per-FOV loop.
//!
//! The worker owns the hardware handle and is the only code that touches
//! it. Per timepoint it creates a fresh state machine and metrics store,
//! iterates planned FOVs in deterministic order (region ascending, then
//! index ascending), dispatches save and QC jobs for every captured
//! frame, folds job results back into the store, and evaluates the QC
//! policy at timepoint end.
//!
//! Blocking happens at exactly three points: waiting for resume while
//! paused, draining the job runner, and the hardware calls themselves.
//! Abort is cooperative: a flag observed at each FOV and retake
//! iteration; in-flight hardware operations finish first.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acq_core::config::AcquisitionSettings;
use acq_core::error::{AcqError, AcqResult};
use acq_core::{
    AcquisitionEvent, CaptureInfo, EventBus, FovId, FovMetrics, PolicyDecision,
    ProgressionPolicy, TimepointState,
};
use acq_hardware::MicroscopeHardware;
use acq_qc::{QcPolicy, TimepointMetricsStore};
use acq_runner::{Job, JobResult, JobRunner, RunnerConfig};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::AcquisitionContext;
use crate::controller::{AcquisitionController, MachineSlot, ProceedLatch};
use crate::state_machine::TimepointStateMachine;

/// How often the paused/gated worker re-checks the abort flag.
const HOLD_POLL: Duration = Duration::from_millis(100);

/// One planned capture site.
#[derive(Debug, Clone)]
pub struct PlannedFov {
    pub fov: FovId,
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
}

/// The immutable plan for a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub fovs: Vec<PlannedFov>,
    /// Channels captured per FOV; QC runs on the first one.
    pub channels: Vec<String>,
    pub total_timepoints: usize,
    pub experiment_path: PathBuf,
}

impl RunPlan {
    fn validate(&self) -> AcqResult<()> {
        if self.fovs.is_empty() {
            return Err(AcqError::Configuration("plan has no FOVs".into()));
        }
        if self.channels.is_empty() {
            return Err(AcqError::Configuration("plan has no channels".into()));
        }

        let mut ids: Vec<&FovId> = self.fovs.iter().map(|p| &p.fov).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.fovs.len() {
            return Err(AcqError::Configuration(
                "plan contains duplicate FOV identifiers".into(),
            ));
        }
        Ok(())
    }
}

/// Per-timepoint entry of the `qc_summary.json` roll-up.
#[derive(Debug, Serialize)]
struct TimepointSummary {
    timepoint: usize,
    should_pause: bool,
    flagged: Vec<FlaggedFov>,
}

#[derive(Debug, Serialize)]
struct FlaggedFov {
    fov: FovId,
    reasons: Vec<String>,
}

impl TimepointSummary {
    fn from_decision(timepoint: usize, decision: &PolicyDecision) -> Self {
        Self {
            timepoint,
            should_pause: decision.should_pause,
            flagged: decision
                .flagged
                .iter()
                .map(|fov| FlaggedFov {
                    fov: fov.clone(),
                    reasons: decision.reasons.get(fov).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    timepoints: &'a [TimepointSummary],
}

/// Outcome of holding while the machine sits in `Paused`/`Retaking`.
enum HoldOutcome {
    /// Resumed with FOVs remaining: continue the FOV loop.
    Acquiring,
    /// Resumed with nothing left (or after review): the timepoint is done.
    Captured,
    /// The whole run was aborted while holding.
    Aborted,
}

/// Drives one acquisition run end to end.
pub struct AcquisitionWorker<H: MicroscopeHardware> {
    hardware: H,
    settings: AcquisitionSettings,
    plan: RunPlan,
    runner: JobRunner,
    policy: QcPolicy,
    events: EventBus,
    context: Arc<AcquisitionContext>,
    machine_slot: MachineSlot,
    proceed: Arc<ProceedLatch>,
    /// Absolute Z per FOV at the previous timepoint, for the z-diff metric.
    prev_z_um: HashMap<FovId, f64>,
    summary: Vec<TimepointSummary>,
    last_decision: Option<PolicyDecision>,
}

impl<H: MicroscopeHardware> AcquisitionWorker<H> {
    /// Validate settings and plan and assemble a worker.
    ///
    /// The plan's FOVs are sorted into capture order here; the order never
    /// changes afterwards.
    pub fn new(hardware: H, settings: AcquisitionSettings, mut plan: RunPlan) -> AcqResult<Self> {
        settings.validate()?;
        plan.validate()?;
        plan.fovs.sort_by(|a, b| a.fov.cmp(&b.fov));

        let context = Arc::new(AcquisitionContext::new(
            plan.total_timepoints,
            settings.progression_policy,
        )?);
        let policy = QcPolicy::new(settings.policy.clone());

        Ok(Self {
            hardware,
            runner: JobRunner::new(RunnerConfig::default()),
            policy,
            events: EventBus::new(),
            context,
            machine_slot: Arc::new(Mutex::new(None)),
            proceed: Arc::new(ProceedLatch::default()),
            prev_z_um: HashMap::new(),
            summary: Vec::new(),
            last_decision: None,
            settings,
            plan,
        })
    }

    /// Replace the job runner configuration (before `run`).
    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner = JobRunner::new(config);
        self
    }

    /// Share an externally created event bus (before `run`).
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Control-plane handle for other threads.
    pub fn controller(&self) -> AcquisitionController {
        AcquisitionController::new(
            self.context.clone(),
            self.machine_slot.clone(),
            self.proceed.clone(),
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Total background jobs dispatched so far.
    pub fn dispatched_jobs(&self) -> u64 {
        self.runner.dispatched_jobs()
    }

    /// Run every timepoint to completion or abort.
    ///
    /// Hardware and save-job failures are fatal: the run aborts cleanly
    /// (jobs drained, current store saved, final event emitted) and the
    /// error is returned.
    pub fn run(&mut self) -> AcqResult<()> {
        info!(
            timepoints = self.plan.total_timepoints,
            fovs = self.plan.fovs.len(),
            channels = self.plan.channels.len(),
            policy = %self.settings.progression_policy,
            "starting acquisition run"
        );

        let result = self.run_timepoints();

        if let Err(e) = &result {
            error!(error = %e, "acquisition run failed, aborting");
            self.context.request_abort();
        }
        self.runner.shutdown();
        if let Err(e) = self.write_summary() {
            warn!(error = %e, "failed to write qc_summary.json");
        }
        *self.machine_slot.lock() = None;
        self.events.emit(AcquisitionEvent::RunStopped {
            aborted: self.context.is_aborted(),
        });

        result
    }

    fn run_timepoints(&mut self) -> AcqResult<()> {
        while self.context.should_continue() {
            let t = self.context.current_timepoint();
            self.run_timepoint(t)?;
            if self.context.is_aborted() {
                break;
            }
            self.context.advance();
        }
        Ok(())
    }

    fn run_timepoint(&mut self, t: usize) -> AcqResult<()> {
        let tp_dir = self.plan.experiment_path.join(format!("{:03}", t));
        std::fs::create_dir_all(tp_dir.join("images"))?;

        let sm = Arc::new(TimepointStateMachine::new(
            self.plan.fovs.len(),
            self.events.clone(),
        ));
        *self.machine_slot.lock() = Some(sm.clone());
        let store = TimepointMetricsStore::new(t);
        info!(timepoint = t, fovs = self.plan.fovs.len(), "timepoint started");

        // Drain and flush even on the failure path so no job is orphaned
        // and the partial store still reaches disk.
        let loop_result = self.fov_loop(t, &sm, &store, &tp_dir);
        self.runner.drain();
        let flush_result = self.flush_results(&store);

        let csv_path = tp_dir.join("qc_metrics.csv");
        if let Err(e) = loop_result.and(flush_result) {
            if let Err(save_err) = store.save(&csv_path) {
                warn!(error = %save_err, "failed to save metrics store after fatal error");
            }
            return Err(e);
        }

        if self.context.is_aborted() {
            store.save(&csv_path)?;
            return Ok(());
        }

        // End-of-timepoint policy evaluation.
        let decision = self.evaluate_policy(t, &store);
        if decision.should_pause {
            info!(
                timepoint = t,
                flagged = decision.flagged.len(),
                "policy requested pause"
            );
            sm.request_pause();
            if sm.complete_pause() {
                if let HoldOutcome::Aborted = self.paused_hold(t, &sm, &store, &tp_dir)? {
                    store.save(&csv_path)?;
                    return Ok(());
                }
            }
        } else {
            sm.mark_all_captured();
        }

        self.events
            .emit(AcquisitionEvent::TimepointCaptured { timepoint: t });
        store.save(&csv_path)?;

        self.progression_gate(t, &sm, &store, &tp_dir)?;

        self.record_prev_z(&store);
        info!(timepoint = t, metrics = store.len(), "timepoint finished");
        Ok(())
    }

    /// Iterate planned FOVs, honoring abort and graceful pause between
    /// captures.
    fn fov_loop(
        &mut self,
        t: usize,
        sm: &Arc<TimepointStateMachine>,
        store: &TimepointMetricsStore,
        tp_dir: &Path,
    ) -> AcqResult<()> {
        let planned = self.plan.fovs.clone();
        for p in &planned {
            if self.context.is_aborted() {
                info!(timepoint = t, "abort requested, leaving FOV loop");
                return Ok(());
            }

            if sm.is_pause_requested() {
                // Finish in-flight work before the transition so no job
                // is orphaned while paused.
                self.runner.drain();
                self.flush_results(store)?;
                if sm.complete_pause() {
                    match self.paused_hold(t, sm, store, tp_dir)? {
                        HoldOutcome::Acquiring => {}
                        HoldOutcome::Captured | HoldOutcome::Aborted => return Ok(()),
                    }
                }
            }

            self.capture_fov(t, p, tp_dir)?;
            sm.mark_fov_captured();
            self.events.emit(AcquisitionEvent::FovCaptured {
                fov: p.fov.clone(),
            });
            self.flush_results(store)?;
        }
        Ok(())
    }

    /// Move to a FOV and capture every configured channel, dispatching
    /// the save job (and QC job for the first channel) per frame.
    fn capture_fov(&mut self, t: usize, p: &PlannedFov, tp_dir: &Path) -> AcqResult<()> {
        self.hardware.move_to(p.x_mm, p.y_mm, p.z_mm)?;

        let channels = self.plan.channels.clone();
        for (i, channel) in channels.iter().enumerate() {
            self.hardware.set_channel(channel)?;
            let frame = self.hardware.trigger_capture()?;
            let piezo_z_um = self.hardware.piezo_z_um()?;
            let stage_z_mm =
                (self.hardware.current_z_um()? - piezo_z_um.unwrap_or(0.0)) / 1000.0;

            let info = CaptureInfo {
                fov: p.fov.clone(),
                timepoint: t,
                timestamp: Utc::now(),
                stage_x_mm: p.x_mm,
                stage_y_mm: p.y_mm,
                stage_z_mm,
                piezo_z_um,
                channel: channel.clone(),
            };

            let image = Arc::new(frame);
            let path = tp_dir.join("images").join(format!(
                "{}_{}_{}.tiff",
                p.fov.region_id, p.fov.fov_index, channel
            ));

            // Save dispatched before QC so the on-disk artifact exists
            // before any metrics consumer hears about this FOV.
            self.runner.dispatch(Job::SaveImage {
                image: Arc::clone(&image),
                info: info.clone(),
                path,
            })?;

            if self.settings.qc.enabled && i == 0 {
                self.runner.dispatch(Job::QcMetrics {
                    image: Arc::clone(&image),
                    info,
                    qc: self.settings.qc.clone(),
                    prev_z_um: self.prev_z_um.get(&p.fov).copied(),
                })?;
            }
            // The loop keeps no frame reference past dispatch.
            drop(image);
        }
        Ok(())
    }

    /// Hold while the machine is paused, running retake sessions as they
    /// are requested.
    fn paused_hold(
        &mut self,
        t: usize,
        sm: &Arc<TimepointStateMachine>,
        store: &TimepointMetricsStore,
        tp_dir: &Path,
    ) -> AcqResult<HoldOutcome> {
        loop {
            if self.context.is_aborted() {
                return Ok(HoldOutcome::Aborted);
            }
            match sm.state() {
                TimepointState::Paused => {
                    sm.wait_for_resume(Some(HOLD_POLL));
                }
                TimepointState::Retaking => self.run_retakes(t, sm, store, tp_dir)?,
                TimepointState::Acquiring => return Ok(HoldOutcome::Acquiring),
                TimepointState::Captured => return Ok(HoldOutcome::Captured),
            }
        }
    }

    /// Re-capture the FOVs in the retake list, overwriting prior outputs.
    fn run_retakes(
        &mut self,
        t: usize,
        sm: &Arc<TimepointStateMachine>,
        store: &TimepointMetricsStore,
        tp_dir: &Path,
    ) -> AcqResult<()> {
        let list = sm.get_retake_list();
        info!(timepoint = t, count = list.len(), "starting retakes");

        for fov in list {
            if self.context.is_aborted() {
                return Ok(());
            }
            if sm.state() != TimepointState::Retaking {
                // Abort-from-retaking: the machine is already back in
                // Paused with the list cleared.
                info!(timepoint = t, "retake session aborted");
                return Ok(());
            }

            let Some(p) = self.plan.fovs.iter().find(|p| p.fov == fov).cloned() else {
                warn!(fov = %fov, "retake requested for unplanned FOV, skipping");
                continue;
            };

            self.capture_fov(t, &p, tp_dir)?;
            self.events
                .emit(AcquisitionEvent::RetakeFovComplete { fov });
            self.flush_results(store)?;
        }

        if sm.state() == TimepointState::Retaking {
            self.runner.drain();
            self.flush_results(store)?;
            sm.complete_retakes();
        }
        Ok(())
    }

    /// Poll completed jobs: save failures are fatal, QC results feed the
    /// store and notify observers.
    fn flush_results(&mut self, store: &TimepointMetricsStore) -> AcqResult<()> {
        let mut first_error: Option<AcqError> = None;

        for result in self.runner.poll_results() {
            match result {
                JobResult::SaveImage { fov, path, outcome } => match outcome {
                    Ok(()) => debug!(fov = %fov, path = %path.display(), "save complete"),
                    Err(e) => {
                        error!(fov = %fov, error = %e, "image save failed");
                        first_error.get_or_insert(e.into());
                    }
                },
                JobResult::Qc { fov, outcome } => {
                    let metrics = outcome.unwrap_or_else(|e| {
                        FovMetrics::with_error(fov.clone(), Utc::now(), 0.0, e.to_string())
                    });
                    store.add(metrics.clone());
                    self.events
                        .emit(AcquisitionEvent::MetricsUpdated { metrics });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn evaluate_policy(&mut self, t: usize, store: &TimepointMetricsStore) -> PolicyDecision {
        let decision = self.policy.check_timepoint(store);
        self.events.emit(AcquisitionEvent::QcPolicyDecision {
            decision: decision.clone(),
        });

        let entry = TimepointSummary::from_decision(t, &decision);
        if let Some(existing) = self.summary.iter_mut().find(|s| s.timepoint == t) {
            *existing = entry;
        } else {
            self.summary.push(entry);
        }

        self.last_decision = Some(decision.clone());
        decision
    }

    /// Wait at the timepoint boundary according to the progression
    /// policy, servicing pause/retake requests while waiting.
    fn progression_gate(
        &mut self,
        t: usize,
        sm: &Arc<TimepointStateMachine>,
        store: &TimepointMetricsStore,
        tp_dir: &Path,
    ) -> AcqResult<()> {
        let mode = self.settings.progression_policy;
        if mode == ProgressionPolicy::Auto {
            return Ok(());
        }

        info!(timepoint = t, policy = %mode, "waiting for proceed");
        loop {
            if self.context.is_aborted() {
                return Ok(());
            }

            if sm.is_pause_requested() && sm.complete_pause() {
                match self.paused_hold(t, sm, store, tp_dir)? {
                    HoldOutcome::Aborted => return Ok(()),
                    _ => {
                        // Retakes may have replaced records; refresh the
                        // on-disk snapshot and, under QC gating, the
                        // decision itself.
                        store.save(tp_dir.join("qc_metrics.csv"))?;
                        if mode == ProgressionPolicy::QcGated {
                            self.evaluate_policy(t, store);
                        }
                    }
                }
            }

            if self.proceed.wait_timeout(HOLD_POLL) {
                if mode == ProgressionPolicy::QcGated {
                    let blocked = self
                        .last_decision
                        .as_ref()
                        .is_some_and(|d| d.should_pause);
                    if blocked {
                        warn!(
                            timepoint = t,
                            "proceed ignored: QC gate requires a clean policy decision"
                        );
                        continue;
                    }
                }
                return Ok(());
            }
        }
    }

    fn record_prev_z(&mut self, store: &TimepointMetricsStore) {
        for m in store.get_all() {
            self.prev_z_um.insert(m.fov.clone(), m.z_position_um);
        }
    }

    fn write_summary(&self) -> AcqResult<()> {
        if self.summary.is_empty() {
            return Ok(());
        }
        let path = self.plan.experiment_path.join("qc_summary.json");
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(
            BufWriter::new(file),
            &RunSummary {
                timepoints: &self.summary,
            },
        )
        .map_err(|e| AcqError::Processing(format!("summary serialization failed: {}", e)))?;
        debug!(path = %path.display(), "qc summary written");
        Ok(())
    }
}
