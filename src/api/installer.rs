// Installer orchestration
//
// Phase state machine:
//   Init -> PreflightChecks -> ConfigurePhase -> InstallPhase -> CleanupPhase
//        -> SummaryPhase -> Done
// with Fatal reachable from Init and PreflightChecks only. A failed step never aborts its phase;
// cancellation stops at the next step or retry boundary and still produces a summary. A paused
// run holds at the same boundaries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::preflight::{run_preflight, HostChecks, SystemHost};
use crate::engine::ledger::ResultLedger;
use crate::engine::policy::{execute_step, PolicyConfig, StepResolution};
use crate::engine::registry;
use crate::engine::summary::{Summary, SummaryInput};
use crate::engine::tracker::{CheckpointStore, ProgressTracker};
use crate::engine::CancelToken;
use crate::installation::BackendSet;
use crate::models::outcome::{LedgerEntry, StepStatus};
use crate::models::responses::{ProgressPayload, RunArtifacts, RunReport, RunStatus};
use crate::models::step::{Phase, Step};
use crate::settings::Settings;
use crate::utils::os_detection::{detect_distro, is_debian_family};
use crate::utils::path_resolver::{
    checkpoint_path, resolve_download_folder, resolve_log_folder, resolve_state_dir,
};

static INSTALL_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub const CANCELLED_REASON: &str = "Cancelled by user";
const RESUMED_REASON: &str = "Completed in an earlier run (resumed from checkpoint)";

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    PreflightChecks,
    ConfigurePhase,
    InstallPhase,
    CleanupPhase,
    SummaryPhase,
    Done,
    Fatal,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::PreflightChecks => "preflight",
            RunPhase::ConfigurePhase => "configure",
            RunPhase::InstallPhase => "install",
            RunPhase::CleanupPhase => "cleanup",
            RunPhase::SummaryPhase => "summary",
            RunPhase::Done => "done",
            RunPhase::Fatal => "fatal",
        }
    }

    fn for_step_phase(phase: Phase) -> Self {
        match phase {
            Phase::Configure => RunPhase::ConfigurePhase,
            Phase::Install => RunPhase::InstallPhase,
            Phase::Cleanup => RunPhase::CleanupPhase,
        }
    }
}

/// Where a run keeps its state.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub log_dir: PathBuf,
    pub checkpoint: PathBuf,
}

impl RunPaths {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let state_dir = resolve_state_dir(settings.paths.state_dir.as_deref());
        let log_dir = resolve_log_folder(&state_dir, settings.paths.log_dir.as_deref())?;
        Ok(Self {
            log_dir,
            checkpoint: checkpoint_path(&state_dir),
        })
    }
}

pub struct Orchestrator {
    settings: Settings,
    steps: Option<Vec<Step>>,
    backends: BackendSet,
    host: Arc<dyn HostChecks>,
    paths: RunPaths,
    fresh: bool,
    emit: ProgressEmitter,
    cancel: CancelToken,
    correlation_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

struct Progress {
    current: usize,
    total: usize,
    percent: i32,
}

impl Progress {
    fn none() -> Self {
        Self {
            current: 0,
            total: 0,
            percent: 0,
        }
    }

    fn of(tracker: &ProgressTracker) -> Self {
        let (current, total, percent) = tracker.current_progress();
        Self {
            current,
            total,
            percent,
        }
    }
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        backends: BackendSet,
        host: Arc<dyn HostChecks>,
        paths: RunPaths,
    ) -> Self {
        Self {
            settings,
            steps: None,
            backends,
            host,
            paths,
            fresh: false,
            emit: Arc::new(|_: ProgressPayload| {}),
            cancel: CancelToken::new(),
            correlation_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Real backends and host checks, paths resolved from settings.
    pub fn for_host(settings: Settings) -> Result<Self> {
        let paths = RunPaths::from_settings(&settings)?;
        let state_dir = resolve_state_dir(settings.paths.state_dir.as_deref());
        let download_dir =
            resolve_download_folder(&state_dir, settings.paths.download_dir.as_deref());
        let backends = BackendSet::system(&settings, download_dir)
            .context("Failed to initialise installation backends")?;
        let host = Arc::new(SystemHost::new(std::time::Duration::from_secs(
            settings.preflight.connectivity_timeout_secs.max(1),
        )));
        Ok(Self::new(settings, backends, host, paths))
    }

    /// Run an explicit step list instead of the configured catalog.
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn on_progress(mut self, emit: ProgressEmitter) -> Self {
        self.emit = emit;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, phase: RunPhase, step: &str, severity: &str, message: String, p: Progress) {
        (self.emit)(ProgressPayload {
            correlation_id: self.correlation_id.clone(),
            step: step.to_string(),
            severity: severity.to_string(),
            phase: phase.as_str().to_string(),
            current_step: p.current,
            total_steps: p.total,
            percent: p.percent,
            message,
            elapsed_ms: Some(self.started.elapsed().as_millis()),
        });
    }

    fn fatal_report(&self, run_id: String, reason: String) -> RunReport {
        error!(
            "[PHASE: fatal] [STEP: abort] Run aborted before any step (run_id={}): {}",
            run_id, reason
        );
        self.emit(
            RunPhase::Fatal,
            "abort",
            "error",
            reason.clone(),
            Progress::none(),
        );
        RunReport {
            run_id,
            status: RunStatus::Fatal,
            fatal_reason: Some(reason),
            success_count: 0,
            failure_count: 0,
            entries: Vec::new(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            artifacts: RunArtifacts {
                log_folder: Some(self.paths.log_dir.clone()),
                checkpoint: Some(self.paths.checkpoint.clone()),
                ..RunArtifacts::default()
            },
        }
    }

    /// Hold at a step boundary while the run is paused.
    async fn wait_if_paused(&self, run_phase: RunPhase, tracker: &ProgressTracker) {
        if !self.cancel.is_paused() {
            return;
        }
        info!("[PHASE: {}] [STEP: pause] Paused", run_phase.as_str());
        let message = "Paused; waiting to resume...".to_string();
        self.emit(run_phase, "pause", "info", message, Progress::of(tracker));
        self.cancel.wait_while_paused().await;
        if !self.cancel.is_cancelled() {
            info!("[PHASE: {}] [STEP: pause] Resumed", run_phase.as_str());
            let message = "Resumed".to_string();
            self.emit(run_phase, "pause", "info", message, Progress::of(tracker));
        }
    }

    pub async fn run(mut self) -> RunReport {
        self.started = Instant::now();
        self.started_at = Utc::now();
        let new_run_id = Uuid::new_v4().to_string();

        // Init
        info!(
            "[PHASE: init] [STEP: start] Run starting (correlation_id={}, fresh={})",
            self.correlation_id, self.fresh
        );
        let message = "Preparing installation...".to_string();
        self.emit(RunPhase::Init, "start", "info", message, Progress::none());

        let distro = detect_distro();
        match &distro {
            Some(d) if !is_debian_family(d) => warn!(
                "[PHASE: init] [STEP: os] Not a Debian-family system; apt-based steps will likely fail (distro={})",
                d.pretty_name
            ),
            Some(d) => info!("[PHASE: init] [STEP: os] Detected {}", d.pretty_name),
            None => warn!("[PHASE: init] [STEP: os] Could not read /etc/os-release"),
        }

        let steps = match &self.steps {
            Some(steps) => registry::validate(steps).map(|_| steps.clone()),
            None => registry::build(&self.settings),
        };
        let steps = match steps {
            Ok(s) => s,
            Err(e) => {
                let reason = format!("Invalid step registry: {}", e);
                return self.fatal_report(new_run_id, reason);
            }
        };

        let store = CheckpointStore::new(self.paths.checkpoint.clone());
        let opened = ProgressTracker::open(store.clone(), new_run_id.clone(), &steps, self.fresh);
        let mut tracker = match opened.await {
            Ok(t) => t,
            Err(e) => {
                let reason = format!("Cannot read checkpoint: {}", e);
                return self.fatal_report(new_run_id, reason);
            }
        };
        let run_id = tracker.run_id().to_string();
        let (base_ok, base_fail) = tracker.baseline();
        let mut ledger = ResultLedger::with_baseline(base_ok, base_fail);

        // Preflight
        let message = "Checking network and privileges...".to_string();
        self.emit(
            RunPhase::PreflightChecks,
            "preflight",
            "info",
            message,
            Progress::of(&tracker),
        );
        if let Err(e) = run_preflight(self.host.as_ref(), &self.settings.preflight).await {
            return self.fatal_report(run_id, e.to_string());
        }
        // --fresh only drops the old checkpoint once the run is known to go ahead
        if let Err(e) = tracker.discard_previous().await {
            error!(
                "[PHASE: preflight] [STEP: checkpoint] Failed to reset checkpoint: {}",
                e
            );
        }

        // Configure / Install / Cleanup
        let policy = PolicyConfig::from(&self.settings);
        let mut cancelled = false;

        'phases: for phase in [Phase::Configure, Phase::Install, Phase::Cleanup] {
            let run_phase = RunPhase::for_step_phase(phase);
            let phase_started = Instant::now();
            info!("[PHASE: {}] [STEP: begin] Phase started", phase);
            let message = format!("Starting {} phase", phase);
            self.emit(run_phase, "begin", "info", message, Progress::of(&tracker));

            for (index, step) in steps.iter().enumerate().filter(|(_, s)| s.phase == phase) {
                self.wait_if_paused(run_phase, &tracker).await;
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'phases;
                }

                if tracker.is_completed(index) {
                    let message = match tracker.carried_failure(&step.id) {
                        Some(reason) => {
                            info!(
                                "[PHASE: {}] [STEP: {}] Failed before resume, not retrying: {}",
                                phase, step.id, reason
                            );
                            let entry = LedgerEntry {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                                phase,
                                status: StepStatus::Failed,
                                reason: Some(reason.to_string()),
                                backend_used: None,
                                attempts: 0,
                                duration_ms: 0,
                            };
                            if let Err(e) = ledger.record_carried_failure(entry) {
                                error!("[PHASE: {}] [STEP: ledger] {}", phase, e);
                            }
                            format!("{} failed in the interrupted run", step.description)
                        }
                        None => {
                            info!(
                                "[PHASE: {}] [STEP: {}] Skipping, already completed before resume",
                                phase, step.id
                            );
                            let entry = LedgerEntry {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                                phase,
                                status: StepStatus::Skipped,
                                reason: Some(RESUMED_REASON.to_string()),
                                backend_used: None,
                                attempts: 0,
                                duration_ms: 0,
                            };
                            record(&mut ledger, entry);
                            format!("Skipped {} (already done)", step.description)
                        }
                    };
                    tracker.record_step_skipped(index);
                    self.emit(run_phase, &step.id, "info", message, Progress::of(&tracker));
                    continue;
                }

                tracker.record_step_start(index);
                let message = format!("Installing {}...", step.description);
                self.emit(run_phase, &step.id, "info", message, Progress::of(&tracker));
                let step_started = Instant::now();

                let resolution = execute_step(step, &self.backends, &policy, &self.cancel).await;
                let duration_ms = step_started.elapsed().as_millis() as u64;
                let attempts = resolution.invocation_count();

                let (entry, severity, message) = match resolution {
                    StepResolution::Succeeded {
                        backend,
                        attempt_number,
                        ..
                    } => {
                        info!(
                            "[PHASE: {}] [STEP: {}] [SUCCESS] {} installed (backend={}, attempt={}, duration_ms={})",
                            phase, step.id, step.description, backend, attempt_number, duration_ms
                        );
                        (
                            LedgerEntry {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                                phase,
                                status: StepStatus::Success,
                                reason: None,
                                backend_used: Some(backend),
                                attempts,
                                duration_ms,
                            },
                            "info",
                            format!("{} done (via {})", step.description, backend),
                        )
                    }
                    StepResolution::Failed { reason, .. } => {
                        error!(
                            "[PHASE: {}] [STEP: {}] {} failed (attempts={}, duration_ms={}): {}",
                            phase, step.id, step.description, attempts, duration_ms, reason
                        );
                        (
                            LedgerEntry {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                                phase,
                                status: StepStatus::Failed,
                                reason: Some(reason.clone()),
                                backend_used: None,
                                attempts,
                                duration_ms,
                            },
                            "error",
                            format!("{} failed: {}", step.description, reason),
                        )
                    }
                    StepResolution::Cancelled { attempts: tried } => {
                        cancelled = true;
                        if !tried.is_empty() {
                            warn!(
                                "[PHASE: {}] [STEP: {}] Cancelled mid-step (attempts={})",
                                phase, step.id, attempts
                            );
                            // checkpoint stays on the previous step; a resume retries this one
                            let entry = LedgerEntry {
                                step_id: step.id.clone(),
                                description: step.description.clone(),
                                phase,
                                status: StepStatus::Failed,
                                reason: Some(CANCELLED_REASON.to_string()),
                                backend_used: None,
                                attempts,
                                duration_ms,
                            };
                            record(&mut ledger, entry);
                        }
                        break 'phases;
                    }
                };

                record(&mut ledger, entry);
                if let Err(e) = tracker.record_step_outcome(index, &ledger).await {
                    error!(
                        "[PHASE: {}] [STEP: {}] Failed to persist checkpoint: {}",
                        phase, step.id, e
                    );
                }
                self.emit(
                    run_phase,
                    &step.id,
                    severity,
                    message,
                    Progress::of(&tracker),
                );
            }

            info!(
                "[PHASE: {}] [STEP: end] Phase finished (duration_ms={})",
                phase,
                phase_started.elapsed().as_millis()
            );
        }

        if cancelled {
            warn!(
                "[PHASE: install] [STEP: cancel] Run cancelled (attempted={}, recorded={})",
                ledger.attempted_count(),
                ledger.len()
            );
        }

        // Summary
        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let message = "Writing summary...".to_string();
        self.emit(
            RunPhase::SummaryPhase,
            "summary",
            "info",
            message,
            Progress::of(&tracker),
        );

        let finished_at = Utc::now();
        let summary = Summary::from_ledger(
            SummaryInput {
                run_id: &run_id,
                status,
                fatal_reason: None,
                system: distro.map(|d| d.pretty_name),
                total_steps: steps.len(),
                baseline: tracker.baseline(),
                options: self.settings.options_in_effect(),
                started_at: self.started_at,
                finished_at,
            },
            &ledger,
        );
        let mut artifacts = RunArtifacts {
            log_folder: Some(self.paths.log_dir.clone()),
            checkpoint: Some(self.paths.checkpoint.clone()),
            ..RunArtifacts::default()
        };
        match summary.write(&self.paths.log_dir).await {
            Ok((json, text)) => {
                artifacts.summary_json = Some(json);
                artifacts.summary_text = Some(text);
            }
            Err(e) => error!(
                "[PHASE: summary] [STEP: write] Failed to write summary: {:?}",
                e
            ),
        }

        // A finished run leaves nothing to resume.
        if status == RunStatus::Completed {
            if let Err(e) = store.reset().await {
                warn!(
                    "[PHASE: summary] [STEP: checkpoint] Failed to clear checkpoint: {}",
                    e
                );
            }
        }

        // Done
        let done_msg = format!(
            "Finished: {} succeeded, {} failed ({})",
            ledger.success_count(),
            ledger.failure_count(),
            status.as_str()
        );
        info!(
            "[PHASE: done] [STEP: end] {} (run_id={}, duration_ms={})",
            done_msg,
            run_id,
            self.started.elapsed().as_millis()
        );
        let severity = if ledger.failure_count() > 0 {
            "warn"
        } else {
            "info"
        };
        self.emit(
            RunPhase::Done,
            "end",
            severity,
            done_msg,
            Progress::of(&tracker),
        );

        RunReport {
            run_id,
            status,
            fatal_reason: None,
            success_count: ledger.success_count(),
            failure_count: ledger.failure_count(),
            entries: ledger.entries().to_vec(),
            started_at: self.started_at,
            finished_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            artifacts,
        }
    }
}

fn record(ledger: &mut ResultLedger, entry: LedgerEntry) {
    if let Err(e) = ledger.record_outcome(entry) {
        error!("[PHASE: install] [STEP: ledger] {}", e);
    }
}

fn try_begin_install_job() -> bool {
    INSTALL_IN_PROGRESS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

fn end_install_job() {
    INSTALL_IN_PROGRESS.store(false, Ordering::SeqCst);
}

/// A run executing on its own thread.
pub struct InstallHandle {
    pub cancel: CancelToken,
    thread: std::thread::JoinHandle<Result<RunReport>>,
}

impl InstallHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn join(self) -> Result<RunReport> {
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("Installer thread panicked"))?
    }
}

/// Start the orchestrator on a background thread with its own current-thread runtime, so a
/// front-end can keep rendering. One install job per process.
pub fn start_install(orchestrator: Orchestrator) -> Result<InstallHandle> {
    info!("[PHASE: install] [STEP: start] start_install requested");
    if !try_begin_install_job() {
        anyhow::bail!("Installation is already running.");
    }

    let cancel = orchestrator.cancel.clone();
    let thread = std::thread::Builder::new()
        .name("lumi-setup-install".to_string())
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to create installer runtime")
                .map(|rt| rt.block_on(orchestrator.run()));
            if let Err(e) = &result {
                error!("[PHASE: install] [STEP: error] {:?}", e);
            }
            end_install_job();
            result
        });

    match thread {
        Ok(thread) => Ok(InstallHandle { cancel, thread }),
        Err(e) => {
            end_install_job();
            Err(anyhow::Error::new(e).context("Failed to spawn installer thread"))
        }
    }
}
