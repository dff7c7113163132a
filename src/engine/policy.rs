// Retry/fallback policy
//
// Per-step state machine over the step's backend chain:
// - Transient: retry the same backend after a fixed delay while fewer than `max_retries`
//   transient failures have been seen on it; then fall through to the next backend.
// - Permanent: next backend. Non-idempotent backends first get one repair + reinstall when the
//   failure happened during install.
// - Unavailable (tool missing, backend not registered): next backend, no retry consumed.
// - Verification: one relaxed attempt when the backend supports it and configuration allows it;
//   otherwise handled as Permanent.
// Cancellation and pause are observed at every retry boundary.

use log::{debug, info, warn};
use std::time::Instant;
use tokio::time::Duration;
use tokio_retry::strategy::FixedInterval;

use super::CancelToken;
use crate::installation::{Backend, BackendError, BackendSet, VerificationMode};
use crate::models::outcome::{Attempt, AttemptOutcome};
use crate::models::step::{BackendKind, BackendRef, Step};
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub allow_relaxed_verification: bool,
}

impl From<&Settings> for PolicyConfig {
    fn from(s: &Settings) -> Self {
        Self {
            max_retries: s.retry.max_retries,
            retry_delay: s.retry_delay(),
            allow_relaxed_verification: s.system.allow_relaxed_verification,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResolution {
    Succeeded {
        backend: BackendKind,
        attempt_number: u32,
        attempts: Vec<Attempt>,
    },
    Failed {
        reason: String,
        attempts: Vec<Attempt>,
    },
    Cancelled {
        attempts: Vec<Attempt>,
    },
}

impl StepResolution {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            StepResolution::Succeeded { attempts, .. }
            | StepResolution::Failed { attempts, .. }
            | StepResolution::Cancelled { attempts } => attempts,
        }
    }

    /// Backend invocations that actually ran (unavailable backends excluded).
    pub fn invocation_count(&self) -> u32 {
        self.attempts()
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Unavailable)
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Acquire,
    Install,
}

async fn run_once(
    backend: &dyn Backend,
    bref: &BackendRef,
    mode: VerificationMode,
) -> Result<(), (Stage, BackendError)> {
    let artifact = backend
        .acquire(&bref.target, mode)
        .await
        .map_err(|e| (Stage::Acquire, e))?;
    debug!(
        "[PHASE: install] [STEP: policy] Acquired (backend={}, target={}, version={:?})",
        bref.kind,
        bref.target.label(),
        artifact.version()
    );
    backend
        .install(&bref.target, &artifact, mode)
        .await
        .map_err(|e| (Stage::Install, e))
}

enum Next {
    Retry,
    NextBackend,
}

/// Resolve one step against its backend chain.
pub async fn execute_step(
    step: &Step,
    backends: &BackendSet,
    cfg: &PolicyConfig,
    cancel: &CancelToken,
) -> StepResolution {
    let started = Instant::now();
    let mut attempts: Vec<Attempt> = Vec::new();
    let mut failures: Vec<String> = Vec::new();
    let mut delays = FixedInterval::new(cfg.retry_delay);

    for bref in &step.backends {
        cancel.wait_while_paused().await;
        if cancel.is_cancelled() {
            return StepResolution::Cancelled { attempts };
        }

        let Some(backend) = backends.get(bref.kind) else {
            let detail = format!("{} backend is not available on this host", bref.kind);
            warn!(
                "[PHASE: install] [STEP: {}] {}; trying next backend",
                step.id, detail
            );
            attempts.push(Attempt {
                backend: bref.kind,
                attempt_number: 0,
                outcome: AttemptOutcome::Unavailable,
                error_detail: Some(detail.clone()),
                relaxed: false,
            });
            failures.push(detail);
            continue;
        };
        let caps = backend.capabilities();

        if caps.checks_availability && !backend.is_available().await {
            let detail = format!("{} backend unavailable (tool not found)", bref.kind);
            warn!(
                "[PHASE: install] [STEP: {}] {}; trying next backend",
                step.id, detail
            );
            attempts.push(Attempt {
                backend: bref.kind,
                attempt_number: 0,
                outcome: AttemptOutcome::Unavailable,
                error_detail: Some(detail.clone()),
                relaxed: false,
            });
            failures.push(detail);
            continue;
        }

        let mut attempt_number: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut mode = VerificationMode::Strict;
        let mut relaxed_used = false;
        let mut reinstall_used = false;
        let mut needs_repair = false;

        loop {
            attempt_number += 1;

            if needs_repair {
                needs_repair = false;
                if let Err(e) = backend.repair().await {
                    warn!(
                        "[PHASE: install] [STEP: {}] Dependency repair failed (backend={}): {}",
                        step.id, bref.kind, e
                    );
                }
            }

            info!(
                "[PHASE: install] [STEP: {}] Attempt {} (backend={}, target={}, relaxed={})",
                step.id,
                attempt_number,
                bref.kind,
                bref.target.label(),
                mode.is_relaxed()
            );

            let (stage, err) = match run_once(backend.as_ref(), bref, mode).await {
                Ok(()) => {
                    attempts.push(Attempt {
                        backend: bref.kind,
                        attempt_number,
                        outcome: AttemptOutcome::Success,
                        error_detail: None,
                        relaxed: mode.is_relaxed(),
                    });
                    debug!(
                        "[PHASE: install] [STEP: {}] Resolved (backend={}, attempt={}, duration_ms={})",
                        step.id,
                        bref.kind,
                        attempt_number,
                        started.elapsed().as_millis()
                    );
                    return StepResolution::Succeeded {
                        backend: bref.kind,
                        attempt_number,
                        attempts,
                    };
                }
                Err((stage, err)) => {
                    attempts.push(Attempt {
                        backend: bref.kind,
                        attempt_number,
                        outcome: err.outcome(),
                        error_detail: Some(err.to_string()),
                        relaxed: mode.is_relaxed(),
                    });
                    (stage, err)
                }
            };

            let next = match &err {
                BackendError::Unavailable(_) => Next::NextBackend,
                BackendError::Transient(msg) => {
                    transient_failures += 1;
                    if transient_failures < cfg.max_retries {
                        warn!(
                            "[PHASE: install] [STEP: {}] Transient failure {}/{} (backend={}): {}",
                            step.id, transient_failures, cfg.max_retries, bref.kind, msg
                        );
                        if stage == Stage::Install && !caps.idempotent {
                            needs_repair = true;
                        }
                        let delay = delays.next().unwrap_or(cfg.retry_delay);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Next::Retry
                    } else {
                        warn!(
                            "[PHASE: install] [STEP: {}] Retry budget exhausted (backend={}, attempts={}): {}",
                            step.id, bref.kind, attempt_number, msg
                        );
                        Next::NextBackend
                    }
                }
                BackendError::Verification(msg) => {
                    if caps.relaxable && cfg.allow_relaxed_verification && !relaxed_used {
                        relaxed_used = true;
                        mode = VerificationMode::Relaxed;
                        warn!(
                            "[PHASE: install] [STEP: {}] TRUST DOWNGRADE: retrying with relaxed verification (backend={}): {}",
                            step.id, bref.kind, msg
                        );
                        Next::Retry
                    } else {
                        warn!(
                            "[PHASE: install] [STEP: {}] Verification failed, not relaxing (backend={}, relaxable={}, allowed={}): {}",
                            step.id, bref.kind, caps.relaxable, cfg.allow_relaxed_verification, msg
                        );
                        Next::NextBackend
                    }
                }
                BackendError::Permanent(msg) => {
                    if stage == Stage::Install && !caps.idempotent && !reinstall_used {
                        reinstall_used = true;
                        needs_repair = true;
                        warn!(
                            "[PHASE: install] [STEP: {}] Install failed; repairing dependencies before one more try (backend={}): {}",
                            step.id, bref.kind, msg
                        );
                        Next::Retry
                    } else {
                        Next::NextBackend
                    }
                }
            };

            match next {
                Next::Retry => {
                    cancel.wait_while_paused().await;
                    if cancel.is_cancelled() {
                        info!(
                            "[PHASE: install] [STEP: {}] Cancelled at retry boundary (backend={}, attempts={})",
                            step.id, bref.kind, attempt_number
                        );
                        return StepResolution::Cancelled { attempts };
                    }
                }
                Next::NextBackend => {
                    failures.push(err.to_string());
                    break;
                }
            }
        }
    }

    let reason = match failures.len() {
        0 => "No backend could service this step".to_string(),
        1 => failures.remove(0),
        _ => step
            .backends
            .iter()
            .zip(failures.iter())
            .map(|(b, f)| format!("{}: {}", b.kind, f))
            .collect::<Vec<_>>()
            .join("; "),
    };
    StepResolution::Failed { reason, attempts }
}
