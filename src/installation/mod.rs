// Acquisition backends
//
// Every way of getting software onto the machine (apt, flatpak, direct .deb downloads, tarballs)
// sits behind the `Backend` trait so the policy engine can treat them uniformly. External tool
// failures are mapped into `BackendError` here and nowhere else.
//
// IMPORTANT:
// - All commands run non-interactively and under a timeout.
// - All I/O should be async.

pub mod apt;
pub mod archive;
pub mod direct;
pub mod files;
pub mod flatpak;
pub mod linux_parsers;
pub mod release_index;

#[cfg(test)]
pub mod scripted;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::models::outcome::AttemptOutcome;
use crate::models::step::{BackendKind, Capabilities, Target};
use crate::settings::Settings;
use linux_parsers::{classify_failure_output, FailureClass};

/// Uniform failure taxonomy for every backend. The message is reported verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Backend tool missing or not usable on this host.
    #[error("{0}")]
    Unavailable(String),
    /// Lock contention, network trouble, timeouts. Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// Missing package, 404, bad input. Retrying will not help.
    #[error("{0}")]
    Permanent(String),
    /// Signature or checksum rejection.
    #[error("{0}")]
    Verification(String),
}

impl BackendError {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            BackendError::Unavailable(_) => AttemptOutcome::Unavailable,
            BackendError::Transient(_) => AttemptOutcome::Transient,
            BackendError::Permanent(_) => AttemptOutcome::Permanent,
            BackendError::Verification(_) => AttemptOutcome::Verification,
        }
    }

    pub fn from_class(class: FailureClass, message: String) -> Self {
        match class {
            FailureClass::Transient => BackendError::Transient(message),
            FailureClass::Verification => BackendError::Verification(message),
            FailureClass::Permanent => BackendError::Permanent(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    Strict,
    /// Trust downgrade: unsigned repositories allowed, checksums not enforced.
    Relaxed,
}

impl VerificationMode {
    pub fn is_relaxed(&self) -> bool {
        matches!(self, VerificationMode::Relaxed)
    }
}

/// Result of `Backend::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Maintenance operation with nothing to fetch (index refresh, autoremove, ...).
    Action { label: String },
    /// Package or app resolved against a repository.
    Resolved {
        name: String,
        version: Option<String>,
        already_installed: bool,
    },
    /// File downloaded into the download cache.
    Downloaded {
        path: PathBuf,
        sha256: String,
        version: Option<String>,
    },
}

impl Artifact {
    pub fn version(&self) -> Option<&str> {
        match self {
            Artifact::Resolved { version, .. } | Artifact::Downloaded { version, .. } => {
                version.as_deref()
            }
            Artifact::Action { .. } => None,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Cheap availability check; no side effects.
    async fn is_available(&self) -> bool;

    async fn acquire(&self, target: &Target, mode: VerificationMode)
        -> Result<Artifact, BackendError>;

    async fn install(
        &self,
        target: &Target,
        artifact: &Artifact,
        mode: VerificationMode,
    ) -> Result<(), BackendError>;

    /// Dependency repair before re-invoking a non-idempotent install.
    async fn repair(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backends available to a run, keyed by kind. Constructed once at startup.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// The real apt/flatpak/download/archive backends for this host.
    pub fn system(settings: &Settings, download_dir: PathBuf) -> Result<Self> {
        let client = files::http_client(settings.download_timeout())?;
        let arch = crate::utils::os_detection::detect_arch();

        Ok(Self::new()
            .with(Arc::new(apt::AptBackend::new(
                settings.query_timeout(),
                settings.install_timeout(),
            )))
            .with(Arc::new(flatpak::FlatpakBackend::new(
                settings.query_timeout(),
                settings.install_timeout(),
            )))
            .with(Arc::new(direct::DirectDownloadBackend::new(
                client.clone(),
                download_dir.clone(),
                arch,
                settings.download_timeout(),
                settings.install_timeout(),
            )))
            .with(Arc::new(archive::ArchiveBackend::new(
                client,
                download_dir,
                settings.download_timeout(),
                settings.install_timeout(),
            ))))
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Last few meaningful lines of output, for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let picked: Vec<&str> = source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = picked.len().saturating_sub(lines);
        picked[start..].join(" | ")
    }
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("busy")
        || msg.contains("resource")
        || msg.contains("connection")
        || msg.contains("network")
}

fn is_missing_program(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
    })
}

/// Map a failure to *run* a command (spawn error, timeout) into the backend taxonomy.
pub fn exec_error(e: anyhow::Error) -> BackendError {
    if is_missing_program(&e) {
        BackendError::Unavailable(format!("{:#}", e))
    } else if is_transient_exec_error(&e) {
        BackendError::Transient(format!("{:#}", e))
    } else {
        BackendError::Permanent(format!("{:#}", e))
    }
}

/// Turn a finished command into `Ok` on exit 0, or a classified `BackendError`.
pub fn check_output(out: CommandOutput, operation: &str) -> Result<CommandOutput, BackendError> {
    if out.success() {
        return Ok(out);
    }
    let class = classify_failure_output(&out.combined());
    let message = format!(
        "{} failed (exit_code={}): {}",
        operation,
        out.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        out.tail(3)
    );
    Err(BackendError::from_class(class, message))
}

/// Run a command to completion under a timeout and classify the result.
pub async fn run_checked(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput, BackendError> {
    let out = run_cmd_with_timeout(program, args, timeout_dur, operation)
        .await
        .map_err(exec_error)?;
    check_output(out, operation)
}

/// Run an external command once with a timeout.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success).
/// Retrying is the policy engine's job, not this function's.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// `which`-based availability check shared by the command-line backends.
pub fn tool_available(program: &str) -> bool {
    which::which(program).is_ok()
}

pub(crate) fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn run_cmd_with_timeout_basic_smoke() {
        let out = run_cmd_with_timeout("sh", &sh("echo hello"), Duration::from_secs(5), "test_echo")
            .await
            .expect("command should run");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn commands_run_noninteractive() {
        let out = run_cmd_with_timeout(
            "sh",
            &sh("echo $DEBIAN_FRONTEND"),
            Duration::from_secs(5),
            "test_env",
        )
        .await
        .expect("command should run");
        assert_eq!(out.stdout.trim(), "noninteractive");
    }

    #[tokio::test]
    async fn non_zero_exit_is_classified_from_output() {
        let err = run_checked(
            "sh",
            &sh("echo 'E: Unable to locate package nope' >&2; exit 100"),
            Duration::from_secs(5),
            "apt-get install nope",
        )
        .await
        .expect_err("should fail");
        assert!(matches!(err, BackendError::Permanent(_)), "got {:?}", err);
        assert!(err.to_string().contains("Unable to locate package nope"));
        assert!(err.to_string().contains("exit_code=100"));
    }

    #[tokio::test]
    async fn lock_contention_is_transient() {
        let err = run_checked(
            "sh",
            &sh("echo 'E: Could not get lock /var/lib/dpkg/lock-frontend' >&2; exit 100"),
            Duration::from_secs(5),
            "apt-get install vlc",
        )
        .await
        .expect_err("should fail");
        assert_eq!(err.outcome(), AttemptOutcome::Transient);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let timeout = Duration::from_millis(200);
        let err = run_checked("sleep", &to_args(&["5"]), timeout, "sleep")
            .await
            .expect_err("should time out");
        assert_eq!(err.outcome(), AttemptOutcome::Transient, "got {:?}", err);
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let err = run_checked(
            "lumi-setup-definitely-not-installed",
            &[],
            Duration::from_secs(5),
            "missing",
        )
        .await
        .expect_err("should fail to spawn");
        assert_eq!(err.outcome(), AttemptOutcome::Unavailable, "got {:?}", err);
    }

    #[test]
    fn tail_prefers_stderr() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "a\nb\n".to_string(),
            stderr: "\nx\ny\nz\n".to_string(),
            duration_ms: 0,
        };
        assert_eq!(out.tail(2), "y | z");
    }
}
