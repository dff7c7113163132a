// Preflight checks
//
// Network reachability and root privilege. Either failing is fatal: the run ends before any step
// is attempted.

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{timeout, Duration};

use crate::settings::PreflightSettings;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreflightError {
    #[error("No network connectivity ({0}). Check your connection and try again.")]
    NoNetwork(String),
    #[error("Root privileges are required. Re-run with sudo.")]
    NotRoot,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
    pub name: String,
    pub status: String, // "pass" | "fail" | "skipped"
    pub detail: String,
}

/// Host facts the preflight phase needs. Stubbed in tests.
#[async_trait]
pub trait HostChecks: Send + Sync {
    /// Ok when an HTTP response (any status) arrives from `url`.
    async fn network_reachable(&self, url: &str) -> Result<(), String>;

    fn is_root(&self) -> bool;

    fn timeout_duration(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Production host: HTTP HEAD via reqwest, effective uid via nix.
pub struct SystemHost {
    client: reqwest::Client,
    timeout: Duration,
}

impl SystemHost {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HostChecks for SystemHost {
    async fn network_reachable(&self, url: &str) -> Result<(), String> {
        match timeout(self.timeout_duration(), self.client.head(url).send()).await {
            Ok(Ok(resp)) => {
                info!(
                    "[PHASE: preflight] [STEP: network] Connectivity check answered (url={}, status={})",
                    url,
                    resp.status()
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no answer from {} within {}s",
                url,
                self.timeout_duration().as_secs()
            )),
        }
    }

    fn is_root(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            nix::unistd::geteuid().is_root()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    fn timeout_duration(&self) -> Duration {
        self.timeout
    }
}

fn check(name: &str, status: &str, detail: impl Into<String>) -> PreflightCheck {
    PreflightCheck {
        name: name.to_string(),
        status: status.to_string(),
        detail: detail.into(),
    }
}

/// Run all preflight checks. The first failing check ends preflight with its error.
pub async fn run_preflight(
    host: &dyn HostChecks,
    settings: &PreflightSettings,
) -> Result<Vec<PreflightCheck>, PreflightError> {
    let started = Instant::now();
    let mut checks = Vec::new();

    if settings.require_root {
        if !host.is_root() {
            warn!("[PHASE: preflight] [STEP: root] Not running as root");
            return Err(PreflightError::NotRoot);
        }
        checks.push(check("root", "pass", "running with effective uid 0"));
    } else {
        checks.push(check("root", "skipped", "disabled in configuration"));
    }

    if settings.check_network {
        if let Err(detail) = host.network_reachable(&settings.connectivity_url).await {
            warn!(
                "[PHASE: preflight] [STEP: network] Connectivity check failed (url={}): {}",
                settings.connectivity_url, detail
            );
            return Err(PreflightError::NoNetwork(detail));
        }
        checks.push(check(
            "network",
            "pass",
            format!("{} reachable", settings.connectivity_url),
        ));
    } else {
        checks.push(check("network", "skipped", "disabled in configuration"));
    }

    info!(
        "[PHASE: preflight] [STEP: done] [SUCCESS] Preflight passed (checks={}, duration_ms={})",
        checks.len(),
        started.elapsed().as_millis()
    );
    Ok(checks)
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub struct StubHost {
        pub root: bool,
        pub network: Result<(), String>,
        pub network_calls: AtomicU32,
    }

    impl StubHost {
        pub fn healthy() -> Self {
            Self {
                root: true,
                network: Ok(()),
                network_calls: AtomicU32::new(0),
            }
        }

        pub fn offline() -> Self {
            Self {
                network: Err("Temporary failure in name resolution".to_string()),
                ..Self::healthy()
            }
        }

        pub fn unprivileged() -> Self {
            Self {
                root: false,
                ..Self::healthy()
            }
        }
    }

    #[async_trait]
    impl HostChecks for StubHost {
        async fn network_reachable(&self, _url: &str) -> Result<(), String> {
            self.network_calls.fetch_add(1, Ordering::SeqCst);
            self.network.clone()
        }

        fn is_root(&self) -> bool {
            self.root
        }
    }
}
