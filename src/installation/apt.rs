// System package backend (apt)
//
// Resolves candidates with `apt-cache policy`, installs with `apt-get install -y`, and services
// the index-refresh and cleanup maintenance targets.

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::Duration;

use super::linux_parsers::{parse_apt_policy, AptPolicy};
use super::{
    run_checked, to_args, tool_available, Artifact, Backend, BackendError, VerificationMode,
};
use crate::models::step::{BackendKind, Capabilities, Target};

const APT_GET: &str = "apt-get";
const APT_CACHE: &str = "apt-cache";

pub struct AptBackend {
    query_timeout: Duration,
    install_timeout: Duration,
}

impl AptBackend {
    pub fn new(query_timeout: Duration, install_timeout: Duration) -> Self {
        Self {
            query_timeout,
            install_timeout,
        }
    }

    async fn policy(&self, package: &str) -> Result<AptPolicy, BackendError> {
        let out = run_checked(
            APT_CACHE,
            &to_args(&["policy", package]),
            self.query_timeout,
            &format!("apt-cache policy {}", package),
        )
        .await?;
        Ok(parse_apt_policy(&out.stdout))
    }
}

/// `apt-get` arguments for an operation, with the trust-downgrade flags in relaxed mode.
pub fn apt_get_args(operation: &[&str], mode: VerificationMode) -> Vec<String> {
    let mut args = Vec::new();
    if mode.is_relaxed() {
        args.push("-o".to_string());
        args.push("Acquire::AllowInsecureRepositories=true".to_string());
    }
    args.extend(operation.iter().map(|a| a.to_string()));
    if mode.is_relaxed() && operation.first() == Some(&"install") {
        args.push("--allow-unauthenticated".to_string());
    }
    args
}

#[async_trait]
impl Backend for AptBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemPackage
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            checks_availability: true,
            needs_network: true,
            idempotent: true,
            relaxable: true,
        }
    }

    async fn is_available(&self) -> bool {
        tool_available(APT_GET) && tool_available(APT_CACHE)
    }

    async fn acquire(
        &self,
        target: &Target,
        _mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        match target {
            Target::RefreshIndex | Target::Autoremove | Target::CleanCache => Ok(Artifact::Action {
                label: target.label(),
            }),
            Target::Packages { names } => {
                let mut version = None;
                let mut all_current = true;
                for name in names {
                    let policy = self.policy(name).await?;
                    debug!(
                        "[PHASE: install] [STEP: apt] apt-cache policy (package={}, installed={:?}, candidate={:?})",
                        name, policy.installed, policy.candidate
                    );
                    let Some(candidate) = policy.candidate.clone() else {
                        return Err(BackendError::Permanent(format!(
                            "Package '{}' has no installation candidate",
                            name
                        )));
                    };
                    all_current &= policy.is_up_to_date();
                    if version.is_none() {
                        version = Some(candidate);
                    }
                }
                Ok(Artifact::Resolved {
                    name: names.join(" "),
                    version,
                    already_installed: all_current,
                })
            }
            other => Err(BackendError::Permanent(format!(
                "apt cannot service target '{}'",
                other.label()
            ))),
        }
    }

    async fn install(
        &self,
        target: &Target,
        artifact: &Artifact,
        mode: VerificationMode,
    ) -> Result<(), BackendError> {
        let args = match target {
            Target::RefreshIndex => apt_get_args(&["update"], mode),
            Target::Autoremove => apt_get_args(&["autoremove", "-y"], mode),
            Target::CleanCache => apt_get_args(&["clean"], mode),
            Target::Packages { names } => {
                if let Artifact::Resolved {
                    already_installed: true,
                    name,
                    version,
                } = artifact
                {
                    info!(
                        "[PHASE: install] [STEP: apt] [SUCCESS] Already installed at candidate version (packages={}, version={})",
                        name,
                        version.as_deref().unwrap_or("unknown")
                    );
                    return Ok(());
                }
                let mut args = apt_get_args(&["install", "-y"], mode);
                args.extend(names.iter().cloned());
                args
            }
            other => {
                return Err(BackendError::Permanent(format!(
                    "apt cannot service target '{}'",
                    other.label()
                )))
            }
        };

        if mode.is_relaxed() {
            warn!(
                "[PHASE: install] [STEP: apt] Running apt-get with signature checks relaxed (target={})",
                target.label()
            );
        }

        let operation = format!("apt-get {}", target.label());
        run_checked(APT_GET, &args, self.install_timeout, &operation).await?;
        Ok(())
    }

    async fn repair(&self) -> Result<(), BackendError> {
        info!("[PHASE: install] [STEP: apt] Repairing broken dependencies (apt-get install -f -y)");
        run_checked(
            APT_GET,
            &to_args(&["install", "-f", "-y"]),
            self.install_timeout,
            "apt-get install -f",
        )
        .await?;
        Ok(())
    }
}
