// Sandboxed application backend (flatpak)

use async_trait::async_trait;
use log::debug;
use tokio::time::Duration;

use super::linux_parsers::parse_flatpak_version;
use super::{run_checked, tool_available, Artifact, Backend, BackendError, VerificationMode};
use crate::models::step::{BackendKind, Capabilities, Target};

const FLATPAK: &str = "flatpak";

pub struct FlatpakBackend {
    query_timeout: Duration,
    install_timeout: Duration,
}

impl FlatpakBackend {
    pub fn new(query_timeout: Duration, install_timeout: Duration) -> Self {
        Self {
            query_timeout,
            install_timeout,
        }
    }
}

pub fn remote_add_args(name: &str, url: &str) -> Vec<String> {
    vec![
        "remote-add".to_string(),
        "--if-not-exists".to_string(),
        name.to_string(),
        url.to_string(),
    ]
}

pub fn install_args(remote: &str, app_id: &str) -> Vec<String> {
    vec![
        "install".to_string(),
        "-y".to_string(),
        "--noninteractive".to_string(),
        "--or-update".to_string(),
        remote.to_string(),
        app_id.to_string(),
    ]
}

#[async_trait]
impl Backend for FlatpakBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SandboxedApp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            checks_availability: true,
            needs_network: true,
            idempotent: true,
            relaxable: false,
        }
    }

    async fn is_available(&self) -> bool {
        tool_available(FLATPAK)
    }

    async fn acquire(
        &self,
        target: &Target,
        _mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        match target {
            Target::FlatpakRemote { .. } => Ok(Artifact::Action {
                label: target.label(),
            }),
            Target::FlatpakApp { remote, app_id } => {
                let out = run_checked(
                    FLATPAK,
                    &[
                        "remote-info".to_string(),
                        remote.clone(),
                        app_id.clone(),
                    ],
                    self.query_timeout,
                    &format!("flatpak remote-info {} {}", remote, app_id),
                )
                .await?;
                let version = parse_flatpak_version(&out.stdout);
                debug!(
                    "[PHASE: install] [STEP: flatpak] Resolved app (app_id={}, remote={}, version={:?})",
                    app_id, remote, version
                );
                Ok(Artifact::Resolved {
                    name: app_id.clone(),
                    version,
                    already_installed: false,
                })
            }
            other => Err(BackendError::Permanent(format!(
                "flatpak cannot service target '{}'",
                other.label()
            ))),
        }
    }

    async fn install(
        &self,
        target: &Target,
        _artifact: &Artifact,
        _mode: VerificationMode,
    ) -> Result<(), BackendError> {
        let (args, operation) = match target {
            Target::FlatpakRemote { name, url } => (
                remote_add_args(name, url),
                format!("flatpak remote-add {}", name),
            ),
            Target::FlatpakApp { remote, app_id } => (
                install_args(remote, app_id),
                format!("flatpak install {}", app_id),
            ),
            other => {
                return Err(BackendError::Permanent(format!(
                    "flatpak cannot service target '{}'",
                    other.label()
                )))
            }
        };
        run_checked(FLATPAK, &args, self.install_timeout, &operation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_noninteractive_and_updates_in_place() {
        let args = install_args("flathub", "org.telegram.desktop");
        assert!(args.contains(&"--noninteractive".to_string()));
        assert!(args.contains(&"--or-update".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("org.telegram.desktop")
        );
    }

    #[test]
    fn remote_add_is_idempotent() {
        let args = remote_add_args("flathub", "https://dl.flathub.org/repo/flathub.flatpakrepo");
        assert_eq!(args[1], "--if-not-exists");
    }

    #[tokio::test]
    async fn remote_registration_is_an_action() {
        let fp = FlatpakBackend::new(Duration::from_secs(1), Duration::from_secs(1));
        let artifact = fp
            .acquire(
                &Target::FlatpakRemote {
                    name: "flathub".to_string(),
                    url: "https://dl.flathub.org/repo/flathub.flatpakrepo".to_string(),
                },
                VerificationMode::Strict,
            )
            .await
            .expect("action");
        assert!(matches!(artifact, Artifact::Action { .. }));
        assert!(!fp.capabilities().relaxable);
    }
}
