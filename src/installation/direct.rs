// Direct .deb download backend
//
// Fetches installer packages over HTTP(S) into the download cache and installs them with
// `dpkg -i`. Not idempotent: a half-configured dpkg run needs `apt-get install -f` before another
// attempt. Also owns the purge-download-cache cleanup target.

use async_trait::async_trait;
use log::{info, warn};
use std::path::PathBuf;
use tokio::time::Duration;

use super::files::{download_to_file, file_name_for_url, purge_dir, verify_checksum};
use super::linux_parsers::is_dependency_problem;
use super::release_index::{resolve_latest, DEFAULT_API_BASE};
use super::{
    check_output, exec_error, run_checked, run_cmd_with_timeout, to_args, tool_available,
    Artifact, Backend, BackendError, VerificationMode,
};
use crate::models::step::{BackendKind, Capabilities, Target};
use crate::utils::os_detection::Architecture;
use crate::utils::validation::validate_download_url;

const DPKG: &str = "dpkg";

pub struct DirectDownloadBackend {
    client: reqwest::Client,
    download_dir: PathBuf,
    arch: Architecture,
    release_api_base: String,
    download_timeout: Duration,
    install_timeout: Duration,
}

impl DirectDownloadBackend {
    pub fn new(
        client: reqwest::Client,
        download_dir: PathBuf,
        arch: Architecture,
        download_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        Self {
            client,
            download_dir,
            arch,
            release_api_base: DEFAULT_API_BASE.to_string(),
            download_timeout,
            install_timeout,
        }
    }

    pub fn with_release_api_base(mut self, base: impl Into<String>) -> Self {
        self.release_api_base = base.into();
        self
    }

    async fn fetch_deb(
        &self,
        url: &str,
        file_name: Option<&str>,
        sha256: Option<&str>,
        version: Option<String>,
        mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        let parsed = validate_download_url(url)
            .map_err(|e| BackendError::Permanent(e.to_string()))?;
        let name = file_name
            .map(str::to_string)
            .unwrap_or_else(|| file_name_for_url(&parsed, ".deb"));
        let dest = self.download_dir.join(name);

        let downloaded = download_to_file(&self.client, url, &dest, self.download_timeout).await?;
        verify_checksum(sha256, &downloaded.sha256, mode, url)?;

        Ok(Artifact::Downloaded {
            path: downloaded.path,
            sha256: downloaded.sha256,
            version,
        })
    }
}

#[async_trait]
impl Backend for DirectDownloadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectDownload
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            checks_availability: true,
            needs_network: true,
            idempotent: false,
            relaxable: true,
        }
    }

    async fn is_available(&self) -> bool {
        tool_available(DPKG)
    }

    async fn acquire(
        &self,
        target: &Target,
        mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        match target {
            Target::DebUrl { url, sha256 } => {
                self.fetch_deb(url, None, sha256.as_deref(), None, mode).await
            }
            Target::LatestRelease {
                repo,
                asset_pattern,
            } => {
                let asset = resolve_latest(
                    &self.client,
                    &self.release_api_base,
                    repo,
                    asset_pattern,
                    self.arch,
                    self.download_timeout,
                )
                .await?;
                self.fetch_deb(
                    &asset.url,
                    Some(&asset.name),
                    None,
                    Some(asset.version),
                    mode,
                )
                .await
            }
            Target::PurgeDownloads => Ok(Artifact::Action {
                label: target.label(),
            }),
            other => Err(BackendError::Permanent(format!(
                "direct download cannot service target '{}'",
                other.label()
            ))),
        }
    }

    async fn install(
        &self,
        target: &Target,
        artifact: &Artifact,
        _mode: VerificationMode,
    ) -> Result<(), BackendError> {
        match (target, artifact) {
            (Target::PurgeDownloads, _) => {
                purge_dir(&self.download_dir).await?;
                Ok(())
            }
            (_, Artifact::Downloaded { path, .. }) => {
                let path_str = path.to_string_lossy().to_string();
                let operation = format!("dpkg -i {}", path_str);
                let out = run_cmd_with_timeout(
                    DPKG,
                    &["-i".to_string(), path_str],
                    self.install_timeout,
                    &operation,
                )
                .await
                .map_err(exec_error)?;

                if !out.success() && is_dependency_problem(&out.combined()) {
                    warn!(
                        "[PHASE: install] [STEP: dpkg] Unmet dependencies reported (package={:?})",
                        path
                    );
                    return Err(BackendError::Permanent(format!(
                        "{} left unmet dependencies: {}",
                        operation,
                        out.tail(3)
                    )));
                }
                check_output(out, &operation)?;
                info!(
                    "[PHASE: install] [STEP: dpkg] [SUCCESS] Installed package file (package={:?})",
                    path
                );
                Ok(())
            }
            (other, _) => Err(BackendError::Permanent(format!(
                "nothing downloaded to install for '{}'",
                other.label()
            ))),
        }
    }

    async fn repair(&self) -> Result<(), BackendError> {
        info!("[PHASE: install] [STEP: dpkg] Repairing dependencies (apt-get install -f -y)");
        run_checked(
            "apt-get",
            &to_args(&["install", "-f", "-y"]),
            self.install_timeout,
            "apt-get install -f",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::scripted::serve_http;

    fn backend(dir: &std::path::Path) -> DirectDownloadBackend {
        DirectDownloadBackend::new(
            reqwest::Client::new(),
            dir.to_path_buf(),
            Architecture::X86_64,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn downloads_into_cache() {
        let base = serve_http(vec![(200, "deb-bytes".to_string())]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let be = backend(dir.path());
        let artifact = be
            .acquire(
                &Target::DebUrl {
                    url: format!("{}/zoom_amd64.deb", base),
                    sha256: None,
                },
                VerificationMode::Strict,
            )
            .await
            .expect("download");
        match artifact {
            Artifact::Downloaded { path, .. } => {
                assert_eq!(path, dir.path().join("zoom_amd64.deb"));
                assert!(path.exists());
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_is_verification_error() {
        let base = serve_http(vec![(200, "deb-bytes".to_string())]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let be = backend(dir.path());
        let err = be
            .acquire(
                &Target::DebUrl {
                    url: format!("{}/pkg.deb", base),
                    sha256: Some("0".repeat(64)),
                },
                VerificationMode::Strict,
            )
            .await
            .expect_err("mismatch");
        assert!(
            matches!(err, BackendError::Verification(_)),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn latest_release_carries_version() {
        let index = r#"{"tag_name":"v1.3.2","assets":[{"name":"rustdesk-1.3.2-x86_64.deb","browser_download_url":"PLACEHOLDER"}]}"#;
        let file_base = serve_http(vec![(200, "deb".to_string())]).await;
        let index = index.replace("PLACEHOLDER", &format!("{}/rustdesk.deb", file_base));
        let index_base = serve_http(vec![(200, index)]).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let be = backend(dir.path()).with_release_api_base(index_base);
        let artifact = be
            .acquire(
                &Target::LatestRelease {
                    repo: "rustdesk/rustdesk".to_string(),
                    asset_pattern: r"\.deb$".to_string(),
                },
                VerificationMode::Strict,
            )
            .await
            .expect("resolve + download");
        assert_eq!(artifact.version(), Some("1.3.2"));
        match artifact {
            Artifact::Downloaded { path, .. } => {
                assert_eq!(path, dir.path().join("rustdesk-1.3.2-x86_64.deb"))
            }
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[tokio::test]
    async fn purge_target_empties_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("old.deb"), b"x").expect("write");
        let be = backend(dir.path());
        let artifact = be
            .acquire(&Target::PurgeDownloads, VerificationMode::Strict)
            .await
            .expect("action");
        be.install(&Target::PurgeDownloads, &artifact, VerificationMode::Strict)
            .await
            .expect("purge");
        assert!(!dir.path().join("old.deb").exists());
    }
}
