// Archive backend: download a tarball and extract it with `tar -xf`

use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use tokio::time::Duration;

use super::files::{download_to_file, file_name_for_url, verify_checksum};
use super::{run_checked, tool_available, Artifact, Backend, BackendError, VerificationMode};
use crate::models::step::{BackendKind, Capabilities, Target};
use crate::utils::validation::validate_download_url;

const TAR: &str = "tar";

pub struct ArchiveBackend {
    client: reqwest::Client,
    download_dir: PathBuf,
    download_timeout: Duration,
    install_timeout: Duration,
}

impl ArchiveBackend {
    pub fn new(
        client: reqwest::Client,
        download_dir: PathBuf,
        download_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        Self {
            client,
            download_dir,
            download_timeout,
            install_timeout,
        }
    }
}

#[async_trait]
impl Backend for ArchiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Archive
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
        tool_available(TAR)
    }

    async fn acquire(
        &self,
        target: &Target,
        mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        let Target::Archive { url, sha256, .. } = target else {
            return Err(BackendError::Permanent(format!(
                "archive backend cannot service target '{}'",
                target.label()
            )));
        };
        let parsed =
            validate_download_url(url).map_err(|e| BackendError::Permanent(e.to_string()))?;
        let dest = self.download_dir.join(file_name_for_url(&parsed, ".tar"));

        let downloaded = download_to_file(&self.client, url, &dest, self.download_timeout).await?;
        verify_checksum(sha256.as_deref(), &downloaded.sha256, mode, url)?;

        Ok(Artifact::Downloaded {
            path: downloaded.path,
            sha256: downloaded.sha256,
            version: None,
        })
    }

    async fn install(
        &self,
        target: &Target,
        artifact: &Artifact,
        _mode: VerificationMode,
    ) -> Result<(), BackendError> {
        let (Target::Archive { destination, .. }, Artifact::Downloaded { path, .. }) =
            (target, artifact)
        else {
            return Err(BackendError::Permanent(format!(
                "nothing downloaded to extract for '{}'",
                target.label()
            )));
        };

        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            BackendError::Permanent(format!("Failed to create {:?}: {}", destination, e))
        })?;

        // tar detects gzip/xz/bzip2 compression on its own when reading from a file
        let args = vec![
            "-xf".to_string(),
            path.to_string_lossy().to_string(),
            "-C".to_string(),
            destination.to_string_lossy().to_string(),
        ];
        run_checked(
            TAR,
            &args,
            self.install_timeout,
            &format!("tar -xf {}", path.display()),
        )
        .await?;
        info!(
            "[PHASE: install] [STEP: archive] [SUCCESS] Extracted archive (archive={:?}, destination={:?})",
            path, destination
        );
        Ok(())
    }
}
