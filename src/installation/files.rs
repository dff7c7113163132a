//! Download helpers for the direct-download and archive backends.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Hash while streaming (sha256), never re-read the file
//! - Timeout every network wait (plan: 60s default)
//! - Partial files never take the final name

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};
use url::Url;

use super::linux_parsers::classify_http_status;
use super::{BackendError, VerificationMode};
use crate::utils::validation::slugify;

/// Shared HTTP client. `timeout_dur` bounds connecting; body reads are bounded per chunk.
pub fn http_client(timeout_dur: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("lumi-setup/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeout_dur)
        .build()
        .context("Failed to build HTTP client")
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

pub fn classify_reqwest_error(e: &reqwest::Error) -> BackendError {
    if let Some(status) = e.status() {
        return http_status_error(status, e.url().map(Url::as_str).unwrap_or("?"));
    }
    if e.is_builder() {
        BackendError::Permanent(format!("Invalid request: {}", e))
    } else {
        // connect, timeout, body and decode errors are all network trouble
        BackendError::Transient(format!("Network error: {}", e))
    }
}

pub fn http_status_error(status: StatusCode, url: &str) -> BackendError {
    BackendError::from_class(
        classify_http_status(status.as_u16()),
        format!("HTTP {} for {}", status, url),
    )
}

/// Local file name for a download. Keeps the URL's last segment when it already contains
/// `extension` (`.tar` also matches `.tar.gz`), otherwise derives one from host and path
/// (e.g. `discord-com-api-download.deb`).
pub fn file_name_for_url(url: &Url, extension: &str) -> String {
    let last = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .unwrap_or("");
    if !last.is_empty()
        && last.contains(extension)
        && last
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-+".contains(c))
    {
        return last.to_string();
    }
    let stem = slugify(&format!("{}{}", url.host_str().unwrap_or("download"), url.path()));
    let stem = if stem.is_empty() {
        "download".to_string()
    } else {
        stem
    };
    format!("{}{}", stem, extension)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "download".into());
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream `url` into `dest`, hashing as it goes.
///
/// The request and every body chunk must arrive within `timeout_dur`.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    timeout_dur: Duration,
) -> Result<DownloadedFile, BackendError> {
    let started = Instant::now();
    info!(
        "[PHASE: install] [STEP: download] download_to_file entered (url={}, dest={:?}, timeout_ms={})",
        url,
        dest,
        timeout_dur.as_millis()
    );

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            BackendError::Permanent(format!(
                "Failed to create download folder {:?}: {}",
                parent, e
            ))
        })?;
    }

    let mut response = match timeout(timeout_dur, client.get(url).send()).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return Err(classify_reqwest_error(&e)),
        Err(_) => {
            return Err(BackendError::Transient(format!(
                "Download timed out after {}ms waiting for {}",
                timeout_dur.as_millis(),
                url
            )))
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!(
            "[PHASE: install] [STEP: download] Non-success status (url={}, status={})",
            url, status
        );
        return Err(http_status_error(status, url));
    }

    let part = partial_path(dest);
    let mut file = tokio::fs::File::create(&part).await.map_err(|e| {
        BackendError::Permanent(format!("Failed to create {:?}: {}", part, e))
    })?;

    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    loop {
        let chunk = match timeout(timeout_dur, response.chunk()).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(classify_reqwest_error(&e));
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(BackendError::Transient(format!(
                    "Download stalled for {}ms (url={}, bytes={})",
                    timeout_dur.as_millis(),
                    url,
                    total
                )));
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        hasher.update(&chunk);
        if let Err(e) = file.write_all(&chunk).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(BackendError::Transient(format!(
                "Failed writing {:?}: {}",
                part, e
            )));
        }
        total = total.saturating_add(chunk.len() as u64);
    }
    file.flush()
        .await
        .map_err(|e| BackendError::Transient(format!("Failed to flush {:?}: {}", part, e)))?;
    drop(file);

    tokio::fs::rename(&part, dest).await.map_err(|e| {
        BackendError::Permanent(format!("Failed to move {:?} into place: {}", part, e))
    })?;

    let sha256 = hex_digest(hasher);
    debug!(
        "[PHASE: install] [STEP: download] download_to_file exit ok (url={}, bytes={}, sha256={}, duration_ms={})",
        url,
        total,
        sha256,
        started.elapsed().as_millis()
    );

    Ok(DownloadedFile {
        path: dest.to_path_buf(),
        sha256,
        bytes: total,
    })
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// Compare a downloaded digest with the expected one. Relaxed mode logs and accepts a mismatch.
pub fn verify_checksum(
    expected: Option<&str>,
    actual: &str,
    mode: VerificationMode,
    label: &str,
) -> Result<(), BackendError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if expected.eq_ignore_ascii_case(actual) {
        return Ok(());
    }
    if mode.is_relaxed() {
        warn!(
            "[PHASE: install] [STEP: download] Checksum mismatch accepted in relaxed mode (label={}, expected={}, actual={})",
            label, expected, actual
        );
        return Ok(());
    }
    Err(BackendError::Verification(format!(
        "Checksum mismatch for {} (expected={}, actual={})",
        label, expected, actual
    )))
}

/// Remove everything in the download cache. Returns the number of entries removed.
pub async fn purge_dir(dir: &Path) -> Result<usize, BackendError> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(BackendError::Permanent(format!(
                "Failed to read {:?}: {}",
                dir, e
            )))
        }
    };

    let mut removed = 0;
    loop {
        let ent = match rd.next_entry().await {
            Ok(Some(ent)) => ent,
            Ok(None) => break,
            Err(e) => {
                return Err(BackendError::Transient(format!(
                    "read_dir failed: {:?}: {}",
                    dir, e
                )))
            }
        };
        let p = ent.path();
        let res = if p.is_dir() {
            tokio::fs::remove_dir_all(&p).await
        } else {
            tokio::fs::remove_file(&p).await
        };
        res.map_err(|e| BackendError::Transient(format!("Failed to remove {:?}: {}", p, e)))?;
        removed += 1;
    }
    info!(
        "[PHASE: cleanup] [STEP: downloads] Purged download cache (dir={:?}, entries={})",
        dir, removed
    );
    Ok(removed)
}
