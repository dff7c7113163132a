// Update check
//
// Compares what is installed with what each catalog source offers right now. Nothing is
// installed and the checkpoint is left alone.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::fmt::Write as _;
use tokio::time::Duration;

use crate::installation::files::http_client;
use crate::installation::linux_parsers::{
    parse_apt_policy, parse_dpkg_query, parse_flatpak_version, upstream_version, AptPolicy,
};
use crate::installation::release_index::{resolve_latest, DEFAULT_API_BASE};
use crate::installation::{exec_error, run_checked, run_cmd_with_timeout, to_args, BackendError};
use crate::settings::{ReleaseEntry, Settings};
use crate::utils::os_detection::{detect_arch, Architecture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable,
    NotInstalled,
    /// The source publishes no version to compare against.
    ManualCheck,
    Unknown,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::UpToDate => "up-to-date",
            UpdateStatus::UpdateAvailable => "update-available",
            UpdateStatus::NotInstalled => "not-installed",
            UpdateStatus::ManualCheck => "manual-check",
            UpdateStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub id: String,
    /// Package, app id or repository that was checked.
    pub name: String,
    pub source: &'static str,
    pub installed: Option<String>,
    pub latest: Option<String>,
    pub status: UpdateStatus,
    pub detail: Option<String>,
}

impl UpdateReport {
    fn new(id: &str, name: &str, source: &'static str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            source,
            installed: None,
            latest: None,
            status: UpdateStatus::Unknown,
            detail: None,
        }
    }

    fn failed(mut self, err: BackendError) -> Self {
        self.status = UpdateStatus::Unknown;
        self.detail = Some(err.to_string());
        self
    }

    fn manual(mut self, detail: String) -> Self {
        self.status = UpdateStatus::ManualCheck;
        self.detail = Some(detail);
        self
    }
}

/// Installed and published versions. Stubbed in tests.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn apt_policy(&self, package: &str) -> Result<AptPolicy, BackendError>;

    /// `None` when the app is not installed; an empty string when flatpak reports no version.
    async fn flatpak_installed(&self, app_id: &str) -> Result<Option<String>, BackendError>;

    async fn flatpak_latest(&self, remote: &str, app_id: &str)
        -> Result<Option<String>, BackendError>;

    /// Version of the newest release that has an asset for this host.
    async fn latest_release(&self, repo: &str, pattern: &str) -> Result<String, BackendError>;

    async fn deb_installed(&self, package: &str) -> Result<Option<String>, BackendError>;
}

/// Production source: apt-cache, flatpak, dpkg-query and the release index.
pub struct SystemVersions {
    client: reqwest::Client,
    query_timeout: Duration,
    api_base: String,
    arch: Architecture,
}

impl SystemVersions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            client: http_client(settings.download_timeout())?,
            query_timeout: settings.query_timeout(),
            api_base: DEFAULT_API_BASE.to_string(),
            arch: detect_arch(),
        })
    }
}

#[async_trait]
impl VersionSource for SystemVersions {
    async fn apt_policy(&self, package: &str) -> Result<AptPolicy, BackendError> {
        let operation = format!("apt-cache policy {}", package);
        let args = to_args(&["policy", package]);
        let out = run_checked("apt-cache", &args, self.query_timeout, &operation).await?;
        Ok(parse_apt_policy(&out.stdout))
    }

    async fn flatpak_installed(&self, app_id: &str) -> Result<Option<String>, BackendError> {
        let operation = format!("flatpak info {}", app_id);
        let args = to_args(&["info", app_id]);
        let out = run_cmd_with_timeout("flatpak", &args, self.query_timeout, &operation)
            .await
            .map_err(exec_error)?;
        // non-zero exit: app not installed
        if !out.success() {
            return Ok(None);
        }
        let version = parse_flatpak_version(&out.stdout).unwrap_or_default();
        Ok(Some(version))
    }

    async fn flatpak_latest(
        &self,
        remote: &str,
        app_id: &str,
    ) -> Result<Option<String>, BackendError> {
        let operation = format!("flatpak remote-info {} {}", remote, app_id);
        let args = to_args(&["remote-info", remote, app_id]);
        let out = run_checked("flatpak", &args, self.query_timeout, &operation).await?;
        Ok(parse_flatpak_version(&out.stdout))
    }

    async fn latest_release(&self, repo: &str, pattern: &str) -> Result<String, BackendError> {
        let resolved = resolve_latest(
            &self.client,
            &self.api_base,
            repo,
            pattern,
            self.arch,
            self.query_timeout,
        )
        .await?;
        Ok(resolved.version)
    }

    async fn deb_installed(&self, package: &str) -> Result<Option<String>, BackendError> {
        let operation = format!("dpkg-query -W {}", package);
        let args = to_args(&["-W", "-f=${db:Status-Status} ${Version}", package]);
        let out = run_cmd_with_timeout("dpkg-query", &args, self.query_timeout, &operation)
            .await
            .map_err(exec_error)?;
        // dpkg-query exits 1 for packages it has never seen
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_dpkg_query(&out.stdout))
    }
}

fn status_for(installed: Option<&str>, latest: Option<&str>) -> UpdateStatus {
    match (installed, latest) {
        (None, _) => UpdateStatus::NotInstalled,
        (Some(""), _) | (Some(_), None) => UpdateStatus::Unknown,
        (Some(i), Some(l)) if i == l => UpdateStatus::UpToDate,
        (Some(_), Some(_)) => UpdateStatus::UpdateAvailable,
    }
}

async fn check_apt(id: &str, package: &str, source: &dyn VersionSource) -> UpdateReport {
    let mut report = UpdateReport::new(id, package, "apt");
    let policy = match source.apt_policy(package).await {
        Ok(p) => p,
        Err(e) => return report.failed(e),
    };
    if policy.installed.is_none() && policy.candidate.is_none() {
        report.detail = Some("package is not known to apt".to_string());
        return report;
    }
    report.status = status_for(policy.installed.as_deref(), policy.candidate.as_deref());
    report.installed = policy.installed;
    report.latest = policy.candidate;
    report
}

async fn check_flatpak(
    id: &str,
    remote: &str,
    app_id: &str,
    source: &dyn VersionSource,
) -> UpdateReport {
    let mut report = UpdateReport::new(id, app_id, "flatpak");
    report.installed = match source.flatpak_installed(app_id).await {
        Ok(v) => v,
        Err(e) => return report.failed(e),
    };
    match source.flatpak_latest(remote, app_id).await {
        Ok(latest) => {
            report.status = status_for(report.installed.as_deref(), latest.as_deref());
            report.latest = latest;
            report
        }
        Err(e) => report.failed(e),
    }
}

async fn check_release(entry: &ReleaseEntry, source: &dyn VersionSource) -> UpdateReport {
    let mut report = UpdateReport::new(&entry.id, &entry.repo, "latest-release");
    match source.latest_release(&entry.repo, &entry.asset_pattern).await {
        Ok(v) => report.latest = Some(v),
        Err(e) => return report.failed(e),
    }
    let Some(package) = entry.package.as_deref() else {
        return report.manual("no package name configured".into());
    };
    match source.deb_installed(package).await {
        Ok(installed) => {
            let upstream = installed.as_deref().map(upstream_version);
            report.status = status_for(upstream, report.latest.as_deref());
            report.installed = installed;
            report
        }
        Err(e) => report.failed(e),
    }
}

fn log_report(report: &UpdateReport) {
    match report.status {
        UpdateStatus::Unknown => warn!(
            "[PHASE: updates] [STEP: {}] Could not check {}: {}",
            report.id,
            report.name,
            report.detail.as_deref().unwrap_or("no version reported")
        ),
        _ => info!(
            "[PHASE: updates] [STEP: {}] {} is {} (installed={:?}, latest={:?})",
            report.id,
            report.name,
            report.status.as_str(),
            report.installed,
            report.latest
        ),
    }
}

pub fn updates_available(reports: &[UpdateReport]) -> usize {
    reports
        .iter()
        .filter(|r| r.status == UpdateStatus::UpdateAvailable)
        .count()
}

/// Check every catalog entry against its source. A failed lookup marks that entry `Unknown`
/// and the check moves on.
pub async fn check_updates(settings: &Settings, source: &dyn VersionSource) -> Vec<UpdateReport> {
    let apps = &settings.apps;
    let mut reports = Vec::new();

    for entry in &apps.system_packages {
        for package in &entry.packages {
            reports.push(check_apt(&entry.id, package, source).await);
        }
    }
    let remote = &settings.system.flatpak_remote;
    for entry in &apps.flatpaks {
        let report = check_flatpak(&entry.id, remote, &entry.app_id, source).await;
        reports.push(report);
    }
    for entry in &apps.direct_downloads {
        let report = UpdateReport::new(&entry.id, &entry.url, "direct-download");
        reports.push(report.manual(format!("download page: {}", entry.url)));
    }
    for entry in &apps.latest_releases {
        reports.push(check_release(entry, source).await);
    }
    for entry in &apps.archives {
        let report = UpdateReport::new(&entry.id, &entry.url, "archive");
        reports.push(report.manual(format!("archive source: {}", entry.url)));
    }

    for report in &reports {
        log_report(report);
    }
    info!(
        "[PHASE: updates] [STEP: done] [SUCCESS] Update check finished (checked={}, available={})",
        reports.len(),
        updates_available(&reports)
    );
    reports
}

pub fn render_reports(reports: &[UpdateReport]) -> String {
    let mut out = String::new();
    for r in reports {
        let _ = writeln!(
            out,
            "{:<14} {:<32} {:<16} {} -> {}",
            r.id,
            r.name,
            r.status.as_str(),
            r.installed.as_deref().unwrap_or("-"),
            r.latest.as_deref().unwrap_or("-")
        );
        if let Some(detail) = &r.detail {
            let _ = writeln!(out, "{:<14} {}", "", detail);
        }
    }
    let _ = writeln!(out, "{} update(s) available", updates_available(reports));
    out
}
