// Step and backend model
//
// Steps are immutable once the registry has built them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configure,
    Install,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Install => "install",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    SystemPackage,
    SandboxedApp,
    DirectDownload,
    Archive,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::SystemPackage => "system-package",
            BackendKind::SandboxedApp => "sandboxed-app",
            BackendKind::DirectDownload => "direct-download",
            BackendKind::Archive => "archive",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static properties of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Supports a cheap, side-effect-free availability check.
    pub checks_availability: bool,
    pub needs_network: bool,
    /// Safe to re-run install blindly; otherwise dependency repair runs first.
    pub idempotent: bool,
    /// Supports a relaxed-verification mode.
    pub relaxable: bool,
}

/// What a backend reference asks its backend to acquire and install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    RefreshIndex,
    Packages {
        names: Vec<String>,
    },
    FlatpakRemote {
        name: String,
        url: String,
    },
    FlatpakApp {
        remote: String,
        app_id: String,
    },
    DebUrl {
        url: String,
        sha256: Option<String>,
    },
    LatestRelease {
        repo: String,
        asset_pattern: String,
    },
    Archive {
        url: String,
        sha256: Option<String>,
        destination: PathBuf,
    },
    Autoremove,
    CleanCache,
    PurgeDownloads,
}

impl Target {
    /// Backend kinds able to service this target.
    pub fn supported_by(&self, kind: BackendKind) -> bool {
        use BackendKind::*;
        match self {
            Target::RefreshIndex | Target::Packages { .. } => kind == SystemPackage,
            Target::Autoremove | Target::CleanCache => kind == SystemPackage,
            Target::FlatpakRemote { .. } | Target::FlatpakApp { .. } => kind == SandboxedApp,
            Target::DebUrl { .. } | Target::LatestRelease { .. } => kind == DirectDownload,
            Target::PurgeDownloads => kind == DirectDownload,
            Target::Archive { .. } => kind == Archive,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Target::RefreshIndex => "refresh-index".to_string(),
            Target::Packages { names } => names.join(" "),
            Target::FlatpakRemote { name, .. } => format!("remote:{}", name),
            Target::FlatpakApp { app_id, .. } => app_id.clone(),
            Target::DebUrl { url, .. } => url.clone(),
            Target::LatestRelease { repo, .. } => format!("latest:{}", repo),
            Target::Archive { url, .. } => url.clone(),
            Target::Autoremove => "autoremove".to_string(),
            Target::CleanCache => "clean-cache".to_string(),
            Target::PurgeDownloads => "purge-downloads".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub kind: BackendKind,
    pub target: Target,
}

impl BackendRef {
    pub fn new(kind: BackendKind, target: Target) -> Self {
        Self { kind, target }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// `NNN-<slug>`; lexical order matches registry order.
    pub id: String,
    pub description: String,
    pub phase: Phase,
    /// Ordered fallback chain; never empty.
    pub backends: Vec<BackendRef>,
}
