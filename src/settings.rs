// Run configuration
//
// Layering: built-in defaults -> TOML file -> LUMI_SETUP__SECTION__KEY environment variables.
// The app catalog is input data only; the registry turns it into steps.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::logging::DEFAULT_MAX_LOG_BYTES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub preflight: PreflightSettings,
    pub paths: PathSettings,
    pub logging: LoggingSettings,
    pub system: SystemOptions,
    pub apps: AppCatalog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per backend for transient failures (first try included).
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub download_secs: u64,
    pub install_secs: u64,
    pub query_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            download_secs: 60,
            install_secs: 900,
            query_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightSettings {
    pub check_network: bool,
    pub connectivity_url: String,
    pub connectivity_timeout_secs: u64,
    pub require_root: bool,
}

impl Default for PreflightSettings {
    fn default() -> Self {
        Self {
            check_network: true,
            connectivity_url: "http://connectivity-check.ubuntu.com/".to_string(),
            connectivity_timeout_secs: 10,
            require_root: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// File log level; stdout follows `--debug`.
    pub level: String,
    pub max_log_size_mb: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            max_log_size_mb: DEFAULT_MAX_LOG_BYTES / (1024 * 1024),
        }
    }
}

impl LoggingSettings {
    pub fn max_log_bytes(&self) -> u64 {
        self.max_log_size_mb.max(1).saturating_mul(1024 * 1024)
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Debug)
    }
}

/// System-level switches; reported verbatim in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemOptions {
    pub refresh_package_index: bool,
    pub enable_flathub: bool,
    pub flatpak_remote: String,
    pub flatpak_remote_url: String,
    pub cleanup_after_install: bool,
    pub purge_downloads: bool,
    /// Permit one relaxed-verification attempt after a signature rejection.
    pub allow_relaxed_verification: bool,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            refresh_package_index: true,
            enable_flathub: true,
            flatpak_remote: "flathub".to_string(),
            flatpak_remote_url: "https://dl.flathub.org/repo/flathub.flatpakrepo".to_string(),
            cleanup_after_install: true,
            purge_downloads: true,
            allow_relaxed_verification: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageEntry {
    pub id: String,
    pub description: String,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatpakEntry {
    pub id: String,
    pub description: String,
    pub app_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectDownloadEntry {
    pub id: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Flatpak app used when the direct download fails for any reason.
    #[serde(default)]
    pub fallback_flatpak: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub id: String,
    pub description: String,
    /// `owner/name` on the release index.
    pub repo: String,
    /// Regex the asset name must match in addition to the architecture check.
    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,
    #[serde(default)]
    pub fallback_flatpak: Option<String>,
    /// dpkg package the release installs, used to read the installed version.
    #[serde(default)]
    pub package: Option<String>,
}

fn default_asset_pattern() -> String {
    r"\.deb$".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub id: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCatalog {
    pub system_packages: Vec<PackageEntry>,
    pub flatpaks: Vec<FlatpakEntry>,
    pub direct_downloads: Vec<DirectDownloadEntry>,
    pub latest_releases: Vec<ReleaseEntry>,
    pub archives: Vec<ArchiveEntry>,
}

fn pkg(id: &str, description: &str, packages: &[&str]) -> PackageEntry {
    PackageEntry {
        id: id.to_string(),
        description: description.to_string(),
        packages: packages.iter().map(|p| p.to_string()).collect(),
    }
}

fn flatpak(id: &str, description: &str, app_id: &str) -> FlatpakEntry {
    FlatpakEntry {
        id: id.to_string(),
        description: description.to_string(),
        app_id: app_id.to_string(),
    }
}

impl Default for AppCatalog {
    fn default() -> Self {
        Self {
            system_packages: vec![
                pkg("firefox", "Firefox web browser", &["firefox"]),
                pkg("vlc", "VLC media player", &["vlc"]),
                pkg("gimp", "GIMP image editor", &["gimp"]),
                pkg("libreoffice", "LibreOffice suite", &["libreoffice"]),
                pkg("git", "Git version control", &["git"]),
                pkg("python3", "Python 3 with pip", &["python3", "python3-pip"]),
                pkg("htop", "htop process viewer", &["htop"]),
                pkg("curl", "curl", &["curl"]),
                pkg("wget", "wget", &["wget"]),
                pkg("zip", "zip utilities", &["zip", "unzip"]),
            ],
            flatpaks: vec![
                flatpak("thunderbird", "Thunderbird mail", "org.mozilla.Thunderbird"),
                flatpak(
                    "onlyoffice",
                    "ONLYOFFICE desktop editors",
                    "org.onlyoffice.desktopeditors",
                ),
                flatpak("telegram", "Telegram desktop", "org.telegram.desktop"),
            ],
            direct_downloads: vec![
                DirectDownloadEntry {
                    id: "discord".to_string(),
                    description: "Discord".to_string(),
                    url: "https://discord.com/api/download?platform=linux&format=deb".to_string(),
                    sha256: None,
                    fallback_flatpak: Some("com.discordapp.Discord".to_string()),
                },
                DirectDownloadEntry {
                    id: "zoom".to_string(),
                    description: "Zoom meetings".to_string(),
                    url: "https://zoom.us/client/latest/zoom_amd64.deb".to_string(),
                    sha256: None,
                    fallback_flatpak: Some("us.zoom.Zoom".to_string()),
                },
                DirectDownloadEntry {
                    id: "teamviewer".to_string(),
                    description: "TeamViewer".to_string(),
                    url: "https://download.teamviewer.com/download/linux/teamviewer_amd64.deb"
                        .to_string(),
                    sha256: None,
                    fallback_flatpak: None,
                },
            ],
            latest_releases: vec![ReleaseEntry {
                id: "rustdesk".to_string(),
                description: "RustDesk remote desktop".to_string(),
                repo: "rustdesk/rustdesk".to_string(),
                asset_pattern: default_asset_pattern(),
                fallback_flatpak: Some("com.rustdesk.RustDesk".to_string()),
                package: Some("rustdesk".to_string()),
            }],
            archives: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file (required only when given explicitly),
    /// then environment overrides.
    pub fn load(explicit_file: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Settings::default())
            .context("Failed to build default configuration")?;

        let mut builder = Config::builder().add_source(defaults);

        match explicit_file {
            Some(path) => {
                let file = File::from(path).format(FileFormat::Toml).required(true);
                builder = builder.add_source(file);
            }
            None => {
                if let Some(path) = crate::utils::path_resolver::default_config_file() {
                    builder = builder
                        .add_source(File::from(path).format(FileFormat::Toml).required(false));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LUMI_SETUP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry.retry_delay_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.download_secs.max(1))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.install_secs.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.query_secs.max(1))
    }

    /// Options shown in the "configured system options" block of the summary.
    pub fn options_in_effect(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let s = &self.system;
        out.insert(
            "refresh_package_index".to_string(),
            s.refresh_package_index.to_string(),
        );
        out.insert("enable_flathub".to_string(), s.enable_flathub.to_string());
        out.insert("flatpak_remote".to_string(), s.flatpak_remote.clone());
        out.insert(
            "cleanup_after_install".to_string(),
            s.cleanup_after_install.to_string(),
        );
        out.insert("purge_downloads".to_string(), s.purge_downloads.to_string());
        out.insert(
            "allow_relaxed_verification".to_string(),
            s.allow_relaxed_verification.to_string(),
        );
        out.insert(
            "max_retries".to_string(),
            self.retry.max_retries.to_string(),
        );
        out.insert(
            "retry_delay_secs".to_string(),
            self.retry.retry_delay_secs.to_string(),
        );
        out.insert(
            "download_timeout_secs".to_string(),
            self.timeouts.download_secs.to_string(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.retry.max_retries, 3);
        assert_eq!(s.retry_delay(), Duration::from_secs(5));
        assert_eq!(s.download_timeout(), Duration::from_secs(60));
        assert_eq!(s.logging.max_log_bytes(), 10 * 1024 * 1024);
        assert!(s.system.allow_relaxed_verification);
    }

    #[test]
    fn default_catalog_has_fallbacks_for_fragile_sources() {
        let c = AppCatalog::default();
        let discord = c
            .direct_downloads
            .iter()
            .find(|d| d.id == "discord")
            .expect("discord entry");
        assert_eq!(
            discord.fallback_flatpak.as_deref(),
            Some("com.discordapp.Discord")
        );
        assert_eq!(c.latest_releases[0].repo, "rustdesk/rustdesk");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[retry]
max_retries = 5

[system]
enable_flathub = false

[apps]
system_packages = [{ id = "vim", description = "Vim editor", packages = ["vim"] }]
"#,
        )
        .expect("write config");

        let s = Settings::load(Some(&path)).expect("load");
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.retry.retry_delay_secs, 5, "unset keys keep their default");
        assert!(!s.system.enable_flathub);
        assert_eq!(s.apps.system_packages.len(), 1);
        assert_eq!(s.apps.system_packages[0].packages, vec!["vim".to_string()]);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn toml_rendering_round_trips() {
        let s = Settings::default();
        let text = s.to_toml().expect("render");
        let back: Settings = toml::from_str(&text).expect("parse");
        assert_eq!(back.apps.flatpaks, s.apps.flatpaks);
        assert_eq!(back.retry.max_retries, s.retry.max_retries);
    }

    #[test]
    fn options_in_effect_lists_retry_budget() {
        let opts = Settings::default().options_in_effect();
        assert_eq!(opts.get("max_retries").map(String::as_str), Some("3"));
        assert_eq!(
            opts.get("flatpak_remote").map(String::as_str),
            Some("flathub")
        );
    }
}
