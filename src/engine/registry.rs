// Step registry
//
// Turns the configured catalog into the ordered, validated step list. Pure: no I/O.
// Order: configure (index refresh, flatpak remote), install (apt, flatpak, direct, latest release,
// archives; each list in declared order), cleanup (autoremove, clean cache, purge downloads).

use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

use crate::models::step::{BackendKind, BackendRef, Phase, Step, Target};
use crate::settings::Settings;
use crate::utils::validation::{
    slugify, validate_download_url, validate_flatpak_id, validate_package_name,
    validate_release_repo, validate_sha256_hex,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate step id '{0}'")]
    DuplicateId(String),
    #[error("duplicate catalog entry '{0}'")]
    DuplicateEntry(String),
    #[error("step '{0}' has an empty backend chain")]
    EmptyChain(String),
    #[error("step '{step}': target '{target}' is not supported by backend '{kind}'")]
    UnsupportedTarget {
        step: String,
        target: String,
        kind: BackendKind,
    },
    #[error("catalog entry '{entry}': {detail}")]
    InvalidEntry { entry: String, detail: String },
    #[error("step '{step}' ({phase}) comes after a {previous} step; phases must run configure, install, cleanup")]
    PhaseOrder {
        step: String,
        phase: Phase,
        previous: Phase,
    },
}

fn invalid(entry: &str, detail: impl std::fmt::Display) -> RegistryError {
    RegistryError::InvalidEntry {
        entry: entry.to_string(),
        detail: detail.to_string(),
    }
}

struct Builder {
    steps: Vec<Step>,
    entry_ids: HashSet<String>,
}

impl Builder {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            entry_ids: HashSet::new(),
        }
    }

    fn claim(&mut self, entry: &str) -> Result<String, RegistryError> {
        let slug = slugify(entry);
        if slug.is_empty() {
            return Err(invalid(entry, "id must contain letters or digits"));
        }
        if !self.entry_ids.insert(slug.clone()) {
            return Err(RegistryError::DuplicateEntry(entry.to_string()));
        }
        Ok(slug)
    }

    fn push(&mut self, slug: &str, description: &str, phase: Phase, backends: Vec<BackendRef>) {
        let id = format!("{:03}-{}", self.steps.len() + 1, slug);
        self.steps.push(Step {
            id,
            description: description.to_string(),
            phase,
            backends,
        });
    }
}

fn fallback_flatpak(
    entry: &str,
    app_id: Option<&str>,
    remote: &str,
) -> Result<Option<BackendRef>, RegistryError> {
    let Some(app_id) = app_id else {
        return Ok(None);
    };
    validate_flatpak_id(app_id).map_err(|e| invalid(entry, e))?;
    Ok(Some(BackendRef::new(
        BackendKind::SandboxedApp,
        Target::FlatpakApp {
            remote: remote.to_string(),
            app_id: app_id.to_string(),
        },
    )))
}

fn check_sha(entry: &str, sha256: Option<&str>) -> Result<(), RegistryError> {
    if let Some(digest) = sha256 {
        validate_sha256_hex(digest).map_err(|e| invalid(entry, e))?;
    }
    Ok(())
}

/// Build the ordered step list from settings.
pub fn build(settings: &Settings) -> Result<Vec<Step>, RegistryError> {
    let sys = &settings.system;
    let apps = &settings.apps;
    let remote = sys.flatpak_remote.as_str();
    let mut b = Builder::new();

    // configure
    if sys.refresh_package_index {
        b.push(
            "refresh-package-index",
            "Refresh package index",
            Phase::Configure,
            vec![BackendRef::new(BackendKind::SystemPackage, Target::RefreshIndex)],
        );
    }
    if sys.enable_flathub {
        validate_download_url(&sys.flatpak_remote_url).map_err(|e| invalid(remote, e))?;
        b.push(
            &format!("flatpak-remote-{}", slugify(remote)),
            &format!("Register flatpak remote '{}'", remote),
            Phase::Configure,
            vec![BackendRef::new(
                BackendKind::SandboxedApp,
                Target::FlatpakRemote {
                    name: remote.to_string(),
                    url: sys.flatpak_remote_url.clone(),
                },
            )],
        );
    }

    // install
    for e in &apps.system_packages {
        let slug = b.claim(&e.id)?;
        if e.packages.is_empty() {
            return Err(invalid(&e.id, "no packages listed"));
        }
        for p in &e.packages {
            validate_package_name(p).map_err(|err| invalid(&e.id, err))?;
        }
        b.push(
            &format!("apt-{}", slug),
            &e.description,
            Phase::Install,
            vec![BackendRef::new(
                BackendKind::SystemPackage,
                Target::Packages {
                    names: e.packages.clone(),
                },
            )],
        );
    }

    for e in &apps.flatpaks {
        let slug = b.claim(&e.id)?;
        validate_flatpak_id(&e.app_id).map_err(|err| invalid(&e.id, err))?;
        b.push(
            &format!("flatpak-{}", slug),
            &e.description,
            Phase::Install,
            vec![BackendRef::new(
                BackendKind::SandboxedApp,
                Target::FlatpakApp {
                    remote: remote.to_string(),
                    app_id: e.app_id.clone(),
                },
            )],
        );
    }

    for e in &apps.direct_downloads {
        let slug = b.claim(&e.id)?;
        validate_download_url(&e.url).map_err(|err| invalid(&e.id, err))?;
        check_sha(&e.id, e.sha256.as_deref())?;
        let mut chain = vec![BackendRef::new(
            BackendKind::DirectDownload,
            Target::DebUrl {
                url: e.url.clone(),
                sha256: e.sha256.clone(),
            },
        )];
        chain.extend(fallback_flatpak(&e.id, e.fallback_flatpak.as_deref(), remote)?);
        b.push(
            &format!("deb-{}", slug),
            &e.description,
            Phase::Install,
            chain,
        );
    }

    for e in &apps.latest_releases {
        let slug = b.claim(&e.id)?;
        validate_release_repo(&e.repo).map_err(|err| invalid(&e.id, err))?;
        Regex::new(&e.asset_pattern)
            .map_err(|err| invalid(&e.id, format!("invalid asset pattern: {}", err)))?;
        let mut chain = vec![BackendRef::new(
            BackendKind::DirectDownload,
            Target::LatestRelease {
                repo: e.repo.clone(),
                asset_pattern: e.asset_pattern.clone(),
            },
        )];
        chain.extend(fallback_flatpak(&e.id, e.fallback_flatpak.as_deref(), remote)?);
        b.push(
            &format!("release-{}", slug),
            &e.description,
            Phase::Install,
            chain,
        );
    }

    for e in &apps.archives {
        let slug = b.claim(&e.id)?;
        validate_download_url(&e.url).map_err(|err| invalid(&e.id, err))?;
        check_sha(&e.id, e.sha256.as_deref())?;
        if e.destination.as_os_str().is_empty() {
            return Err(invalid(&e.id, "destination is required"));
        }
        b.push(
            &format!("archive-{}", slug),
            &e.description,
            Phase::Install,
            vec![BackendRef::new(
                BackendKind::Archive,
                Target::Archive {
                    url: e.url.clone(),
                    sha256: e.sha256.clone(),
                    destination: e.destination.clone(),
                },
            )],
        );
    }

    // cleanup
    if sys.cleanup_after_install {
        b.push(
            "autoremove",
            "Remove unused packages",
            Phase::Cleanup,
            vec![BackendRef::new(BackendKind::SystemPackage, Target::Autoremove)],
        );
        b.push(
            "clean-package-cache",
            "Clean package cache",
            Phase::Cleanup,
            vec![BackendRef::new(BackendKind::SystemPackage, Target::CleanCache)],
        );
    }
    if sys.purge_downloads {
        b.push(
            "purge-downloads",
            "Purge download cache",
            Phase::Cleanup,
            vec![BackendRef::new(
                BackendKind::DirectDownload,
                Target::PurgeDownloads,
            )],
        );
    }

    validate(&b.steps)?;
    Ok(b.steps)
}

/// Structural checks every step list must pass before a run.
pub fn validate(steps: &[Step]) -> Result<(), RegistryError> {
    let mut ids = HashSet::new();
    let mut previous = Phase::Configure;
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(RegistryError::DuplicateId(step.id.clone()));
        }
        // registry position is both execution order and checkpoint order
        if step.phase < previous {
            return Err(RegistryError::PhaseOrder {
                step: step.id.clone(),
                phase: step.phase,
                previous,
            });
        }
        previous = step.phase;
        if step.backends.is_empty() {
            return Err(RegistryError::EmptyChain(step.id.clone()));
        }
        for r in &step.backends {
            if !r.target.supported_by(r.kind) {
                return Err(RegistryError::UnsupportedTarget {
                    step: step.id.clone(),
                    target: r.target.label(),
                    kind: r.kind,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AppCatalog, DirectDownloadEntry, PackageEntry};

    fn minimal_settings() -> Settings {
        let mut s = Settings::default();
        s.apps = AppCatalog {
            system_packages: vec![PackageEntry {
                id: "vlc".to_string(),
                description: "VLC".to_string(),
                packages: vec!["vlc".to_string()],
            }],
            flatpaks: Vec::new(),
            direct_downloads: vec![DirectDownloadEntry {
                id: "discord".to_string(),
                description: "Discord".to_string(),
                url: "https://discord.com/api/download?platform=linux&format=deb".to_string(),
                sha256: None,
                fallback_flatpak: Some("com.discordapp.Discord".to_string()),
            }],
            latest_releases: Vec::new(),
            archives: Vec::new(),
        };
        s
    }

    #[test]
    fn phases_are_ordered_configure_install_cleanup() {
        let steps = build(&minimal_settings()).expect("build");
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "001-refresh-package-index",
                "002-flatpak-remote-flathub",
                "003-apt-vlc",
                "004-deb-discord",
                "005-autoremove",
                "006-clean-package-cache",
                "007-purge-downloads",
            ]
        );
        let phases: Vec<Phase> = steps.iter().map(|s| s.phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
    }

    #[test]
    fn direct_download_with_fallback_gets_two_backend_chain() {
        let steps = build(&minimal_settings()).expect("build");
        let discord = steps.iter().find(|s| s.id.ends_with("deb-discord")).expect("discord");
        let kinds: Vec<BackendKind> = discord.backends.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BackendKind::DirectDownload, BackendKind::SandboxedApp]
        );
    }

    #[test]
    fn default_catalog_builds_and_ids_sort_in_registry_order() {
        let steps = build(&Settings::default()).expect("default catalog is valid");
        assert!(steps.len() > 20);
        let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        let rustdesk = steps
            .iter()
            .find(|s| s.id.ends_with("release-rustdesk"))
            .expect("rustdesk step");
        assert_eq!(rustdesk.backends.len(), 2);
    }

    #[test]
    fn disabled_system_options_drop_their_steps() {
        let mut s = minimal_settings();
        s.system.refresh_package_index = false;
        s.system.enable_flathub = false;
        s.system.cleanup_after_install = false;
        s.system.purge_downloads = false;
        let steps = build(&s).expect("build");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "001-apt-vlc");
    }

    #[test]
    fn malformed_url_is_rejected() {
        let mut s = minimal_settings();
        s.apps.direct_downloads[0].url = "ftp://nowhere/x.deb".to_string();
        let err = build(&s).expect_err("bad url");
        assert!(matches!(err, RegistryError::InvalidEntry { ref entry, .. } if entry == "discord"));
    }

    #[test]
    fn bad_package_name_is_rejected() {
        let mut s = minimal_settings();
        s.apps.system_packages[0].packages = vec!["vlc; reboot".to_string()];
        assert!(matches!(
            build(&s),
            Err(RegistryError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn duplicate_catalog_entries_are_rejected() {
        let mut s = minimal_settings();
        let dup = s.apps.system_packages[0].clone();
        s.apps.system_packages.push(dup);
        assert_eq!(
            build(&s),
            Err(RegistryError::DuplicateEntry("vlc".to_string()))
        );
    }

    #[test]
    fn validate_rejects_structural_problems() {
        let step = |id: &str, backends: Vec<BackendRef>| Step {
            id: id.to_string(),
            description: id.to_string(),
            phase: Phase::Install,
            backends,
        };
        let apt = || BackendRef::new(BackendKind::SystemPackage, Target::RefreshIndex);

        assert_eq!(
            validate(&[step("001-a", vec![apt()]), step("001-a", vec![apt()])]),
            Err(RegistryError::DuplicateId("001-a".to_string()))
        );
        assert_eq!(
            validate(&[step("001-a", vec![])]),
            Err(RegistryError::EmptyChain("001-a".to_string()))
        );
        let wrong = BackendRef::new(BackendKind::Archive, Target::RefreshIndex);
        assert!(matches!(
            validate(&[step("001-a", vec![wrong])]),
            Err(RegistryError::UnsupportedTarget { .. })
        ));
    }

    #[test]
    fn validate_rejects_phase_going_backwards() {
        let step = |id: &str, phase: Phase| Step {
            id: id.to_string(),
            description: id.to_string(),
            phase,
            backends: vec![BackendRef::new(
                BackendKind::SystemPackage,
                Target::RefreshIndex,
            )],
        };

        let interleaved = [
            step("001-a", Phase::Install),
            step("002-b", Phase::Configure),
            step("003-c", Phase::Install),
        ];
        assert_eq!(
            validate(&interleaved),
            Err(RegistryError::PhaseOrder {
                step: "002-b".to_string(),
                phase: Phase::Configure,
                previous: Phase::Install,
            })
        );

        let ordered = [
            step("001-a", Phase::Configure),
            step("002-b", Phase::Install),
            step("003-c", Phase::Install),
            step("004-d", Phase::Cleanup),
        ];
        assert_eq!(validate(&ordered), Ok(()));
        assert_eq!(validate(&ordered[1..]), Ok(()), "a phase may be empty");
    }
}
