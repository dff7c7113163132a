// "Latest release" resolution against a GitHub-style release index
//
// Any failure to resolve (HTTP error, no release, no matching asset) is permanent: the step falls
// through to its next backend rather than retrying the index.

use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use tokio::time::{timeout, Duration};

use super::linux_parsers::version_from_tag;
use super::BackendError;
use crate::utils::os_detection::Architecture;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub version: String,
    pub name: String,
    pub url: String,
}

/// First asset matching `pattern` that is built for `arch`.
///
/// Assets without any architecture marker are accepted only when no arch-specific one matches.
pub fn select_release_asset<'a>(
    release: &'a Release,
    pattern: &Regex,
    arch: Architecture,
) -> Option<&'a ReleaseAsset> {
    let aliases = arch.asset_aliases();
    let all_aliases: Vec<&str> = [
        Architecture::X86_64,
        Architecture::Aarch64,
        Architecture::Armhf,
    ]
    .iter()
    .flat_map(|a| a.asset_aliases().iter().copied())
    .collect();

    let candidates: Vec<&ReleaseAsset> = release
        .assets
        .iter()
        .filter(|a| pattern.is_match(&a.name))
        .collect();

    let mentions = |name: &str, list: &[&str]| {
        let lower = name.to_ascii_lowercase();
        list.iter().any(|alias| lower.contains(alias))
    };

    candidates
        .iter()
        .find(|a| mentions(&a.name, aliases))
        .or_else(|| candidates.iter().find(|a| !mentions(&a.name, &all_aliases)))
        .copied()
}

fn permanent(repo: &str, detail: impl std::fmt::Display) -> BackendError {
    BackendError::Permanent(format!(
        "Could not resolve latest release for {}: {}",
        repo, detail
    ))
}

/// Query `<api_base>/repos/<repo>/releases/latest` and pick the asset for this host.
pub async fn resolve_latest(
    client: &reqwest::Client,
    api_base: &str,
    repo: &str,
    asset_pattern: &str,
    arch: Architecture,
    timeout_dur: Duration,
) -> Result<ResolvedAsset, BackendError> {
    let pattern = Regex::new(asset_pattern)
        .map_err(|e| permanent(repo, format!("invalid asset pattern: {}", e)))?;
    let url = format!(
        "{}/repos/{}/releases/latest",
        api_base.trim_end_matches('/'),
        repo
    );
    debug!(
        "[PHASE: install] [STEP: release] resolve_latest entered (repo={}, url={}, arch={:?})",
        repo, url, arch
    );

    let request = client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .send();
    let response = match timeout(timeout_dur, request).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return Err(permanent(repo, e)),
        Err(_) => return Err(permanent(repo, "release index timed out")),
    };
    if !response.status().is_success() {
        return Err(permanent(repo, format!("HTTP {}", response.status())));
    }
    let release: Release = match timeout(timeout_dur, response.json()).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return Err(permanent(repo, e)),
        Err(_) => return Err(permanent(repo, "release index timed out")),
    };

    let asset = select_release_asset(&release, &pattern, arch).ok_or_else(|| {
        permanent(
            repo,
            format!(
                "no asset matching '{}' for {:?} in {}",
                asset_pattern, arch, release.tag_name
            ),
        )
    })?;

    let resolved = ResolvedAsset {
        version: version_from_tag(&release.tag_name),
        name: asset.name.clone(),
        url: asset.browser_download_url.clone(),
    };
    info!(
        "[PHASE: install] [STEP: release] Resolved latest release (repo={}, version={}, asset={})",
        repo, resolved.version, resolved.name
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::scripted::serve_http;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.invalid/{}", name),
        }
    }

    fn rustdesk_release() -> Release {
        Release {
            tag_name: "1.3.2".to_string(),
            assets: vec![
                asset("rustdesk-1.3.2-aarch64.deb"),
                asset("rustdesk-1.3.2-x86_64.deb"),
                asset("rustdesk-1.3.2-x86_64.AppImage"),
                asset("rustdesk-1.3.2-armv7-sciter.deb"),
            ],
        }
    }

    #[test]
    fn picks_deb_for_host_arch() {
        let re = Regex::new(r"\.deb$").expect("regex");
        let r = rustdesk_release();
        let x86 = select_release_asset(&r, &re, Architecture::X86_64).expect("x86 asset");
        assert_eq!(x86.name, "rustdesk-1.3.2-x86_64.deb");
        let arm = select_release_asset(&r, &re, Architecture::Aarch64).expect("arm asset");
        assert_eq!(arm.name, "rustdesk-1.3.2-aarch64.deb");
    }

    #[test]
    fn arch_neutral_asset_is_a_fallback() {
        let re = Regex::new(r"\.deb$").expect("regex");
        let r = Release {
            tag_name: "v2.0".to_string(),
            assets: vec![asset("tool_2.0_all.deb"), asset("tool_2.0_arm64.deb")],
        };
        let got = select_release_asset(&r, &re, Architecture::X86_64).expect("neutral asset");
        assert_eq!(got.name, "tool_2.0_all.deb");
    }

    #[test]
    fn no_matching_asset() {
        let re = Regex::new(r"\.deb$").expect("regex");
        let r = Release {
            tag_name: "v1".to_string(),
            assets: vec![asset("tool.AppImage")],
        };
        assert!(select_release_asset(&r, &re, Architecture::X86_64).is_none());
    }

    #[tokio::test]
    async fn resolves_against_index() {
        let body = r#"{"tag_name":"v1.3.2","assets":[
            {"name":"rustdesk-1.3.2-x86_64.deb","browser_download_url":"https://dl.example/x86.deb"},
            {"name":"rustdesk-1.3.2-aarch64.deb","browser_download_url":"https://dl.example/arm.deb"}]}"#;
        let base = serve_http(vec![(200, body.to_string())]).await;
        let client = reqwest::Client::new();
        let got = resolve_latest(
            &client,
            &base,
            "rustdesk/rustdesk",
            r"\.deb$",
            Architecture::X86_64,
            Duration::from_secs(5),
        )
        .await
        .expect("resolve");
        assert_eq!(got.version, "1.3.2");
        assert_eq!(got.url, "https://dl.example/x86.deb");
    }

    #[tokio::test]
    async fn index_errors_are_permanent() {
        let base = serve_http(vec![(503, "down".to_string())]).await;
        let client = reqwest::Client::new();
        let err = resolve_latest(
            &client,
            &base,
            "rustdesk/rustdesk",
            r"\.deb$",
            Architecture::X86_64,
            Duration::from_secs(5),
        )
        .await
        .expect_err("should fail");
        assert!(matches!(err, BackendError::Permanent(_)), "got {:?}", err);
    }
}
