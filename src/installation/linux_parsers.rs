// Linux parsing utilities (cross-platform for testability)
//
// Pure functions over the text that apt, dpkg, flatpak and /etc/os-release produce.
// The backends run the commands; everything that interprets their output lives here.

/// Linux distribution information parsed from /etc/os-release.
#[derive(Debug, Clone, Default)]
pub struct LinuxDistro {
    /// Distribution ID (e.g., "ubuntu", "debian", "linuxmint").
    pub id: String,
    /// Version ID (e.g., "22.04", "12").
    pub version_id: String,
    /// Human-readable name (e.g., "Ubuntu 22.04.3 LTS").
    pub pretty_name: String,
    /// Related distributions (e.g., ["ubuntu", "debian"]).
    pub id_like: Vec<String>,
}

/// Parse /etc/os-release content into a LinuxDistro struct.
pub fn parse_os_release(contents: &str) -> LinuxDistro {
    let mut id = String::new();
    let mut version_id = String::new();
    let mut pretty_name = String::new();
    let mut id_like = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // KEY=VALUE, KEY="VALUE" or KEY='VALUE'
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = unquote(value.trim());

            match key {
                "ID" => id = value.to_string(),
                "VERSION_ID" => version_id = value.to_string(),
                "PRETTY_NAME" => pretty_name = value.to_string(),
                "ID_LIKE" => {
                    id_like = value.split_whitespace().map(|s| s.to_string()).collect();
                }
                _ => {}
            }
        }
    }

    if id.is_empty() {
        id = "linux".to_string();
    }
    if pretty_name.is_empty() {
        pretty_name = if version_id.is_empty() {
            id.clone()
        } else {
            format!("{} {}", id, version_id)
        };
    }

    LinuxDistro {
        id,
        version_id,
        pretty_name,
        id_like,
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

/// Installed/candidate versions reported by `apt-cache policy <pkg>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AptPolicy {
    pub installed: Option<String>,
    pub candidate: Option<String>,
}

impl AptPolicy {
    pub fn is_up_to_date(&self) -> bool {
        matches!((&self.installed, &self.candidate), (Some(i), Some(c)) if i == c)
    }
}

/// Parse `apt-cache policy` output for a single package.
///
/// `(none)` means "not installed" / "no candidate"; an unknown package yields empty output.
pub fn parse_apt_policy(contents: &str) -> AptPolicy {
    let mut policy = AptPolicy::default();

    for line in contents.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let parsed = if value.is_empty() || value == "(none)" {
            None
        } else {
            Some(value.to_string())
        };
        match key.trim() {
            "Installed" if policy.installed.is_none() => policy.installed = parsed,
            "Candidate" if policy.candidate.is_none() => policy.candidate = parsed,
            _ => {}
        }
    }

    policy
}

/// Extract the `Version:` field from `flatpak remote-info` output.
pub fn parse_flatpak_version(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() == "Version" && !value.trim().is_empty() {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Strip a leading `v`/`V` from a release tag (`v1.2.3` -> `1.2.3`).
pub fn version_from_tag(tag: &str) -> String {
    let tag = tag.trim();
    match tag.strip_prefix('v').or_else(|| tag.strip_prefix('V')) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => tag.to_string(),
    }
}

/// Parse `dpkg-query -W -f='${db:Status-Status} ${Version}'` output.
///
/// Only a package in the `installed` state yields a version; removed packages that left their
/// config files behind still report one, so the status has to be checked.
pub fn parse_dpkg_query(contents: &str) -> Option<String> {
    let (status, version) = contents.trim().split_once(' ')?;
    let version = version.trim();
    if status == "installed" && !version.is_empty() {
        Some(version.to_string())
    } else {
        None
    }
}

/// Upstream part of a Debian version (`1:2.3.4-1ubuntu1` -> `2.3.4`).
pub fn upstream_version(version: &str) -> &str {
    let without_epoch = match version.split_once(':') {
        Some((_, rest)) => rest,
        None => version,
    };
    match without_epoch.rsplit_once('-') {
        Some((upstream, _)) => upstream,
        None => without_epoch,
    }
}

/// Coarse classification of an external tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Verification,
    Permanent,
}

const LOCK_MARKERS: &[&str] = &[
    "could not get lock",
    "dpkg frontend lock",
    "unable to acquire the dpkg",
    "resource temporarily unavailable",
    "is another process using it",
];

const SIGNATURE_MARKERS: &[&str] = &[
    "no_pubkey",
    "is not signed",
    "gpg error",
    "signatures were invalid",
    "signature verification",
    "checksum mismatch",
    "hash sum mismatch",
];

const MISSING_MARKERS: &[&str] = &[
    "unable to locate package",
    "has no installation candidate",
    "no remote refs found",
    "nothing matches",
    "not found in remote",
    "404 not found",
];

const NETWORK_MARKERS: &[&str] = &[
    "temporary failure resolving",
    "could not resolve",
    "could not connect",
    "connection timed out",
    "connection refused",
    "network is unreachable",
    "failed to fetch",
    "timed out",
];

/// Classify combined stdout/stderr of a failed command.
///
/// Lock contention wins over everything else: a locked dpkg database says nothing about the
/// package itself. Unrecognised failures are permanent so they fall through to the next backend
/// instead of burning the retry budget.
pub fn classify_failure_output(output: &str) -> FailureClass {
    let lower = output.to_ascii_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(LOCK_MARKERS) {
        FailureClass::Transient
    } else if has(SIGNATURE_MARKERS) {
        FailureClass::Verification
    } else if has(MISSING_MARKERS) {
        FailureClass::Permanent
    } else if has(NETWORK_MARKERS) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Classify an HTTP status from a download or release-index request.
pub fn classify_http_status(status: u16) -> FailureClass {
    match status {
        408 | 425 | 429 => FailureClass::Transient,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// True when `dpkg -i` output reports unmet dependencies (fixable with `apt-get install -f`).
pub fn is_dependency_problem(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("dependency problems")
        || lower.contains("unmet dependencies")
        || (lower.contains("depends on") && lower.contains("is not installed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_os_release_ubuntu() {
        let contents = r#"
NAME="Ubuntu"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
PRETTY_NAME="Ubuntu 22.04.3 LTS"
VERSION_ID="22.04"
HOME_URL="https://www.ubuntu.com/"
"#;
        let distro = parse_os_release(contents);
        assert_eq!(distro.id, "ubuntu");
        assert_eq!(distro.version_id, "22.04");
        assert_eq!(distro.pretty_name, "Ubuntu 22.04.3 LTS");
        assert_eq!(distro.id_like, vec!["debian"]);
    }

    #[test]
    fn parse_os_release_with_multiple_id_like() {
        let contents = r#"
ID=linuxmint
ID_LIKE="ubuntu debian"
VERSION_ID="21.2"
"#;
        let distro = parse_os_release(contents);
        assert_eq!(distro.id, "linuxmint");
        assert_eq!(distro.id_like, vec!["ubuntu", "debian"]);
        assert_eq!(distro.pretty_name, "linuxmint 21.2");
    }

    #[test]
    fn parse_os_release_empty_uses_defaults() {
        let distro = parse_os_release("");
        assert_eq!(distro.id, "linux");
        assert_eq!(distro.version_id, "");
        assert_eq!(distro.pretty_name, "linux");
        assert!(distro.id_like.is_empty());
    }

    #[test]
    fn parse_os_release_single_quotes() {
        let distro = parse_os_release("ID='debian'\nVERSION_ID='12'");
        assert_eq!(distro.id, "debian");
        assert_eq!(distro.version_id, "12");
    }

    #[test]
    fn apt_policy_not_installed() {
        let out = r#"vlc:
  Installed: (none)
  Candidate: 3.0.20-1
  Version table:
     3.0.20-1 500
        500 http://archive.ubuntu.com/ubuntu noble/universe amd64 Packages
"#;
        let p = parse_apt_policy(out);
        assert_eq!(p.installed, None);
        assert_eq!(p.candidate.as_deref(), Some("3.0.20-1"));
        assert!(!p.is_up_to_date());
    }

    #[test]
    fn apt_policy_installed_and_current() {
        let out = "git:\n  Installed: 1:2.43.0-1\n  Candidate: 1:2.43.0-1\n";
        let p = parse_apt_policy(out);
        assert!(
            p.is_up_to_date(),
            "epoch-qualified versions keep their colon"
        );
        assert_eq!(p.installed.as_deref(), Some("1:2.43.0-1"));
    }

    #[test]
    fn apt_policy_unknown_package_is_empty() {
        let p = parse_apt_policy("");
        assert_eq!(p, AptPolicy::default());
        let p = parse_apt_policy("ghost:\n  Installed: (none)\n  Candidate: (none)\n");
        assert_eq!(p.candidate, None);
    }

    #[test]
    fn flatpak_version_field() {
        let out = r#"
Thunderbird - Email client

        ID: org.mozilla.Thunderbird
       Ref: app/org.mozilla.Thunderbird/x86_64/stable
      Arch: x86_64
    Branch: stable
   Version: 128.3.1esr
   License: MPL-2.0
"#;
        assert_eq!(parse_flatpak_version(out).as_deref(), Some("128.3.1esr"));
        assert_eq!(parse_flatpak_version("ID: x.y.z\n"), None);
    }

    #[test]
    fn tags_lose_leading_v() {
        assert_eq!(version_from_tag("v1.3.2"), "1.3.2");
        assert_eq!(version_from_tag("1.3.2"), "1.3.2");
        assert_eq!(version_from_tag("nightly"), "nightly");
        assert_eq!(version_from_tag("vendor-1"), "vendor-1");
    }

    #[test]
    fn classify_lock_contention_as_transient() {
        let out = "E: Could not get lock /var/lib/dpkg/lock-frontend. It is held by process 1234 (unattended-upgr)";
        assert_eq!(classify_failure_output(out), FailureClass::Transient);
        let out = "E: Unable to acquire the dpkg frontend lock (/var/lib/dpkg/lock-frontend), is another process using it?";
        assert_eq!(classify_failure_output(out), FailureClass::Transient);
    }

    #[test]
    fn classify_signature_problems_as_verification() {
        let out = "W: GPG error: https://repo.example stable InRelease: The following signatures couldn't be verified because the public key is not available: NO_PUBKEY 1234ABCD";
        assert_eq!(classify_failure_output(out), FailureClass::Verification);
        assert_eq!(
            classify_failure_output("E: The repository 'x' is not signed."),
            FailureClass::Verification
        );
    }

    #[test]
    fn classify_missing_package_as_permanent() {
        assert_eq!(
            classify_failure_output("E: Unable to locate package doesnotexist"),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_failure_output("E: Package 'foo' has no installation candidate"),
            FailureClass::Permanent
        );
        assert_eq!(
            classify_failure_output("error: No remote refs found similar to 'org.nope.App'"),
            FailureClass::Permanent
        );
    }

    #[test]
    fn classify_network_as_transient() {
        assert_eq!(
            classify_failure_output("Err:1 http://archive.ubuntu.com Temporary failure resolving 'archive.ubuntu.com'"),
            FailureClass::Transient
        );
    }

    #[test]
    fn classify_unknown_as_permanent() {
        assert_eq!(
            classify_failure_output("something odd happened"),
            FailureClass::Permanent
        );
    }

    #[test]
    fn http_status_classes() {
        assert_eq!(classify_http_status(404), FailureClass::Permanent);
        assert_eq!(classify_http_status(410), FailureClass::Permanent);
        assert_eq!(classify_http_status(429), FailureClass::Transient);
        assert_eq!(classify_http_status(503), FailureClass::Transient);
    }

    #[test]
    fn dpkg_dependency_problems() {
        let out = "dpkg: dependency problems prevent configuration of zoom:\n zoom depends on libxcb-xtest0; however:\n  Package libxcb-xtest0 is not installed.";
        assert!(is_dependency_problem(out));
        assert!(!is_dependency_problem("Setting up zoom (6.0.2) ..."));
    }

    #[test]
    fn dpkg_query_only_counts_installed_packages() {
        assert_eq!(
            parse_dpkg_query("installed 1.3.2\n"),
            Some("1.3.2".to_string())
        );
        assert_eq!(parse_dpkg_query("config-files 1.3.1"), None);
        assert_eq!(parse_dpkg_query("not-installed "), None);
        assert_eq!(parse_dpkg_query(""), None);
    }

    #[test]
    fn upstream_version_drops_epoch_and_revision() {
        assert_eq!(upstream_version("1:2.3.4-1ubuntu1"), "2.3.4");
        assert_eq!(upstream_version("1.3.2"), "1.3.2");
        assert_eq!(upstream_version("5.17.11.3835"), "5.17.11.3835");
        assert_eq!(upstream_version("2.0-rc1-2"), "2.0-rc1");
    }
}
