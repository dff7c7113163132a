// Input validation utilities
//
// Catalog entries arrive from user-editable configuration; everything that ends up on a
// command line or in a step id goes through here first.

use anyhow::Result;
use regex::Regex;
use url::Url;

/// Validate a Debian package name (policy manual 5.6.1, plus `:arch` qualifiers).
pub fn validate_package_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[a-z0-9][a-z0-9+.\-]+(:[a-z0-9]+)?$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile package regex: {}", e))?;
    if !re.is_match(name) {
        return Err(anyhow::anyhow!("Invalid package name: '{}'", name));
    }
    Ok(())
}

/// Validate a flatpak application id (reverse-DNS, at least three parts).
pub fn validate_flatpak_id(app_id: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z_][A-Za-z0-9_\-]*){2,}$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile app id regex: {}", e))?;
    if !re.is_match(app_id) {
        return Err(anyhow::anyhow!("Invalid flatpak application id: '{}'", app_id));
    }
    Ok(())
}

/// Validate a download URL; only http(s) with a host is accepted.
pub fn validate_download_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow::anyhow!(
                "Unsupported URL scheme '{}' in '{}'",
                other, raw
            ))
        }
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(anyhow::anyhow!("URL has no host: '{}'", raw));
    }
    Ok(url)
}

/// Validate an `owner/name` release repository reference.
pub fn validate_release_repo(repo: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile repo regex: {}", e))?;
    if !re.is_match(repo) {
        return Err(anyhow::anyhow!(
            "Release repository must look like owner/name: '{}'",
            repo
        ));
    }
    Ok(())
}

/// Validate a sha256 hex digest.
pub fn validate_sha256_hex(digest: &str) -> Result<()> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow::anyhow!("Invalid sha256 digest: '{}'", digest));
    }
    Ok(())
}

/// Lower-case slug usable inside a step id.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
