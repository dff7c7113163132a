use anyhow::Result;
use std::path::{Path, PathBuf};

const STATE_DIR_NAME: &str = ".lumi-setup";

/// Resolve the per-user state folder (`~/.lumi-setup`).
///
/// An explicit override from configuration always wins.
pub fn resolve_state_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(STATE_DIR_NAME);
    }

    // Fallback: current working directory
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Resolve log folder (absolute path), creating it when missing.
pub fn resolve_log_folder(state_dir: &Path, override_dir: Option<&Path>) -> Result<PathBuf> {
    let log_dir = override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| state_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

/// Resolve the download cache used by direct-download and archive backends.
pub fn resolve_download_folder(state_dir: &Path, override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| state_dir.join("downloads"))
}

pub fn checkpoint_path(state_dir: &Path) -> PathBuf {
    state_dir.join("checkpoint.json")
}

/// Default configuration file (`$XDG_CONFIG_HOME/lumi-setup/config.toml`).
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lumi-setup").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_state_dir_wins() {
        let p = resolve_state_dir(Some(Path::new("/srv/lumi")));
        assert_eq!(p, PathBuf::from("/srv/lumi"));
    }

    #[test]
    fn derived_paths_live_under_state_dir() {
        let state = Path::new("/srv/lumi");
        assert_eq!(
            checkpoint_path(state),
            PathBuf::from("/srv/lumi/checkpoint.json")
        );
        assert_eq!(
            resolve_download_folder(state, None),
            PathBuf::from("/srv/lumi/downloads")
        );
    }

    #[test]
    fn log_folder_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = resolve_log_folder(dir.path(), None).expect("resolve");
        assert!(logs.is_dir());
        assert_eq!(logs, dir.path().join("logs"));
    }
}
