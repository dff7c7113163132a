// View-logs mode: list artifacts of earlier runs without installing anything

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::utils::logging::{JSON_LOG_FILE, TEXT_LOG_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Log,
    RotatedLog,
    Summary,
    Checkpoint,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Log => "log",
            ArtifactKind::RotatedLog => "rotated-log",
            ArtifactKind::Summary => "summary",
            ArtifactKind::Checkpoint => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Local>,
}

fn classify(name: &str) -> Option<ArtifactKind> {
    if name == JSON_LOG_FILE || name == TEXT_LOG_FILE {
        return Some(ArtifactKind::Log);
    }
    if name.starts_with("summary-") && (name.ends_with(".json") || name.ends_with(".txt")) {
        return Some(ArtifactKind::Summary);
    }
    if name.starts_with("lumi-setup-") && (name.ends_with(".log") || name.ends_with(".txt")) {
        return Some(ArtifactKind::RotatedLog);
    }
    None
}

fn artifact(kind: ArtifactKind, path: PathBuf) -> Result<RunArtifact> {
    let meta = std::fs::metadata(&path).with_context(|| format!("Failed to stat {:?}", path))?;
    let modified = meta
        .modified()
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());
    Ok(RunArtifact {
        kind,
        path,
        size_bytes: meta.len(),
        modified,
    })
}

/// Logs, rotated logs and summaries under `log_dir` plus the checkpoint, newest first.
pub fn collect_artifacts(log_dir: &Path, checkpoint: &Path) -> Result<Vec<RunArtifact>> {
    let mut found = Vec::new();

    if log_dir.is_dir() {
        let entries = std::fs::read_dir(log_dir)
            .with_context(|| format!("Failed to read log folder {:?}", log_dir))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read log folder {:?}", log_dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(kind) = path.file_name().and_then(|n| n.to_str()).and_then(classify) else {
                continue;
            };
            found.push(artifact(kind, path)?);
        }
    }

    if checkpoint.is_file() {
        found.push(artifact(ArtifactKind::Checkpoint, checkpoint.to_path_buf())?);
    }

    found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(found)
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn render_listing(log_dir: &Path, artifacts: &[RunArtifact]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Log folder: {}", log_dir.display());
    if artifacts.is_empty() {
        let _ = writeln!(out, "No previous runs found.");
        return out;
    }
    for a in artifacts {
        let _ = writeln!(
            out,
            "  {}  {:<11}  {:>9}  {}",
            a.modified.format("%Y-%m-%d %H:%M:%S"),
            a.kind.as_str(),
            human_size(a.size_bytes),
            a.path.display()
        );
    }
    out
}
