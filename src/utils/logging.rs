// Logging utilities
// Structured logging with JSON and human-readable formats, plus size-based file rotation

use chrono::Local;
use log::Level;
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Rotation threshold used when the configuration does not override it.
pub const DEFAULT_MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// JSON-lines log under the log folder.
pub const JSON_LOG_FILE: &str = "lumi-setup.log";
/// Human-readable log under the log folder.
pub const TEXT_LOG_FILE: &str = "lumi-setup.txt";

/// Severity as it appears in log files and the GUI log view.
///
/// `log` has no notion of SUCCESS; an INFO record tagged `[SUCCESS]` is promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn from_record(level: Level, success_tag: bool) -> Self {
        match level {
            Level::Error => LogLevel::Error,
            Level::Warn => LogLevel::Warning,
            Level::Info if success_tag => LogLevel::Success,
            Level::Info => LogLevel::Info,
            Level::Debug | Level::Trace => LogLevel::Debug,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        }
    }
}

/// Tags lifted out of a log message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogMetadata {
    pub phase: Option<String>,
    pub step: Option<String>,
    pub success: bool,
    pub message: String,
}

fn extract_tag(message: &str, tag: &str) -> (Option<String>, String) {
    let Some(start) = message.find(tag) else {
        return (None, message.to_string());
    };
    let Some(end) = message[start..].find(']') else {
        return (None, message.to_string());
    };
    let value = message[start + tag.len()..start + end].trim().to_string();
    let cleaned = format!("{} {}", &message[..start], &message[start + end + 1..])
        .trim()
        .to_string();
    (Some(value), cleaned)
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...], [STEP: ...] and the bare [SUCCESS] marker
pub fn parse_log_metadata(message: &str) -> LogMetadata {
    let (phase, cleaned) = extract_tag(message, "[PHASE:");
    let (step, mut cleaned) = extract_tag(&cleaned, "[STEP:");

    let mut success = false;
    if let Some(pos) = cleaned.find("[SUCCESS]") {
        success = true;
        cleaned = format!(
            "{} {}",
            &cleaned[..pos],
            &cleaned[pos + "[SUCCESS]".len()..]
        )
        .trim()
        .to_string();
    }

    LogMetadata {
        phase,
        step,
        success,
        message: cleaned,
    }
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: LogLevel,
    source: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "source": source,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }

    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: LogLevel,
    source: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }

    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", source, message));
    log_line
}

/// Name a rotated log file: `lumi-setup.log` -> `lumi-setup-20260101-120000.log`.
pub fn rotated_file_name(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("log");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, stamp, ext),
        None => format!("{}-{}", stem, stamp),
    };
    path.with_file_name(name)
}

/// Append-only log file that renames itself away once it grows past `max_bytes`.
pub struct RotatingLogFile {
    path: PathBuf,
    max_bytes: u64,
    written: u64,
    file: File,
}

impl RotatingLogFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if existing >= max_bytes && existing > 0 {
            rotate_in_place(&path)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            written,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        rotate_in_place(&self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn rotate_in_place(path: &Path) -> io::Result<()> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut target = rotated_file_name(path, &stamp);
    let mut counter = 1;
    while target.exists() {
        target = rotated_file_name(path, &format!("{}-{}", stamp, counter));
        counter += 1;
    }
    fs::rename(path, target)
}

impl Write for RotatingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
