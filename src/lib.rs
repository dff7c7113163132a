pub mod api;
pub mod engine;
pub mod installation;
pub mod models;
pub mod settings;
pub mod utils;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use api::installer::{Orchestrator, RunPaths};
use api::updates::{SystemVersions, UpdateReport};
use engine::{registry, CancelToken};
use models::responses::{ProgressPayload, RunReport, RunStatus};
use models::step::Step;
use settings::Settings;
use utils::logging::{
    format_human_readable_log, format_json_log, parse_log_metadata, LogLevel, RotatingLogFile,
    JSON_LOG_FILE, TEXT_LOG_FILE,
};

fn human_line(record: &log::Record, message: &std::fmt::Arguments) -> String {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let meta = parse_log_metadata(&message.to_string());
    format_human_readable_log(
        &timestamp_local.to_string(),
        LogLevel::from_record(record.level(), meta.success),
        record.target(),
        &meta.message,
        meta.phase.as_deref(),
        meta.step.as_deref(),
    )
}

/// Initialise logging: human-readable lines to stdout, JSON lines and text to rotating files
/// under the log folder. Returns the log folder.
pub fn init_logging(settings: &Settings, debug: bool) -> Result<PathBuf> {
    let paths = RunPaths::from_settings(settings)?;
    let max_bytes = settings.logging.max_log_bytes();

    let json_file: Box<dyn Write + Send> = Box::new(
        RotatingLogFile::open(paths.log_dir.join(JSON_LOG_FILE), max_bytes)
            .context("Failed to open JSON log file")?,
    );
    let txt_file: Box<dyn Write + Send> = Box::new(
        RotatingLogFile::open(paths.log_dir.join(TEXT_LOG_FILE), max_bytes)
            .context("Failed to open text log file")?,
    );

    let stdout_level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        // HTTP plumbing is too chatty at debug
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("hyper_util", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(
            fern::Dispatch::new()
                .level(stdout_level)
                .format(|out, message, record| {
                    out.finish(format_args!("{}", human_line(record, message)))
                })
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .level(settings.logging.level_filter())
                .format(|out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let meta = parse_log_metadata(&message.to_string());
                    let json_line = format_json_log(
                        &timestamp_utc,
                        LogLevel::from_record(record.level(), meta.success),
                        record.target(),
                        &meta.message,
                        meta.phase.as_deref(),
                        meta.step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line))
                })
                .chain(json_file),
        )
        .chain(
            fern::Dispatch::new()
                .level(settings.logging.level_filter())
                .format(|out, message, record| {
                    out.finish(format_args!("{}\n", human_line(record, message)))
                })
                .chain(txt_file),
        )
        .apply()
        .context("Failed to install logger")?;

    info!(
        "[PHASE: init] [STEP: logging] Logging initialized (log_dir={:?}, max_bytes={})",
        paths.log_dir, max_bytes
    );
    Ok(paths.log_dir)
}

/// Print artifacts of earlier runs, newest first.
pub fn run_view_logs(settings: &Settings) -> Result<()> {
    let paths = RunPaths::from_settings(settings)?;
    let artifacts = api::logs::collect_artifacts(&paths.log_dir, &paths.checkpoint)?;
    print!("{}", api::logs::render_listing(&paths.log_dir, &artifacts));
    Ok(())
}

pub fn render_steps(steps: &[Step]) -> String {
    let mut out = String::new();
    for step in steps {
        let chain: Vec<String> = step
            .backends
            .iter()
            .map(|b| format!("{} ({})", b.kind, b.target.label()))
            .collect();
        let _ = writeln!(
            out,
            "{:<32} {:<9} {}\n{:<42} -> {}",
            step.id,
            step.phase.as_str(),
            step.description,
            "",
            chain.join(" | ")
        );
    }
    out
}

pub fn run_list_steps(settings: &Settings) -> Result<()> {
    let steps = registry::build(settings).context("Invalid step registry")?;
    print!("{}", render_steps(&steps));
    println!("{} steps", steps.len());
    Ok(())
}

pub fn run_print_config(settings: &Settings) -> Result<()> {
    print!("{}", settings.to_toml()?);
    Ok(())
}

const BAR_TEMPLATE: &str = "{spinner} [{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}";

/// Compare installed versions with what each catalog source offers. Installs nothing.
pub async fn run_check_updates(settings: &Settings) -> Result<Vec<UpdateReport>> {
    let source = SystemVersions::from_settings(settings)?;
    let reports = api::updates::check_updates(settings, &source).await;
    print!("{}", api::updates::render_reports(&reports));
    Ok(reports)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .map(|s| s.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

/// Run the installer on the current runtime with a terminal progress bar. Ctrl-C requests
/// cooperative cancellation; SIGUSR1 pauses the run at the next step boundary, and a second
/// SIGUSR1 resumes it.
pub async fn run_install(settings: Settings, fresh: bool) -> Result<RunReport> {
    let cancel = CancelToken::new();
    let bar = progress_bar();

    let bar_for_events = bar.clone();
    let emitter = Arc::new(move |p: ProgressPayload| {
        bar_for_events.set_position(p.percent.clamp(0, 100) as u64);
        bar_for_events.set_message(format!("[{}/{}] {}", p.current_step, p.total_steps, p.message));
        if p.severity == "error" {
            bar_for_events.println(format!("  ! {}", p.message));
        }
    });

    let orchestrator = Orchestrator::for_host(settings)?
        .fresh(fresh)
        .cancel_token(cancel.clone())
        .on_progress(emitter);

    let ctrl_c_token = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[PHASE: install] [STEP: cancel] Ctrl-C received; stopping after the current step");
            ctrl_c_token.cancel();
        }
    });

    #[cfg(unix)]
    let pause_toggle = {
        let token = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut usr1 = match signal(SignalKind::user_defined1()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("[PHASE: install] [STEP: pause] SIGUSR1 unavailable: {}", e);
                    return;
                }
            };
            while usr1.recv().await.is_some() {
                token.toggle_pause();
            }
        })
    };

    let report = orchestrator.run().await;
    ctrl_c.abort();
    #[cfg(unix)]
    pause_toggle.abort();
    bar.finish_and_clear();

    match report.status {
        RunStatus::Fatal => error!(
            "[PHASE: done] [STEP: report] {}",
            report.fatal_reason.as_deref().unwrap_or("fatal error")
        ),
        _ => info!(
            "[PHASE: done] [STEP: report] {} succeeded, {} failed (status={}, summary={:?})",
            report.success_count,
            report.failure_count,
            report.status.as_str(),
            report.artifacts.summary_text
        ),
    }
    Ok(report)
}

/// Process exit code for a finished run.
pub fn exit_code(report: &RunReport) -> i32 {
    match report.status {
        RunStatus::Fatal => 2,
        RunStatus::Cancelled => 130,
        RunStatus::Completed if report.failure_count > 0 => 1,
        RunStatus::Completed => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::responses::RunArtifacts;

    fn report(status: RunStatus, failures: u32) -> RunReport {
        let now = chrono::Utc::now();
        RunReport {
            run_id: "r".to_string(),
            status,
            fatal_reason: None,
            success_count: 1,
            failure_count: failures,
            entries: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            artifacts: RunArtifacts::default(),
        }
    }

    #[test]
    fn exit_codes_reflect_status() {
        assert_eq!(exit_code(&report(RunStatus::Completed, 0)), 0);
        assert_eq!(exit_code(&report(RunStatus::Completed, 2)), 1);
        assert_eq!(exit_code(&report(RunStatus::Fatal, 0)), 2);
        assert_eq!(exit_code(&report(RunStatus::Cancelled, 0)), 130);
    }

    #[test]
    fn default_registry_renders_every_step() {
        let steps = registry::build(&Settings::default()).expect("registry");
        let text = render_steps(&steps);
        for step in &steps {
            assert!(text.contains(&step.id));
        }
        assert!(text.contains("direct-download"));
    }
}
