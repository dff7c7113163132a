// Run summary
//
// Built from the ledger only. Failed steps carry their reason verbatim. Written next to the logs
// as JSON (for the GUI "Results" view) and as plain text.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::ledger::ResultLedger;
use crate::models::outcome::StepStatus;
use crate::models::responses::RunStatus;
use crate::models::step::BackendKind;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub total_steps: usize,
    pub completed: usize,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Portion of `succeeded`/`failed` recorded by an interrupted run this one resumed.
    pub carried_over_succeeded: u32,
    pub carried_over_failed: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SucceededItem {
    pub step_id: String,
    pub description: String,
    pub backend: Option<BackendKind>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub step_id: String,
    pub description: String,
    pub reason: String,
    pub attempts: u32,
    /// Failed in the interrupted run this one resumed.
    pub carried_over: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: SummaryStats,
    pub options: BTreeMap<String, String>,
    pub succeeded: Vec<SucceededItem>,
    pub failed: Vec<FailedItem>,
}

pub struct SummaryInput<'a> {
    pub run_id: &'a str,
    pub status: RunStatus,
    pub fatal_reason: Option<String>,
    pub system: Option<String>,
    pub total_steps: usize,
    pub baseline: (u32, u32),
    pub options: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Summary {
    pub fn from_ledger(input: SummaryInput<'_>, ledger: &ResultLedger) -> Self {
        let succeeded = ledger
            .with_status(StepStatus::Success)
            .map(|e| SucceededItem {
                step_id: e.step_id.clone(),
                description: e.description.clone(),
                backend: e.backend_used,
                attempts: e.attempts,
                duration_ms: e.duration_ms,
            })
            .collect();
        let failed = ledger
            .with_status(StepStatus::Failed)
            .map(|e| FailedItem {
                step_id: e.step_id.clone(),
                description: e.description.clone(),
                reason: e.reason.clone().unwrap_or_default(),
                attempts: e.attempts,
                carried_over: ledger.is_carried_over(&e.step_id),
            })
            .collect();

        let duration_ms = (input.finished_at - input.started_at)
            .num_milliseconds()
            .max(0) as u64;

        Summary {
            run_id: input.run_id.to_string(),
            status: input.status,
            fatal_reason: input.fatal_reason,
            system: input.system,
            started_at: input.started_at,
            finished_at: input.finished_at,
            duration_ms,
            stats: SummaryStats {
                total_steps: input.total_steps,
                completed: ledger.len(),
                succeeded: ledger.success_count(),
                failed: ledger.failure_count(),
                skipped: ledger.skipped_count(),
                carried_over_succeeded: input.baseline.0,
                carried_over_failed: input.baseline.1,
            },
            options: input.options,
            succeeded,
            failed,
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Lumi Setup - Installation Summary");
        let _ = writeln!(out, "=================================");
        let _ = writeln!(out, "Run:      {}", self.run_id);
        let _ = writeln!(out, "Status:   {}", self.status.as_str());
        if let Some(reason) = &self.fatal_reason {
            let _ = writeln!(out, "Reason:   {}", reason);
        }
        if let Some(system) = &self.system {
            let _ = writeln!(out, "System:   {}", system);
        }
        let _ = writeln!(out, "Started:  {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "Finished: {}", self.finished_at.to_rfc3339());
        let _ = writeln!(
            out,
            "Duration: {:.1}s",
            self.duration_ms as f64 / 1000.0
        );

        let s = &self.stats;
        let _ = writeln!(out);
        let _ = writeln!(out, "Statistics");
        let _ = writeln!(out, "  Total steps: {}", s.total_steps);
        let _ = writeln!(out, "  Completed:   {}", s.completed);
        if s.carried_over_succeeded + s.carried_over_failed > 0 {
            let _ = writeln!(
                out,
                "  Succeeded:   {} ({} from the interrupted run)",
                s.succeeded, s.carried_over_succeeded
            );
            let _ = writeln!(
                out,
                "  Failed:      {} ({} from the interrupted run)",
                s.failed, s.carried_over_failed
            );
        } else {
            let _ = writeln!(out, "  Succeeded:   {}", s.succeeded);
            let _ = writeln!(out, "  Failed:      {}", s.failed);
        }
        let _ = writeln!(out, "  Skipped:     {}", s.skipped);

        let _ = writeln!(out);
        let _ = writeln!(out, "Configured options");
        for (k, v) in &self.options {
            let _ = writeln!(out, "  {} = {}", k, v);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Succeeded ({})", self.succeeded.len());
        for item in &self.succeeded {
            let backend = item.backend.map(|b| b.as_str()).unwrap_or("-");
            let _ = writeln!(
                out,
                "  [OK]     {}  {} (via {}, attempts={})",
                item.step_id, item.description, backend, item.attempts
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Failed ({})", self.failed.len());
        for item in &self.failed {
            let origin = if item.carried_over {
                " (from the interrupted run)"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "  [FAILED] {}  {}{}",
                item.step_id, item.description, origin
            );
            let _ = writeln!(out, "           reason: {}", item.reason);
        }
        out
    }

    /// Write `summary-<stamp>.json` and `summary-<stamp>.txt` into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create summary folder {:?}", dir))?;
        let stamp = self.finished_at.format("%Y%m%d-%H%M%S");
        let json_path = dir.join(format!("summary-{}.json", stamp));
        let text_path = dir.join(format!("summary-{}.txt", stamp));

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize summary")?;
        tokio::fs::write(&json_path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", json_path))?;
        tokio::fs::write(&text_path, self.render_text())
            .await
            .with_context(|| format!("Failed to write {:?}", text_path))?;

        info!(
            "[PHASE: summary] [STEP: write] Summary written (json={:?}, text={:?})",
            json_path, text_path
        );
        Ok((json_path, text_path))
    }
}
