// Attempt and ledger outcome models

use serde::{Deserialize, Serialize};

use super::step::{BackendKind, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Unavailable,
    Transient,
    Permanent,
    Verification,
}

/// One backend invocation inside the retry/fallback policy. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub backend: BackendKind,
    /// 1-based attempt number against this backend.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
    pub relaxed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub step_id: String,
    pub description: String,
    pub phase: Phase,
    pub status: StepStatus,
    /// Failed: verbatim reason. Skipped: why.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_used: Option<BackendKind>,
    pub attempts: u32,
    pub duration_ms: u64,
}
